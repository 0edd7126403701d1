//! Engine configuration.
//!
//! Every section deserializes with `#[serde(default)]`, so a partial TOML
//! document (or none at all) yields a working engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WeftError;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub reactor: ReactorConfig,
    pub pool: WorkerPoolConfig,
    pub frame: FrameConfig,
    pub secure: SecureChannelConfig,
    pub tls: TlsSettings,
    pub peer: PeerConfig,
}

/// Reactor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Event-loop threads per reactor.
    pub threads: usize,
    /// Consecutive empty reads tolerated before a read pass gives up.
    pub read_retries: usize,
    /// Bytes requested from the socket per read call.
    pub read_chunk: usize,
    /// Upper bound on bytes taken from one socket per readiness event.
    pub read_limit: usize,
    /// How long a closing connection may spend flushing queued output.
    pub close_linger_ms: u64,
    /// How long `stop()` waits for connections to tear down.
    pub shutdown_grace_ms: u64,
}

/// Worker pool sizing. `enabled = false` runs every handler inline on the
/// reactor thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub enabled: bool,
    pub core_threads: usize,
    pub max_threads: usize,
    /// Idle time after which threads above the core count exit.
    pub keep_alive_ms: u64,
}

/// Length-prefixed framing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Position of the length field within the header.
    pub offset: usize,
    /// Width of the length field in bytes (1..=3).
    pub width: usize,
    /// Header bytes added to the declared length to get the frame size.
    pub header_len: usize,
    /// Largest frame (header included) accepted from a peer.
    pub max_frame: usize,
    /// Forward payloads only and add headers on write.
    pub strip_header: bool,
}

/// Secure-channel parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecureChannelConfig {
    /// Modulus size of the handshake key pair.
    pub key_bits: usize,
    /// Payloads longer than this are compressed.
    pub compression_threshold: usize,
    /// zstd level used for compression.
    pub compression_level: i32,
    /// Largest application-data body accepted from a peer.
    pub max_frame: usize,
}

/// TLS material and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// "TLS" (any supported version), "TLSv1.2" or "TLSv1.3".
    pub protocol: String,
    /// PEM certificate chain presented by this side.
    pub cert_path: Option<PathBuf>,
    /// PEM private key matching `cert_path`.
    pub key_path: Option<PathBuf>,
    /// PEM bundle of trusted roots for verifying the peer.
    pub ca_path: Option<PathBuf>,
    /// Name the client expects in the server certificate.
    pub server_name: String,
    /// Accept any server certificate.
    pub trust_peer: bool,
}

/// Peer-link settings for [`PeerNode`](crate::network::PeerNode).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Protocol placed in front of the application handlers.
    pub security: LinkSecurity,
}

/// How peer links are protected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkSecurity {
    /// Key exchange plus stream cipher, see `secure`.
    #[default]
    Secure,
    /// TLS with the material in `tls`.
    Tls,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            read_retries: 3,
            read_chunk: 64 * 1024,
            read_limit: 1024 * 1024,
            close_linger_ms: 1000,
            shutdown_grace_ms: 2000,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            enabled: true,
            core_threads: cores,
            max_threads: cores * 2,
            keep_alive_ms: 10_000,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            offset: 0,
            width: 3,
            header_len: 3,
            max_frame: 16 * 1024 * 1024,
            strip_header: true,
        }
    }
}

impl Default for SecureChannelConfig {
    fn default() -> Self {
        Self {
            key_bits: 1024,
            compression_threshold: 1024,
            compression_level: 3,
            max_frame: 64 * 1024 * 1024,
        }
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            protocol: "TLS".into(),
            cert_path: None,
            key_path: None,
            ca_path: None,
            server_name: "localhost".into(),
            trust_peer: false,
        }
    }
}

// ── Validation ───────────────────────────────────────────────────

impl ReactorConfig {
    pub fn close_linger(&self) -> Duration {
        Duration::from_millis(self.close_linger_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<(), WeftError> {
        if self.threads == 0 {
            return Err(WeftError::Config("reactor.threads must be at least 1".into()));
        }
        if self.read_chunk == 0 || self.read_limit == 0 {
            return Err(WeftError::Config(
                "reactor.read_chunk and reactor.read_limit must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl WorkerPoolConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn validate(&self) -> Result<(), WeftError> {
        if self.core_threads == 0 || self.max_threads < self.core_threads {
            return Err(WeftError::Config(format!(
                "pool needs 1 <= core_threads ({}) <= max_threads ({})",
                self.core_threads, self.max_threads
            )));
        }
        Ok(())
    }
}

impl SecureChannelConfig {
    pub fn validate(&self) -> Result<(), WeftError> {
        if self.key_bits < 128 || self.key_bits % 8 != 0 {
            return Err(WeftError::Config(format!(
                "secure.key_bits must be a multiple of 8 and at least 128, got {}",
                self.key_bits
            )));
        }
        Ok(())
    }
}
