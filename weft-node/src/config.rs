//! Configuration for the weft node.

use std::path::Path;

use serde::{Deserialize, Serialize};
use weft_core::EngineConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Which protocol sits under the application handler.
    pub codec: CodecKind,
    /// Addresses and timeouts.
    pub network: NetworkConfig,
    /// Engine tuning, passed through unchanged.
    pub engine: EngineConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address `serve` binds.
    pub listen: String,
    /// Address `send` dials.
    pub peer: String,
    /// How long `send` waits for the echo.
    pub reply_timeout_ms: u64,
}

/// Protocol stack under the application handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Length-prefixed frames, see `engine.frame`.
    #[default]
    Frame,
    /// TLS, see `engine.tls`.
    Tls,
    /// Key exchange plus stream cipher, see `engine.secure`.
    Secure,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7400".into(),
            peer: "127.0.0.1:7400".into(),
            reply_timeout_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&NodeConfig::default()).unwrap();
        assert!(text.contains("listen"));
        assert!(text.contains("codec = \"frame\""));
        assert!(text.contains("key_bits"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&NodeConfig::default()).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.reply_timeout_ms, 5000);
        assert_eq!(parsed.codec, CodecKind::Frame);
        assert_eq!(parsed.engine.frame.width, 3);
    }

    #[test]
    fn partial_file() {
        let parsed: NodeConfig = toml::from_str("codec = \"secure\"\n[engine.secure]\nkey_bits = 512\n").unwrap();
        assert_eq!(parsed.codec, CodecKind::Secure);
        assert_eq!(parsed.engine.secure.key_bits, 512);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = NodeConfig::load(Path::new("/definitely/not/here.toml"));
        assert_eq!(cfg.network.listen, "127.0.0.1:7400");
    }
}
