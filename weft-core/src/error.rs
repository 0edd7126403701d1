//! Domain-specific error types for the weft engine.
//!
//! All fallible operations return `Result<T, WeftError>`.
//! No panics on invalid input. Every error is typed and recoverable.

use thiserror::Error;

/// The canonical error type for the weft engine.
#[derive(Debug, Error)]
pub enum WeftError {
    // ── I/O Errors ───────────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection is already closed.
    #[error("channel closed")]
    ChannelClosed,

    // ── Protocol Errors ──────────────────────────────────────────
    /// A frame declared more bytes than the configured limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A read asked for more bytes than the cursor holds.
    #[error("buffer underflow: requested {requested} bytes, {available} available")]
    Underflow { requested: usize, available: usize },

    /// A secure-channel message started with an unknown type byte.
    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// An application-data frame carried an unknown compression flag.
    #[error("unknown compression flag: {0}")]
    UnknownCompressionFlag(u8),

    /// Key material did not have the negotiated length.
    #[error("key length mismatch: expected {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },

    /// Application data arrived before the session key was established.
    #[error("no session key established")]
    NoSessionKey,

    /// The integrity tag of a decrypted frame did not match.
    #[error("integrity check failed")]
    IntegrityCheckFailed,

    /// A compressed payload could not be inflated.
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// The TLS engine rejected a record or state transition.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The TLS handshake could not complete.
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),

    /// A TLS record header declared an impossible length.
    #[error("tls record too large: {0} bytes")]
    TlsRecordTooLarge(usize),

    /// A message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Configuration Errors ─────────────────────────────────────
    /// FrameCodec only supports 1, 2 or 3 byte length fields.
    #[error("invalid length field width: {0} (expected 1..=3)")]
    InvalidLengthWidth(usize),

    /// A pipeline registration broke the terminal-handler rule.
    #[error("invalid pipeline: {0}")]
    Pipeline(&'static str),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    // ── Application Errors ───────────────────────────────────────
    /// No link to the given peer endpoint.
    #[error("unknown peer: {0}")]
    UnknownPeer(std::net::SocketAddr),

    /// A handler reported an application-level failure.
    #[error("handler error: {0}")]
    Handler(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl WeftError {
    /// Whether an unhandled occurrence of this error should close the
    /// connection it was raised on.
    ///
    /// I/O and protocol failures leave the byte stream in an unknown
    /// state; application errors do not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Handler(_)
                | Self::Other(_)
                | Self::Config(_)
                | Self::Pipeline(_)
                | Self::UnknownPeer(_)
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for WeftError {
    fn from(s: String) -> Self {
        WeftError::Other(s)
    }
}

impl From<&str> for WeftError {
    fn from(s: &str) -> Self {
        WeftError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = WeftError::FrameTooLarge { size: 1000, max: 500 };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));

        let e = WeftError::UnknownFrameType(0x42);
        assert!(e.to_string().contains("0x42"));
    }

    #[test]
    fn from_string() {
        let e: WeftError = "something broke".into();
        assert!(matches!(e, WeftError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: WeftError = io_err.into();
        assert!(matches!(e, WeftError::Io(_)));
    }

    #[test]
    fn fatality() {
        assert!(WeftError::NoSessionKey.is_fatal());
        assert!(WeftError::IntegrityCheckFailed.is_fatal());
        assert!(WeftError::ChannelClosed.is_fatal());
        assert!(!WeftError::Handler("bad request".into()).is_fatal());
        assert!(!WeftError::Other("meh".into()).is_fatal());
    }
}
