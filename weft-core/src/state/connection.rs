//! Connection lifecycle state machine.
//!
//! Provides a `ConnectionState` enum that models the lifecycle of a
//! single TCP connection, with validated transitions that return
//! `Result` instead of panicking.

use std::time::Instant;

use crate::error::WeftError;

// ── ConnectionState ──────────────────────────────────────────────

/// The current state of a connection.
///
/// ```text
///  Open ──► Closing ──► Closed
///    │                    ▲
///    └────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reads and writes flow normally.
    Open {
        /// When the connection was registered.
        since: Instant,
    },

    /// End of stream seen (or close requested); work already dispatched
    /// still completes, no further reads are scheduled.
    Closing,

    /// Socket released. Terminal.
    Closed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Open {
            since: Instant::now(),
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { .. } => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// How long the connection has been open.
    ///
    /// Returns `None` once closing has begun.
    pub fn open_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Open { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Closing`.
    ///
    /// Valid from: `Open`. Succeeds at most once per connection.
    pub fn begin_close(&mut self) -> Result<(), WeftError> {
        match self {
            Self::Open { .. } => {
                *self = Self::Closing;
                Ok(())
            }
            _ => Err(WeftError::ProtocolViolation(
                "cannot begin close: connection not open",
            )),
        }
    }

    /// Transition to `Closed`.
    ///
    /// Valid from: `Open`, `Closing`.
    pub fn finish_close(&mut self) -> Result<(), WeftError> {
        match self {
            Self::Open { .. } | Self::Closing => {
                *self = Self::Closed;
                Ok(())
            }
            Self::Closed => Err(WeftError::ProtocolViolation(
                "cannot close: connection already closed",
            )),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
