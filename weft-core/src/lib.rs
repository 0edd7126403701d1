//! # weft-core
//!
//! Non-blocking TCP engine with a bidirectional handler pipeline.
//!
//! This crate contains:
//! - **Buffer**: `ByteCursor`, a growable read/write byte buffer
//! - **Pipeline**: `Handler`, `Pipeline` and per-connection attachments
//! - **Network**: `Reactor`, `Dispatcher`, `Connection` and the `Server` / `Client` / `PeerNode` façades
//! - **Task**: `WorkerPool`, the bounded pool that runs handler work
//! - **Codec**: `FrameCodec`, `TlsCodec` and `SecureChannelCodec`
//! - **Config**: `EngineConfig`, serde-backed with defaults for every field
//! - **Error**: `WeftError`, a typed, `thiserror`-based error hierarchy

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod state;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use buffer::ByteCursor;
pub use codec::{FrameCodec, SecureChannelCodec, TlsCodec};
pub use config::{
    EngineConfig, FrameConfig, LinkSecurity, PeerConfig, ReactorConfig, SecureChannelConfig, TlsSettings,
    WorkerPoolConfig,
};
pub use error::WeftError;
pub use network::{Client, Connection, ConnectionId, Dispatcher, Mode, PeerNode, Reactor, Server};
pub use pipeline::{Context, Handler, Pipeline, PipelineBuilder};
pub use state::ConnectionState;
pub use task::WorkerPool;
