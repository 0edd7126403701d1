//! Protocol handlers that sit between the socket and application code.
//!
//! - [`FrameCodec`]: length-prefixed framing
//! - [`TlsCodec`]: TLS via rustls
//! - [`SecureChannelCodec`]: key exchange plus lightweight stream cipher

pub mod frame;
pub mod secure;
pub mod tls;

pub use frame::{FrameAssembly, FrameCodec};
pub use secure::{SecureChannelCodec, SecureSession};
pub use tls::TlsCodec;
