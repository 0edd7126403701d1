//! # weft-node: demo node for the weft engine
//!
//! Runs either side of a weft link from one binary:
//!
//! - **serve**: accept connections and echo every message back.
//! - **send**: dial a peer, send one message and print the echo.
//!
//! The codec stack (framing, TLS or the secure channel) is chosen in the
//! configuration file and must match on both ends.

pub mod config;
pub mod service;
