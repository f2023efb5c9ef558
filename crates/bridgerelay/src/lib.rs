//! Bridging relay: a rendezvous broker for peers that share a secret token.
//!
//! # Crate Structure
//!
//! - [`mux`]: framed sub-channel multiplexing over one connection
//! - [`relay`]: pairing protocol: server, sessions, clients, requests
//!
//! The most used types are re-exported at the root.

/// Re-export multiplexing types.
pub mod mux {
    pub use bridgerelay_mux::*;
}

/// Re-export pairing protocol types.
pub mod relay {
    pub use bridgerelay_core::*;
}

pub use bridgerelay_core::{
    ChannelOptions, Client, MemoryStream, MemoryStreamFactory, RelayError, RelayStream, Request,
    Server, Session, StreamFactory, Token,
};
pub use bridgerelay_mux::{Mux, MuxConfig};
