//! Framed sub-channel multiplexing over a single connected stream.
//!
//! Every frame carries:
//! - A 2-byte magic number ("BR") for stream synchronization
//! - A 1-byte kind (open, message, close)
//! - A 2-byte little-endian channel number, local to the sender
//! - A 4-byte little-endian payload length
//!
//! [`Mux`] sits on top of the framing and gives each `(protocol, id)` pair
//! its own channel with open handshakes, typed messages and close.

pub mod codec;
pub mod duplex;
pub mod error;
pub mod mux;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, decode_message, encode_frame, encode_message, Frame, FrameKind, OpenPayload,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use duplex::Duplex;
pub use error::{MuxError, Result};
pub use mux::{
    Channel, ChannelHandler, ChannelSpec, Mux, MuxConfig, DEFAULT_MAX_BUFFERED_FRAMES,
};
pub use reader::FrameReader;
pub use writer::FrameWriter;
