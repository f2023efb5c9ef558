//! Rendezvous pairing for a bridging relay.
//!
//! Two peers that share a [`Token`] each ask a broker to pair them. The
//! broker ([`Server`]) keeps one [`SessionPair`] per token in a shared
//! table. When both the initiator and the responder have claimed their slot,
//! it creates a relay stream for each side through the injected
//! [`StreamFactory`], bridges the two, and answers each peer with the id of
//! its stream.
//!
//! Peers talk to the broker through a [`Client`]. Each call to
//! [`Client::pair`] returns a lazy [`Request`] that sends its `pair` message
//! only once awaited.
//!
//! Control messages travel on a `bridging-relay` channel of a
//! [`bridgerelay_mux::Mux`].

pub mod channel;
pub mod client;
pub mod error;
pub mod memory;
pub mod messages;
pub mod pair;
pub mod request;
pub mod server;
pub mod session;
pub mod stream;
pub mod token;

pub use channel::{ChannelEvent, ChannelOptions, ClientEvent, SessionEvent, PROTOCOL};
pub use client::Client;
pub use error::{RelayError, Result};
pub use memory::{MemoryStream, MemoryStreamFactory};
pub use messages::{Message, PairMessage, UnpairMessage};
pub use pair::{Role, SessionPair, Slot};
pub use request::Request;
pub use server::Server;
pub use session::Session;
pub use stream::{CloseCallback, Firewall, RelayStream, StreamFactory, StreamOptions};
pub use token::{Token, TOKEN_LEN};
