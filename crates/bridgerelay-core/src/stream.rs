//! Contract for the transport streams the broker creates on pair completion.
//!
//! The broker never touches bytes itself. It asks a [`StreamFactory`] for one
//! stream per slot, bridges the two, and reports each stream's id to its peer.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::RelayError;

/// Decides what happens to a candidate path the transport offers for `stream`.
///
/// Returns `true` if the transport should drop the candidate instead of
/// applying its default acceptance.
pub type Firewall = Arc<dyn Fn(&dyn RelayStream, SocketAddr) -> bool + Send + Sync>;

/// Callback run once when a stream closes, with the error it was destroyed with.
pub type CloseCallback = Box<dyn FnOnce(Option<RelayError>) + Send>;

/// Options passed to [`StreamFactory::create_stream`].
#[derive(Clone)]
pub struct StreamOptions {
    pub firewall: Firewall,
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("firewall", &format_args!("<fn>"))
            .finish()
    }
}

/// A transport-level byte stream.
pub trait RelayStream: Send + Sync {
    /// Transport-assigned id, sent to peers for correlation.
    fn id(&self) -> u64;

    /// Establish the peer-to-peer path to the remote stream `remote_id` at `addr`.
    fn connect(&self, remote_id: u64, addr: SocketAddr);

    /// Forward everything this stream receives to `other`.
    fn relay_to(&self, other: Arc<dyn RelayStream>);

    /// Tear the stream down. Only the first call has any effect.
    fn destroy(&self, err: Option<RelayError>);

    /// Register a callback for when the stream closes. Runs immediately if
    /// the stream is already closed.
    fn on_close(&self, callback: CloseCallback);
}

/// Creates transport streams. Injected into the [`Server`](crate::Server).
pub trait StreamFactory: Send + Sync {
    fn create_stream(&self, options: StreamOptions) -> Arc<dyn RelayStream>;
}

impl<F> StreamFactory for F
where
    F: Fn(StreamOptions) -> Arc<dyn RelayStream> + Send + Sync,
{
    fn create_stream(&self, options: StreamOptions) -> Arc<dyn RelayStream> {
        self(options)
    }
}
