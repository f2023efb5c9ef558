//! In-process [`RelayStream`] implementation.
//!
//! Streams created by one [`MemoryStreamFactory`] can relay bytes to each
//! other. Nothing leaves the process; candidate paths are simulated with
//! [`MemoryStream::offer`].

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::RelayError;
use crate::stream::{CloseCallback, Firewall, RelayStream, StreamFactory, StreamOptions};

type Registry = Arc<Mutex<HashMap<u64, Weak<MemoryStream>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct MemoryState {
    connected: Option<(u64, SocketAddr)>,
    relay: Option<u64>,
    received: BytesMut,
    destroyed: bool,
    error: Option<RelayError>,
    destroy_calls: usize,
    callbacks: Vec<CloseCallback>,
}

/// An in-memory stream.
pub struct MemoryStream {
    id: u64,
    firewall: Option<Firewall>,
    registry: Registry,
    state: Mutex<MemoryState>,
}

impl MemoryStream {
    /// A stream outside any factory, for the client side of a pairing.
    pub fn detached(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            firewall: None,
            registry: Registry::default(),
            state: Mutex::new(MemoryState::default()),
        })
    }

    /// Simulate the transport offering a candidate path. Runs the firewall
    /// and returns its verdict (`true` = dropped). Streams without a firewall
    /// accept everything.
    pub fn offer(&self, addr: SocketAddr) -> bool {
        match &self.firewall {
            Some(firewall) => firewall(self, addr),
            None => false,
        }
    }

    /// Write bytes into the stream. If it relays to another stream, they
    /// arrive there; otherwise they are dropped.
    pub fn write(&self, data: &[u8]) -> Result<(), RelayError> {
        let target = {
            let state = lock(&self.state);
            if state.destroyed {
                return Err(state.error.clone().unwrap_or(RelayError::ChannelClosed));
            }
            state.relay
        };
        let Some(target) = target else {
            return Ok(());
        };
        let peer = lock(&self.registry).get(&target).and_then(Weak::upgrade);
        if let Some(peer) = peer {
            peer.receive(data);
        }
        Ok(())
    }

    fn receive(&self, data: &[u8]) {
        let mut state = lock(&self.state);
        if !state.destroyed {
            state.received.extend_from_slice(data);
        }
    }

    /// Drain everything received so far.
    pub fn take_received(&self) -> Bytes {
        lock(&self.state).received.split().freeze()
    }

    /// The `(remote_id, addr)` of the last [`connect`](RelayStream::connect).
    pub fn connected(&self) -> Option<(u64, SocketAddr)> {
        lock(&self.state).connected
    }

    /// Id of the stream this one relays to.
    pub fn relay_target(&self) -> Option<u64> {
        lock(&self.state).relay
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.state).destroyed
    }

    /// The error the stream was destroyed with.
    pub fn error(&self) -> Option<RelayError> {
        lock(&self.state).error.clone()
    }

    /// How many times `destroy` was called, effective or not.
    pub fn destroy_calls(&self) -> usize {
        lock(&self.state).destroy_calls
    }
}

impl RelayStream for MemoryStream {
    fn id(&self) -> u64 {
        self.id
    }

    fn connect(&self, remote_id: u64, addr: SocketAddr) {
        trace!(stream = self.id, remote = remote_id, %addr, "memory stream connect");
        lock(&self.state).connected = Some((remote_id, addr));
    }

    fn relay_to(&self, other: Arc<dyn RelayStream>) {
        lock(&self.state).relay = Some(other.id());
    }

    fn destroy(&self, err: Option<RelayError>) {
        let callbacks = {
            let mut state = lock(&self.state);
            state.destroy_calls += 1;
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.error = err.clone();
            mem::take(&mut state.callbacks)
        };
        trace!(stream = self.id, error = ?err, "memory stream destroyed");
        lock(&self.registry).remove(&self.id);
        for callback in callbacks {
            callback(err.clone());
        }
    }

    fn on_close(&self, callback: CloseCallback) {
        let mut state = lock(&self.state);
        if state.destroyed {
            let err = state.error.clone();
            drop(state);
            callback(err);
        } else {
            state.callbacks.push(callback);
        }
    }
}

impl fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryStream")
            .field("id", &self.id)
            .field("relay", &state.relay)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

/// Creates [`MemoryStream`]s with sequential ids.
///
/// The factory only holds weak references: a stream is forgotten once it is
/// destroyed or its last owner drops it.
pub struct MemoryStreamFactory {
    next_id: AtomicU64,
    registry: Registry,
    created: AtomicU64,
}

impl MemoryStreamFactory {
    pub fn new() -> Self {
        Self::with_first_id(1)
    }

    /// Start numbering streams at `first_id`.
    pub fn with_first_id(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
            registry: Registry::default(),
            created: AtomicU64::new(0),
        }
    }

    /// Total number of streams created, live or not.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Streams that are neither destroyed nor dropped, in id order.
    pub fn streams(&self) -> Vec<Arc<MemoryStream>> {
        let mut live: Vec<_> = lock(&self.registry)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        live.sort_by_key(|stream| stream.id);
        live
    }

    /// Look up a live stream by id.
    pub fn stream(&self, id: u64) -> Option<Arc<MemoryStream>> {
        lock(&self.registry).get(&id).and_then(Weak::upgrade)
    }
}

impl Default for MemoryStreamFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFactory for MemoryStreamFactory {
    fn create_stream(&self, options: StreamOptions) -> Arc<dyn RelayStream> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(MemoryStream {
            id,
            firewall: Some(options.firewall),
            registry: Arc::clone(&self.registry),
            state: Mutex::new(MemoryState::default()),
        });
        {
            let mut registry = lock(&self.registry);
            registry.retain(|_, weak| weak.strong_count() > 0);
            registry.insert(id, Arc::downgrade(&stream));
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        stream
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn options() -> StreamOptions {
        StreamOptions {
            firewall: Arc::new(|stream: &dyn RelayStream, addr| {
                stream.connect(99, addr);
                false
            }),
        }
    }

    #[test]
    fn ids_are_sequential() {
        let factory = MemoryStreamFactory::with_first_id(10);
        let a = factory.create_stream(options());
        let b = factory.create_stream(options());
        assert_eq!((a.id(), b.id()), (10, 11));
        assert_eq!(factory.streams().len(), 2);
        assert_eq!(factory.created(), 2);
    }

    #[test]
    fn destroyed_and_dropped_streams_are_released() {
        let factory = MemoryStreamFactory::new();
        for _ in 0..1000 {
            let stream = factory.create_stream(options());
            stream.destroy(None);
            assert_eq!(Arc::strong_count(&stream), 1);
        }
        assert_eq!(factory.created(), 1000);
        assert!(factory.streams().is_empty());
        assert!(lock(&factory.registry).is_empty());

        for _ in 0..10 {
            drop(factory.create_stream(options()));
        }
        let kept = factory.create_stream(options());
        assert_eq!(lock(&factory.registry).len(), 1);
        assert_eq!(factory.streams().len(), 1);
        assert_eq!(factory.stream(kept.id()).map(|s| s.id), Some(kept.id()));
    }

    #[test]
    fn offer_runs_firewall() {
        let factory = MemoryStreamFactory::new();
        let _held = factory.create_stream(options());
        let stream = factory.stream(1).unwrap();

        assert!(!stream.offer(addr()));
        assert_eq!(stream.connected(), Some((99, addr())));
    }

    #[test]
    fn relayed_bytes_arrive_at_target() {
        let factory = MemoryStreamFactory::new();
        let a = factory.create_stream(options());
        let b = factory.create_stream(options());
        a.relay_to(Arc::clone(&b));
        b.relay_to(Arc::clone(&a));

        let (ma, mb) = (factory.stream(1).unwrap(), factory.stream(2).unwrap());
        ma.write(b"ping").unwrap();
        mb.write(b"pong").unwrap();
        assert_eq!(mb.take_received().as_ref(), b"ping");
        assert_eq!(ma.take_received().as_ref(), b"pong");
    }

    #[test]
    fn destroy_is_effective_once() {
        let stream = MemoryStream::detached(5);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        stream.on_close(Box::new(move |err| {
            assert!(matches!(err, Some(RelayError::PairingCancelled)));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        stream.destroy(Some(RelayError::PairingCancelled));
        stream.destroy(Some(RelayError::ChannelClosed));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(stream.destroy_calls(), 2);
        assert!(matches!(stream.error(), Some(RelayError::PairingCancelled)));
        assert!(stream.write(b"late").is_err());
    }

    #[test]
    fn close_callback_after_destroy_runs_immediately() {
        let stream = MemoryStream::detached(6);
        stream.destroy(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        stream.on_close(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
