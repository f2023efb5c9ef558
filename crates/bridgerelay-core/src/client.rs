//! Connect side of the control protocol.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bridgerelay_mux::{Channel, ChannelHandler, Mux};
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelOptions, ClientEvent, Subscribers};
use crate::error::{RelayError, Result};
use crate::messages::{Message, PairMessage, UnpairMessage, PAIR, UNPAIR};
use crate::request::Request;
use crate::server::lock;
use crate::stream::RelayStream;
use crate::token::Token;

/// Relay client bound to one connection. Cheap to clone.
///
/// At most one client exists per [`Mux`]; [`Client::from`] returns the
/// existing one.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    channel: OnceLock<Channel>,
    state: Mutex<ClientState>,
    events: Subscribers,
    next_serial: AtomicU64,
}

#[derive(Default)]
struct ClientState {
    requests: HashMap<Token, Pending>,
    closed: bool,
}

struct Pending {
    is_initiator: bool,
    serial: u64,
    tx: oneshot::Sender<Result<u64>>,
}

struct ClientHandler {
    client: Weak<ClientInner>,
}

impl Client {
    /// The client for `mux`, created and its channel opened on first use.
    ///
    /// `options` only apply when the client is created.
    pub fn from(mux: &Mux, options: ChannelOptions) -> Result<Self> {
        mux.get_or_attach(|| Self::create(mux, options))
    }

    fn create(mux: &Mux, options: ChannelOptions) -> Result<Self> {
        let inner = Arc::new(ClientInner {
            channel: OnceLock::new(),
            state: Mutex::new(ClientState::default()),
            events: Subscribers::default(),
            next_serial: AtomicU64::new(1),
        });
        let handler = Arc::new(ClientHandler {
            client: Arc::downgrade(&inner),
        });

        let channel = mux.create_channel(options.spec(), handler)?;
        let channel = inner.channel.get_or_init(|| channel);
        if let Err(err) = channel.open(options.handshake) {
            channel.close();
            return Err(err.into());
        }

        debug!("relay client created");
        Ok(Self { inner })
    }

    /// Register a pairing attempt for `token`, announcing `stream`'s id.
    ///
    /// Fails with [`RelayError::AlreadyPairing`] while another request for
    /// the same token is pending on this client.
    pub fn pair(
        &self,
        is_initiator: bool,
        token: Token,
        stream: Arc<dyn RelayStream>,
    ) -> Result<Request> {
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(RelayError::ChannelClosed);
            }
            if state.requests.contains_key(&token) {
                return Err(RelayError::AlreadyPairing);
            }
            state.requests.insert(
                token,
                Pending {
                    is_initiator,
                    serial,
                    tx,
                },
            );
        }

        Ok(Request::new(
            self.clone(),
            token,
            is_initiator,
            stream,
            serial,
            rx,
        ))
    }

    /// Cancel the pending request for `token`, if any, then tell the broker.
    ///
    /// The unpair message is sent even when nothing was pending locally.
    pub fn unpair(&self, token: Token) -> Result<()> {
        let pending = lock(&self.inner.state).requests.remove(&token);
        if let Some(pending) = pending {
            let _ = pending.tx.send(Err(RelayError::PairingCancelled));
        }
        debug!(token = %token.short(), "unpair");

        let channel = self.inner.channel.get().ok_or(RelayError::ChannelClosed)?;
        channel.send(UNPAIR, &UnpairMessage { token }.encode())?;
        Ok(())
    }

    /// Close the control channel and fail pending requests with `err`, or
    /// [`RelayError::ChannelClosed`] if none is given. Idempotent.
    pub fn close(&self, err: Option<RelayError>) {
        if self.teardown(err.unwrap_or(RelayError::ChannelClosed)) {
            if let Some(channel) = self.inner.channel.get() {
                channel.close();
            }
            self.inner.events.emit(ChannelEvent::Close);
        }
    }

    /// Close with [`RelayError::ChannelDestroyed`].
    pub fn destroy(&self) {
        self.close(Some(RelayError::ChannelDestroyed));
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Number of unresolved requests.
    pub fn requests_len(&self) -> usize {
        lock(&self.inner.state).requests.len()
    }

    pub fn same(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn announce(&self, token: Token, is_initiator: bool, stream_id: u64, serial: u64) {
        let live = lock(&self.inner.state)
            .requests
            .get(&token)
            .is_some_and(|pending| pending.serial == serial);
        if !live {
            return;
        }

        let Some(channel) = self.inner.channel.get() else {
            return;
        };
        let message = PairMessage::new(is_initiator, token, stream_id);
        match channel.send(PAIR, &message.encode()) {
            Ok(()) => debug!(token = %token.short(), is_initiator, stream = stream_id, "pair sent"),
            Err(err) => self.fail(&token, serial, err.into()),
        }
    }

    pub(crate) fn forget(&self, token: &Token, serial: u64) {
        let mut state = lock(&self.inner.state);
        if state
            .requests
            .get(token)
            .is_some_and(|pending| pending.serial == serial)
        {
            state.requests.remove(token);
        }
    }

    fn fail(&self, token: &Token, serial: u64, err: RelayError) {
        let pending = {
            let mut state = lock(&self.inner.state);
            match state.requests.get(token) {
                Some(pending) if pending.serial == serial => state.requests.remove(token),
                _ => None,
            }
        };
        if let Some(pending) = pending {
            let _ = pending.tx.send(Err(err));
        }
    }

    fn handle_message(&self, message_type: u8, body: &[u8]) {
        match Message::decode(message_type, body) {
            Ok(Message::Pair(message)) => self.on_pair(message),
            Ok(Message::Unpair(message)) => {
                debug!(token = %message.token.short(), "ignoring unpair from broker");
            }
            Err(err) => {
                warn!(error = %err, "malformed control message");
                self.inner.events.emit(ChannelEvent::Error(err.clone()));
                self.close(Some(err));
            }
        }
    }

    fn on_pair(&self, message: PairMessage) {
        let pending = {
            let mut state = lock(&self.inner.state);
            match state.requests.get(&message.token) {
                Some(pending) if pending.is_initiator == message.is_initiator => {
                    state.requests.remove(&message.token)
                }
                _ => None,
            }
        };

        match pending {
            Some(pending) => {
                info!(token = %message.token.short(), relay = message.id, "pairing resolved");
                let _ = pending.tx.send(Ok(message.id));
            }
            None => {
                debug!(token = %message.token.short(), "unexpected pair message ignored");
            }
        }
    }

    fn teardown(&self, err: RelayError) -> bool {
        let requests = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return false;
            }
            state.closed = true;
            mem::take(&mut state.requests)
        };

        debug!(requests = requests.len(), reason = err.code(), "relay client closed");
        for pending in requests.into_values() {
            let _ = pending.tx.send(Err(err.clone()));
        }

        if let Some(mux) = self.inner.channel.get().map(Channel::mux) {
            if mux
                .attachment::<Client>()
                .is_some_and(|client| client.same(self))
            {
                mux.detach::<Client>();
            }
        }
        true
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Client")
            .field("requests", &state.requests.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl ChannelHandler for ClientHandler {
    fn on_open(&self, handshake: Option<Bytes>) {
        if let Some(inner) = self.client.upgrade() {
            debug!("relay channel open");
            inner.events.emit(ChannelEvent::Open { handshake });
        }
    }

    fn on_message(&self, message_type: u8, body: Bytes) {
        if let Some(inner) = self.client.upgrade() {
            Client { inner }.handle_message(message_type, &body);
        }
    }

    fn on_close(&self) {
        if let Some(inner) = self.client.upgrade() {
            Client { inner }.close(None);
        }
    }

    fn on_destroy(&self) {
        if let Some(inner) = self.client.upgrade() {
            inner.events.emit(ChannelEvent::Destroy);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::time::Duration;

    use bridgerelay_mux::ChannelSpec;

    use super::*;
    use crate::channel::PROTOCOL;
    use crate::memory::MemoryStream;
    use crate::token::TOKEN_LEN;

    const WAIT: Duration = Duration::from_secs(5);

    /// Broker side speaking the control protocol by hand.
    struct FakeBroker {
        channel: Channel,
        received: mpsc::Receiver<(u8, Bytes)>,
        mux: Mux,
    }

    struct Forward(Mutex<mpsc::Sender<(u8, Bytes)>>);

    impl ChannelHandler for Forward {
        fn on_open(&self, _handshake: Option<Bytes>) {}

        fn on_message(&self, message_type: u8, body: Bytes) {
            let _ = self.0.lock().unwrap().send((message_type, body));
        }

        fn on_close(&self) {}
    }

    impl FakeBroker {
        fn recv(&self) -> Message {
            let (message_type, body) = self.received.recv_timeout(WAIT).unwrap();
            Message::decode(message_type, &body).unwrap()
        }

        fn ack(&self, is_initiator: bool, token: Token, id: u64) {
            let body = PairMessage::new(is_initiator, token, id).encode();
            self.channel.send(PAIR, &body).unwrap();
        }
    }

    fn connect() -> (Mux, Client, FakeBroker) {
        let (left, right) = UnixStream::pair().unwrap();
        let broker_mux = Mux::new(right).unwrap();
        let (tx, rx) = mpsc::channel();
        let channel = broker_mux
            .create_channel(
                ChannelSpec::new(PROTOCOL, None),
                Arc::new(Forward(Mutex::new(tx))),
            )
            .unwrap();
        channel.open(None).unwrap();

        let mux = Mux::new(left).unwrap();
        let client = Client::from(&mux, ChannelOptions::default()).unwrap();
        (
            mux,
            client,
            FakeBroker {
                channel,
                received: rx,
                mux: broker_mux,
            },
        )
    }

    fn token(byte: u8) -> Token {
        Token::from_bytes([byte; TOKEN_LEN])
    }

    #[test]
    fn one_client_per_connection() {
        let (mux, client, _broker) = connect();
        let again = Client::from(&mux, ChannelOptions::default()).unwrap();
        assert!(client.same(&again));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pair_is_sent_only_when_awaited() {
        let (_mux, client, broker) = connect();
        let tok = token(1);
        let request = client
            .pair(true, tok, MemoryStream::detached(42))
            .unwrap();

        assert_eq!(
            broker.received.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        );

        let pending = tokio::spawn(request.result());
        match broker.recv() {
            Message::Pair(message) => {
                assert_eq!(message, PairMessage::new(true, tok, 42));
            }
            other => panic!("unexpected {other:?}"),
        }

        broker.ack(false, tok, 7);
        broker.ack(true, tok, 9);
        let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), 9);
        assert_eq!(client.requests_len(), 0);
    }

    #[test]
    fn blocking_wait_resolves() {
        let (_mux, client, broker) = connect();
        let tok = token(2);
        let request = client
            .pair(false, tok, MemoryStream::detached(5))
            .unwrap();

        let waiter = std::thread::spawn(move || request.wait());
        assert!(matches!(broker.recv(), Message::Pair(_)));
        broker.ack(false, tok, 11);
        assert_eq!(waiter.join().unwrap().unwrap(), 11);
    }

    #[test]
    fn duplicate_pair_is_rejected_until_dropped() {
        let (_mux, client, broker) = connect();
        let tok = token(3);
        let first = client.pair(true, tok, MemoryStream::detached(1)).unwrap();

        assert!(matches!(
            client.pair(false, tok, MemoryStream::detached(2)),
            Err(RelayError::AlreadyPairing)
        ));

        drop(first);
        assert_eq!(client.requests_len(), 0);
        assert!(client.pair(false, tok, MemoryStream::detached(2)).is_ok());
        assert_eq!(
            broker.received.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn unpair_cancels_and_notifies_broker() {
        let (_mux, client, broker) = connect();
        let tok = token(4);
        let request = client.pair(true, tok, MemoryStream::detached(1)).unwrap();

        client.unpair(tok).unwrap();
        assert!(matches!(request.wait(), Err(RelayError::PairingCancelled)));
        assert_eq!(broker.recv(), Message::Unpair(UnpairMessage { token: tok }));

        client.unpair(token(5)).unwrap();
        assert_eq!(
            broker.recv(),
            Message::Unpair(UnpairMessage { token: token(5) })
        );
    }

    #[test]
    fn connection_loss_fails_requests_and_detaches() {
        let (mux, client, broker) = connect();
        let request = client.pair(true, token(6), MemoryStream::detached(1)).unwrap();
        let events = client.subscribe();

        broker.mux.destroy();

        assert!(matches!(request.wait(), Err(RelayError::ChannelClosed)));
        let mut seen = Vec::new();
        while let Ok(event) = events.recv_timeout(WAIT) {
            let done = matches!(event, ChannelEvent::Close);
            seen.push(event);
            if done {
                break;
            }
        }
        assert!(matches!(seen.as_slice(), [.., ChannelEvent::Destroy, ChannelEvent::Close]));
        assert!(client.is_closed());
        assert!(mux.attachment::<Client>().is_none());
        assert!(matches!(
            client.pair(true, token(7), MemoryStream::detached(2)),
            Err(RelayError::ChannelClosed)
        ));
    }

    #[test]
    fn explicit_close_uses_given_error() {
        let (mux, client, _broker) = connect();
        let request = client.pair(true, token(8), MemoryStream::detached(1)).unwrap();

        client.destroy();
        assert!(matches!(request.wait(), Err(RelayError::ChannelDestroyed)));

        let fresh = Client::from(&mux, ChannelOptions::default()).unwrap();
        assert!(!fresh.same(&client));
    }
}
