//! Accept side of the control protocol and the pairing reconciliation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bridgerelay_mux::{Channel, ChannelHandler, Mux};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelOptions, SessionEvent, Subscribers};
use crate::error::{RelayError, Result};
use crate::messages::{Message, PairMessage, UnpairMessage, PAIR};
use crate::pair::{Role, Slot};
use crate::server::{lock, ServerInner};
use crate::stream::{RelayStream, StreamOptions};
use crate::token::Token;

/// One accepted control connection.
///
/// Cheap to clone. Tracks the pairings it has joined but that are not
/// complete yet, and the relay streams created for it once they are.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    server: Weak<ServerInner>,
    channel: OnceLock<Channel>,
    state: Mutex<SessionState>,
    events: Subscribers,
}

#[derive(Default)]
struct SessionState {
    pending: HashSet<Token>,
    /// Keyed by role too: one session may hold both slots of a token.
    streams: HashMap<(Token, Role), Arc<dyn RelayStream>>,
    closed: bool,
}

struct SessionHandler {
    session: Weak<SessionInner>,
}

/// A completed slot waiting for its acknowledgement.
struct Leg {
    role: Role,
    owner: Session,
    stream: Arc<dyn RelayStream>,
}

impl Session {
    pub(crate) fn bind(
        server: Weak<ServerInner>,
        id: u64,
        mux: &Mux,
        options: &ChannelOptions,
    ) -> Result<Self> {
        let inner = Arc::new(SessionInner {
            id,
            server,
            channel: OnceLock::new(),
            state: Mutex::new(SessionState::default()),
            events: Subscribers::default(),
        });
        let handler = Arc::new(SessionHandler {
            session: Arc::downgrade(&inner),
        });
        let channel = mux.create_channel(options.spec(), handler)?;
        let _ = inner.channel.set(channel);
        Ok(Self { inner })
    }

    pub(crate) fn open(&self, handshake: Option<Bytes>) -> Result<()> {
        match self.inner.channel.get() {
            Some(channel) => channel.open(handshake).map_err(RelayError::from),
            None => Err(RelayError::ChannelClosed),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Close the control channel. Pending pairings are dropped from the
    /// table and relay streams are destroyed with `err`, or
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

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Number of incomplete pairings this session has joined.
    pub fn pending_len(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Number of live relay streams owned by this session.
    pub fn stream_len(&self) -> usize {
        lock(&self.inner.state).streams.len()
    }

    /// The relay stream created for `token`, if pairing completed.
    ///
    /// When this session holds both slots the initiator's stream is returned.
    pub fn stream(&self, token: &Token) -> Option<Arc<dyn RelayStream>> {
        let state = lock(&self.inner.state);
        let found = [Role::Initiator, Role::Responder]
            .into_iter()
            .find_map(|role| state.streams.get(&(*token, role)).cloned());
        found
    }

    /// The relay stream created for one slot of `token`.
    pub fn stream_for(&self, token: &Token, role: Role) -> Option<Arc<dyn RelayStream>> {
        lock(&self.inner.state).streams.get(&(*token, role)).cloned()
    }

    pub(crate) fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn handle_message(&self, message_type: u8, body: &[u8]) {
        match Message::decode(message_type, body) {
            Ok(Message::Pair(message)) => self.on_pair(message),
            Ok(Message::Unpair(message)) => self.on_unpair(message),
            Err(err) => {
                warn!(session = self.id(), error = %err, "malformed control message");
                self.inner.events.emit(ChannelEvent::Error(err.clone()));
                self.close(Some(err));
            }
        }
    }

    fn on_pair(&self, message: PairMessage) {
        let Some(server) = self.inner.server.upgrade() else {
            return;
        };
        let role = Role::from_initiator(message.is_initiator);
        let token = message.token;

        let legs = {
            let mut server_state = lock(&server.state);
            if server_state.closed || self.is_closed() {
                return;
            }

            let pair = server_state.pairing.entry(token).or_default();
            if !pair.claim(role, self.clone(), message.id) {
                debug!(session = self.id(), token = %token.short(), ?role, "slot already claimed");
                return;
            }
            let complete = pair.is_complete();
            lock(&self.inner.state).pending.insert(token);
            debug!(session = self.id(), token = %token.short(), ?role, "pair claimed");

            if !complete {
                return;
            }
            let Some((initiator, responder)) = server_state
                .pairing
                .remove(&token)
                .and_then(|pair| pair.into_complete())
            else {
                return;
            };
            complete_pairing(&server, token, initiator, responder)
        };

        info!(
            token = %token.short(),
            initiator = legs[0].owner.id(),
            responder = legs[1].owner.id(),
            "pairing complete"
        );

        for leg in legs {
            let weak = Arc::downgrade(&leg.owner.inner);
            let stream_id = leg.stream.id();
            let key = (token, leg.role);
            leg.stream.on_close(Box::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    let mut state = lock(&inner.state);
                    if state.streams.get(&key).is_some_and(|s| s.id() == stream_id) {
                        state.streams.remove(&key);
                    }
                }
            }));

            let ack = PairMessage::new(leg.role.is_initiator(), token, stream_id);
            leg.owner.send(PAIR, &ack.encode());
        }
    }

    fn on_unpair(&self, message: UnpairMessage) {
        let token = message.token;

        if let Some(server) = self.inner.server.upgrade() {
            let mut server_state = lock(&server.state);
            if let Some(pair) = server_state.pairing.remove(&token) {
                for (_, slot) in pair.filled() {
                    lock(&slot.owner.inner.state).pending.remove(&token);
                }
                debug!(session = self.id(), token = %token.short(), "pending pairing cancelled");
                return;
            }
        }

        let streams: Vec<_> = {
            let mut state = lock(&self.inner.state);
            let removed = [Role::Initiator, Role::Responder]
                .into_iter()
                .filter_map(|role| state.streams.remove(&(token, role)))
                .collect();
            removed
        };
        for stream in streams {
            debug!(session = self.id(), token = %token.short(), stream = stream.id(), "relay cancelled");
            stream.destroy(Some(RelayError::PairingCancelled));
        }
    }

    /// Release everything this session holds. Returns `false` if it was
    /// already closed.
    fn teardown(&self, err: RelayError) -> bool {
        let server = self.inner.server.upgrade();

        let streams = {
            let mut server_state = server.as_ref().map(|server| lock(&server.state));
            let (pending, streams) = {
                let mut state = lock(&self.inner.state);
                if state.closed {
                    return false;
                }
                state.closed = true;
                (mem::take(&mut state.pending), mem::take(&mut state.streams))
            };

            if let Some(server_state) = server_state.as_mut() {
                for token in &pending {
                    let joined = server_state.pairing.get(token).is_some_and(|pair| {
                        pair.filled().any(|(_, slot)| slot.owner.same(self))
                    });
                    if !joined {
                        continue;
                    }
                    if let Some(pair) = server_state.pairing.remove(token) {
                        for (_, slot) in pair.filled() {
                            if !slot.owner.same(self) {
                                lock(&slot.owner.inner.state).pending.remove(token);
                            }
                        }
                    }
                }
                server_state.sessions.retain(|session| !session.same(self));
            }

            info!(
                session = self.id(),
                pending = pending.len(),
                streams = streams.len(),
                reason = err.code(),
                "session closed"
            );
            streams
        };

        for stream in streams.into_values() {
            stream.destroy(Some(err.clone()));
        }
        true
    }

    fn send(&self, message_type: u8, body: &[u8]) {
        let Some(channel) = self.inner.channel.get() else {
            return;
        };
        if let Err(err) = channel.send(message_type, body) {
            debug!(session = self.id(), error = %err, "control message not delivered");
        }
    }
}

/// Create and bridge one stream per slot, then move the token from each
/// owner's pending set to its stream map. Runs under the server lock.
fn complete_pairing(
    server: &ServerInner,
    token: Token,
    initiator: Slot<Session>,
    responder: Slot<Session>,
) -> [Leg; 2] {
    let create = |role: Role, slot: Slot<Session>| {
        let remote_id = slot.remote_id;
        let stream = server.factory.create_stream(StreamOptions {
            firewall: Arc::new(move |stream: &dyn RelayStream, addr| {
                stream.connect(remote_id, addr);
                false
            }),
        });
        Leg {
            role,
            owner: slot.owner,
            stream,
        }
    };
    let legs = [
        create(Role::Initiator, initiator),
        create(Role::Responder, responder),
    ];

    legs[0].stream.relay_to(Arc::clone(&legs[1].stream));
    legs[1].stream.relay_to(Arc::clone(&legs[0].stream));

    for leg in &legs {
        let mut state = lock(&leg.owner.inner.state);
        state.pending.remove(&token);
        state.streams.insert((token, leg.role), Arc::clone(&leg.stream));
    }
    legs
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("pending", &state.pending.len())
            .field("streams", &state.streams.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl ChannelHandler for SessionHandler {
    fn on_open(&self, handshake: Option<Bytes>) {
        if let Some(inner) = self.session.upgrade() {
            debug!(session = inner.id, "control channel open");
            inner.events.emit(ChannelEvent::Open { handshake });
        }
    }

    fn on_message(&self, message_type: u8, body: Bytes) {
        if let Some(inner) = self.session.upgrade() {
            Session { inner }.handle_message(message_type, &body);
        }
    }

    fn on_close(&self) {
        if let Some(inner) = self.session.upgrade() {
            Session { inner }.close(None);
        }
    }

    fn on_destroy(&self) {
        if let Some(inner) = self.session.upgrade() {
            inner.events.emit(ChannelEvent::Destroy);
        }
    }
}
