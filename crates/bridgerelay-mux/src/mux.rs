//! Sub-channel multiplexing over one [`Duplex`] connection.
//!
//! Each side creates channels keyed by `(protocol, id)`. A channel becomes
//! open once both sides have sent `Open` for the same key. Frames from the
//! remote that arrive before the local channel is open are buffered and
//! replayed in order.
//!
//! Two threads serve every mux: a reader that decodes frames and updates
//! channel state, and a dispatcher that runs [`ChannelHandler`] callbacks in
//! arrival order with no mux locks held, so handlers may freely send on or
//! close any channel.

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::codec::{
    decode_message, encode_message, Frame, FrameKind, OpenPayload, DEFAULT_MAX_PAYLOAD,
};
use crate::duplex::Duplex;
use crate::error::{MuxError, Result};
use crate::reader::FrameReader;
use crate::writer::FrameWriter;

/// Default cap on remote messages held for a channel that is not open yet.
pub const DEFAULT_MAX_BUFFERED_FRAMES: usize = 256;

/// Configuration for a [`Mux`].
#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
    /// Maximum frame payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Remote messages buffered per not-yet-open channel before dropping.
    pub max_buffered_frames: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_buffered_frames: DEFAULT_MAX_BUFFERED_FRAMES,
        }
    }
}

/// Identity of a sub-channel on one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSpec {
    pub protocol: String,
    pub id: Option<Bytes>,
}

impl ChannelSpec {
    pub fn new(protocol: impl Into<String>, id: Option<Bytes>) -> Self {
        Self {
            protocol: protocol.into(),
            id,
        }
    }
}

/// Callbacks for one channel. All calls come from the mux dispatcher thread.
pub trait ChannelHandler: Send + Sync + 'static {
    /// Both sides have opened the channel; `handshake` is the remote's payload.
    fn on_open(&self, handshake: Option<Bytes>);

    /// A message arrived on the open channel.
    fn on_message(&self, message_type: u8, body: Bytes);

    /// The remote closed the channel, or the connection ended.
    fn on_close(&self);

    /// The connection ended abruptly. Always followed by [`on_close`](Self::on_close).
    fn on_destroy(&self) {}
}

enum Dispatch {
    Open(Arc<dyn ChannelHandler>, Option<Bytes>),
    Message(Arc<dyn ChannelHandler>, u8, Bytes),
    Close(Arc<dyn ChannelHandler>),
    Destroy(Arc<dyn ChannelHandler>),
}

struct LocalEnd {
    spec: ChannelSpec,
    handler: Arc<dyn ChannelHandler>,
    opening: bool,
    opened: bool,
    active: bool,
    remote: Option<u16>,
}

struct RemoteEnd {
    spec: ChannelSpec,
    handshake: Option<Bytes>,
    backlog: VecDeque<(u8, Bytes)>,
    local: Option<u16>,
}

#[derive(Default)]
struct MuxState {
    next_local: u16,
    channels: HashMap<u16, LocalEnd>,
    by_spec: HashMap<ChannelSpec, u16>,
    remotes: HashMap<u16, RemoteEnd>,
    closed: bool,
}

impl MuxState {
    fn allocate(&mut self) -> Result<u16> {
        for _ in 0..=u16::MAX as usize {
            let candidate = self.next_local;
            self.next_local = self.next_local.wrapping_add(1);
            if !self.channels.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(MuxError::Malformed("no free channel numbers".to_string()))
    }
}

type Attachments = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

struct MuxInner {
    writer: Mutex<FrameWriter<Box<dyn Write + Send>>>,
    state: Mutex<MuxState>,
    dispatch: Mutex<Option<Sender<Dispatch>>>,
    shutdown: Box<dyn Fn() -> std::io::Result<()> + Send + Sync>,
    attachments: Mutex<Attachments>,
    config: MuxConfig,
}

/// A multiplexed connection. Cheap to clone; all clones share one connection.
///
/// The connection stays up until either side shuts it down or
/// [`destroy`](Mux::destroy) is called.
#[derive(Clone)]
pub struct Mux {
    inner: Arc<MuxInner>,
}

/// Handle to one sub-channel of a [`Mux`].
#[derive(Clone)]
pub struct Channel {
    inner: Arc<MuxInner>,
    local: u16,
    spec: ChannelSpec,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Mux {
    /// Wrap a connected stream with default configuration.
    pub fn new<S: Duplex>(stream: S) -> Result<Self> {
        Self::with_config(stream, MuxConfig::default())
    }

    /// Wrap a connected stream and start the reader and dispatcher threads.
    pub fn with_config<S: Duplex>(stream: S, config: MuxConfig) -> Result<Self> {
        let read_half = stream.split_clone()?;
        let control = stream.split_clone()?;
        let (tx, rx) = mpsc::channel();

        let writer: Box<dyn Write + Send> = Box::new(stream);
        let inner = Arc::new(MuxInner {
            writer: Mutex::new(FrameWriter::with_max_payload(
                writer,
                config.max_payload_size,
            )),
            state: Mutex::new(MuxState::default()),
            dispatch: Mutex::new(Some(tx)),
            shutdown: Box::new(move || control.shutdown_both()),
            attachments: Mutex::new(HashMap::new()),
            config,
        });

        thread::Builder::new()
            .name("bridgerelay-mux-dispatch".to_string())
            .spawn(move || run_dispatcher(rx))?;

        let reader = FrameReader::with_max_payload(read_half, config.max_payload_size);
        let reader_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name("bridgerelay-mux-reader".to_string())
            .spawn(move || run_reader(reader_inner, reader))?;

        Ok(Self { inner })
    }

    /// Register a sub-channel. It is not announced until [`Channel::open`].
    ///
    /// Fails with [`MuxError::DuplicateChannel`] if a live channel with the
    /// same spec already exists on this connection.
    pub fn create_channel(
        &self,
        spec: ChannelSpec,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Channel> {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;

        if state.closed {
            return Err(MuxError::ConnectionClosed);
        }
        if state.by_spec.contains_key(&spec) {
            return Err(MuxError::DuplicateChannel {
                protocol: spec.protocol,
            });
        }

        let local = state.allocate()?;
        let remote = state
            .remotes
            .iter_mut()
            .find(|(_, end)| end.local.is_none() && end.spec == spec)
            .map(|(number, end)| {
                end.local = Some(local);
                *number
            });

        state.channels.insert(
            local,
            LocalEnd {
                spec: spec.clone(),
                handler,
                opening: false,
                opened: false,
                active: false,
                remote,
            },
        );
        state.by_spec.insert(spec.clone(), local);
        debug!(channel = local, protocol = %spec.protocol, "channel created");

        Ok(Channel {
            inner: Arc::clone(&self.inner),
            local,
            spec,
        })
    }

    /// Shut the connection down. Every live channel sees `on_destroy` then `on_close`.
    pub fn destroy(&self) {
        if let Err(err) = (self.inner.shutdown)() {
            trace!(error = %err, "shutdown on already closed connection");
        }
    }

    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Number of live local channels.
    pub fn channel_count(&self) -> usize {
        lock(&self.inner.state).channels.len()
    }

    /// The value of type `T` attached to this connection, if any.
    pub fn attachment<T: Any + Clone + Send + Sync>(&self) -> Option<T> {
        lock(&self.inner.attachments)
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Return the attached `T`, or attach the one produced by `init`.
    ///
    /// Check and insert happen under one lock, so concurrent callers agree
    /// on a single value.
    pub fn get_or_attach<T, E>(
        &self,
        init: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        T: Any + Clone + Send + Sync,
    {
        let mut attachments = lock(&self.inner.attachments);
        if let Some(existing) = attachments
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
        {
            return Ok(existing.clone());
        }
        let value = init()?;
        attachments.insert(TypeId::of::<T>(), Box::new(value.clone()));
        Ok(value)
    }

    /// Remove and return the attached `T`.
    pub fn detach<T: Any + Send + Sync>(&self) -> Option<T> {
        lock(&self.inner.attachments)
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// Whether two handles refer to the same connection.
    pub fn same_connection(&self, other: &Mux) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("closed", &self.is_closed())
            .field("channels", &self.channel_count())
            .finish()
    }
}

impl Channel {
    /// Announce the channel to the remote side with an optional handshake payload.
    ///
    /// Opening twice is a no-op.
    pub fn open(&self, handshake: Option<Bytes>) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(MuxError::ConnectionClosed);
            }
            let Some(end) = state.channels.get_mut(&self.local) else {
                return Err(MuxError::ChannelNotOpen);
            };
            if end.opened || end.opening {
                return Ok(());
            }
            end.opening = true;
        }

        // Socket writes never happen under the state lock.
        let written = OpenPayload {
            protocol: self.spec.protocol.clone(),
            id: self.spec.id.clone(),
            handshake,
        }
        .encode()
        .and_then(|payload| self.inner.write(FrameKind::Open, self.local, &payload));

        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        let Some(end) = state.channels.get_mut(&self.local) else {
            written?;
            return Err(MuxError::ChannelNotOpen);
        };
        end.opening = false;
        written?;
        end.opened = true;

        self.inner.try_activate(state, self.local);
        Ok(())
    }

    /// Send one typed message on the channel.
    pub fn send(&self, message_type: u8, body: &[u8]) -> Result<()> {
        {
            let state = lock(&self.inner.state);
            match state.channels.get(&self.local) {
                Some(end) if end.opened && !state.closed => {}
                _ => return Err(MuxError::ChannelNotOpen),
            }
        }
        let payload = encode_message(message_type, body);
        self.inner.write(FrameKind::Message, self.local, &payload)
    }

    /// Close the channel and release its spec for reuse. Idempotent.
    ///
    /// The local handler is not notified.
    pub fn close(&self) {
        let announced = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;

            let Some(end) = state.channels.remove(&self.local) else {
                return;
            };
            state.by_spec.remove(&end.spec);
            if let Some(remote) = end.remote {
                state.remotes.remove(&remote);
            }
            (end.opened || end.opening) && !state.closed
        };
        if announced {
            if let Err(err) = self.inner.write(FrameKind::Close, self.local, &[]) {
                debug!(channel = self.local, error = %err, "close frame not delivered");
            }
        }
        debug!(channel = self.local, protocol = %self.spec.protocol, "channel closed");
    }

    /// Whether both sides have opened this channel and it is still live.
    pub fn is_open(&self) -> bool {
        let state = lock(&self.inner.state);
        !state.closed
            && state
                .channels
                .get(&self.local)
                .is_some_and(|end| end.active)
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    /// The connection this channel belongs to.
    pub fn mux(&self) -> Mux {
        Mux {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("local", &self.local)
            .field("protocol", &self.spec.protocol)
            .finish()
    }
}

impl MuxInner {
    fn write(&self, kind: FrameKind, channel: u16, payload: &[u8]) -> Result<()> {
        lock(&self.writer).send(kind, channel, payload)
    }

    fn dispatch(&self, event: Dispatch) {
        if let Some(tx) = lock(&self.dispatch).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Deliver `on_open` plus any backlog once both sides have opened `local`.
    fn try_activate(&self, state: &mut MuxState, local: u16) {
        let Some(end) = state.channels.get_mut(&local) else {
            return;
        };
        if end.active || !end.opened {
            return;
        }
        let Some(remote) = end.remote.and_then(|number| state.remotes.get_mut(&number)) else {
            return;
        };

        end.active = true;
        debug!(channel = local, protocol = %end.spec.protocol, "channel open");
        self.dispatch(Dispatch::Open(
            Arc::clone(&end.handler),
            remote.handshake.clone(),
        ));
        for (message_type, body) in remote.backlog.drain(..) {
            self.dispatch(Dispatch::Message(
                Arc::clone(&end.handler),
                message_type,
                body,
            ));
        }
    }

    fn handle_frame(&self, frame: Frame) -> Result<()> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let mut close_reply = None;

        match frame.kind {
            FrameKind::Open => {
                if state.remotes.contains_key(&frame.channel) {
                    return Err(MuxError::Malformed(format!(
                        "remote channel {} opened twice",
                        frame.channel
                    )));
                }
                let open = OpenPayload::decode(frame.payload)?;
                let spec = ChannelSpec {
                    protocol: open.protocol,
                    id: open.id,
                };
                let local = state.by_spec.get(&spec).copied().filter(|number| {
                    state
                        .channels
                        .get(number)
                        .is_some_and(|end| end.remote.is_none())
                });
                trace!(remote = frame.channel, protocol = %spec.protocol, matched = local.is_some(), "remote open");

                state.remotes.insert(
                    frame.channel,
                    RemoteEnd {
                        spec,
                        handshake: open.handshake,
                        backlog: VecDeque::new(),
                        local,
                    },
                );
                if let Some(local) = local {
                    if let Some(end) = state.channels.get_mut(&local) {
                        end.remote = Some(frame.channel);
                    }
                    self.try_activate(state, local);
                }
            }
            FrameKind::Message => {
                let (message_type, body) = decode_message(frame.payload)?;
                let Some(remote) = state.remotes.get_mut(&frame.channel) else {
                    trace!(remote = frame.channel, "message for unknown channel dropped");
                    return Ok(());
                };
                let active = remote
                    .local
                    .and_then(|local| state.channels.get(&local))
                    .filter(|end| end.active);

                match active {
                    Some(end) => self.dispatch(Dispatch::Message(
                        Arc::clone(&end.handler),
                        message_type,
                        body,
                    )),
                    None if remote.backlog.len() < self.config.max_buffered_frames => {
                        remote.backlog.push_back((message_type, body));
                    }
                    None => {
                        warn!(remote = frame.channel, "backlog full, dropping message");
                    }
                }
            }
            FrameKind::Close => {
                let Some(remote) = state.remotes.remove(&frame.channel) else {
                    return Ok(());
                };
                let Some(end) = remote.local.and_then(|local| state.channels.remove(&local)) else {
                    return Ok(());
                };
                state.by_spec.remove(&end.spec);
                if let Some(local) = remote.local {
                    debug!(channel = local, protocol = %end.spec.protocol, "channel closed by remote");
                    if end.opened || end.opening {
                        close_reply = Some(local);
                    }
                }
                self.dispatch(Dispatch::Close(end.handler));
            }
        }
        drop(guard);

        if let Some(local) = close_reply {
            if let Err(err) = self.write(FrameKind::Close, local, &[]) {
                debug!(channel = local, error = %err, "close reply not delivered");
            }
        }
        Ok(())
    }

    fn teardown(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        state.by_spec.clear();
        state.remotes.clear();

        let handlers: Vec<_> = state.channels.drain().map(|(_, end)| end.handler).collect();
        for handler in handlers {
            self.dispatch(Dispatch::Destroy(Arc::clone(&handler)));
            self.dispatch(Dispatch::Close(handler));
        }
        lock(&self.dispatch).take();
    }
}

fn run_reader<R: Read>(inner: Arc<MuxInner>, mut reader: FrameReader<R>) {
    let reason = loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(err) => break err,
        };
        if let Err(err) = inner.handle_frame(frame) {
            warn!(error = %err, "protocol violation, dropping connection");
            break err;
        }
    };

    if reason.is_disconnect() {
        debug!("connection closed");
    } else {
        debug!(error = %reason, "connection ended");
    }
    if let Err(err) = (inner.shutdown)() {
        trace!(error = %err, "shutdown after reader exit");
    }
    inner.teardown();
}

fn run_dispatcher(rx: Receiver<Dispatch>) {
    for event in rx {
        match event {
            Dispatch::Open(handler, handshake) => handler.on_open(handshake),
            Dispatch::Message(handler, message_type, body) => {
                handler.on_message(message_type, body)
            }
            Dispatch::Close(handler) => handler.on_close(),
            Dispatch::Destroy(handler) => handler.on_destroy(),
        }
    }
}
