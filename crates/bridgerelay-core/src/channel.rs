use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

use bridgerelay_mux::ChannelSpec;
use bytes::Bytes;

use crate::error::RelayError;

/// Protocol name of the control channel.
pub const PROTOCOL: &str = "bridging-relay";

/// Options for binding a control channel to a connection.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Distinguishes several relay channels sharing one connection.
    pub id: Option<Bytes>,
    /// Payload sent to the remote side when the channel opens.
    pub handshake: Option<Bytes>,
}

impl ChannelOptions {
    pub fn with_id(mut self, id: impl Into<Bytes>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_handshake(mut self, handshake: impl Into<Bytes>) -> Self {
        self.handshake = Some(handshake.into());
        self
    }

    pub(crate) fn spec(&self) -> ChannelSpec {
        ChannelSpec::new(PROTOCOL, self.id.clone())
    }
}

/// Lifecycle notifications for a [`Session`](crate::Session) or [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Both sides opened the control channel.
    Open { handshake: Option<Bytes> },
    /// The control channel closed. Always the last event.
    Close,
    /// The connection was torn down abruptly. Precedes `Close`.
    Destroy,
    /// A non-fatal or closing error, reported before `Close` when there is one.
    Error(RelayError),
}

pub type SessionEvent = ChannelEvent;
pub type ClientEvent = ChannelEvent;

/// Fan-out of events to every live subscriber.
#[derive(Default)]
pub(crate) struct Subscribers {
    senders: Mutex<Vec<Sender<ChannelEvent>>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&self) -> Receiver<ChannelEvent> {
        let (tx, rx) = mpsc::channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: ChannelEvent) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
