use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::client::Client;
use crate::error::{RelayError, Result};
use crate::stream::RelayStream;
use crate::token::Token;

/// One pending pairing attempt made through a [`Client`].
///
/// Nothing is sent until the result is awaited with [`result`](Self::result)
/// or [`wait`](Self::wait). Resolves to the id of the relay stream the
/// broker created for this side. Dropping an unresolved request withdraws
/// it from the client without telling the broker.
pub struct Request {
    client: Client,
    token: Token,
    is_initiator: bool,
    stream: Arc<dyn RelayStream>,
    serial: u64,
    rx: Option<oneshot::Receiver<Result<u64>>>,
    announced: bool,
}

impl Request {
    pub(crate) fn new(
        client: Client,
        token: Token,
        is_initiator: bool,
        stream: Arc<dyn RelayStream>,
        serial: u64,
        rx: oneshot::Receiver<Result<u64>>,
    ) -> Self {
        Self {
            client,
            token,
            is_initiator,
            stream,
            serial,
            rx: Some(rx),
            announced: false,
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// The local stream whose id is announced to the broker.
    pub fn stream(&self) -> &Arc<dyn RelayStream> {
        &self.stream
    }

    /// Announce the attempt and wait for the broker's answer.
    pub async fn result(mut self) -> Result<u64> {
        self.announce();
        let Some(rx) = self.rx.as_mut() else {
            return Err(RelayError::ChannelClosed);
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RelayError::ChannelClosed),
        }
    }

    /// Blocking variant of [`result`](Self::result).
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn wait(mut self) -> Result<u64> {
        self.announce();
        let Some(rx) = self.rx.take() else {
            return Err(RelayError::ChannelClosed);
        };
        match rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(RelayError::ChannelClosed),
        }
    }

    fn announce(&mut self) {
        if !self.announced {
            self.announced = true;
            self.client.announce(
                self.token,
                self.is_initiator,
                self.stream.id(),
                self.serial,
            );
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.client.forget(&self.token, self.serial);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("token", &self.token)
            .field("is_initiator", &self.is_initiator)
            .field("stream", &self.stream.id())
            .field("announced", &self.announced)
            .finish()
    }
}
