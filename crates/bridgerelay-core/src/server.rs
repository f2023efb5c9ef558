use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bridgerelay_mux::Mux;
use tracing::{debug, info};

use crate::channel::ChannelOptions;
use crate::error::{RelayError, Result};
use crate::pair::SessionPair;
use crate::session::Session;
use crate::stream::StreamFactory;
use crate::token::Token;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Broker side of the relay: every accepted session plus the shared pairing table.
///
/// Lock order is server state first, then any session state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) factory: Arc<dyn StreamFactory>,
    pub(crate) state: Mutex<ServerState>,
    next_session_id: AtomicU64,
}

#[derive(Default)]
pub(crate) struct ServerState {
    pub(crate) pairing: HashMap<Token, SessionPair<Session>>,
    pub(crate) sessions: Vec<Session>,
    pub(crate) closed: bool,
}

impl Server {
    /// Create a server that asks `factory` for relay streams on pair completion.
    pub fn new(factory: Arc<dyn StreamFactory>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                factory,
                state: Mutex::new(ServerState::default()),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Bind a new session to `mux` and open its control channel.
    ///
    /// The session is torn down when the connection closes.
    pub fn accept(&self, mux: &Mux, options: ChannelOptions) -> Result<Session> {
        if self.is_closed() {
            return Err(RelayError::ChannelClosed);
        }

        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::bind(Arc::downgrade(&self.inner), id, mux, &options)?;

        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                drop(state);
                session.close(None);
                return Err(RelayError::ChannelClosed);
            }
            state.sessions.push(session.clone());
        }

        if let Err(err) = session.open(options.handshake) {
            session.close(Some(err.clone()));
            return Err(err);
        }

        info!(session = id, "session accepted");
        Ok(session)
    }

    /// Close every session and clear the pairing table. Idempotent.
    pub fn close(&self) {
        let sessions = {
            let mut state = lock(&self.inner.state);
            if !state.closed {
                debug!(pairing = state.pairing.len(), "clearing pairing table");
            }
            state.closed = true;
            state.pairing.clear();
            mem::take(&mut state.sessions)
        };

        if !sessions.is_empty() {
            info!(sessions = sessions.len(), "closing server");
        }
        for session in sessions {
            session.close(None);
        }
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Session> {
        lock(&self.inner.state).sessions.clone()
    }

    /// Whether `token` has an incomplete pairing in the table.
    pub fn is_pairing(&self, token: &Token) -> bool {
        lock(&self.inner.state).pairing.contains_key(token)
    }

    /// Number of incomplete pairings.
    pub fn pairing_len(&self) -> usize {
        lock(&self.inner.state).pairing.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Server")
            .field("sessions", &state.sessions.len())
            .field("pairing", &state.pairing.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::memory::MemoryStreamFactory;

    fn server() -> Server {
        Server::new(Arc::new(MemoryStreamFactory::new()))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn accept_registers_session() {
        let server = server();
        let (left, _right) = UnixStream::pair().unwrap();
        let mux = Mux::new(left).unwrap();

        let session = server.accept(&mux, ChannelOptions::default()).unwrap();
        assert_eq!(server.sessions().len(), 1);
        assert_eq!(server.sessions()[0].id(), session.id());
    }

    #[test]
    fn second_session_on_same_id_is_duplicate() {
        let server = server();
        let (left, _right) = UnixStream::pair().unwrap();
        let mux = Mux::new(left).unwrap();

        server.accept(&mux, ChannelOptions::default()).unwrap();
        let err = server.accept(&mux, ChannelOptions::default()).unwrap_err();
        assert!(matches!(err, RelayError::DuplicateChannel));
        assert!(server
            .accept(&mux, ChannelOptions::default().with_id("second"))
            .is_ok());
        assert_eq!(server.sessions().len(), 2);
    }

    #[test]
    fn close_is_idempotent_and_rejects_accept() {
        let server = server();
        let (left, _right) = UnixStream::pair().unwrap();
        let mux = Mux::new(left).unwrap();
        let session = server.accept(&mux, ChannelOptions::default()).unwrap();

        server.close();
        server.close();
        assert!(server.sessions().is_empty());
        assert!(session.is_closed());
        assert!(matches!(
            server.accept(&mux, ChannelOptions::default().with_id("late")),
            Err(RelayError::ChannelClosed)
        ));
    }

    #[test]
    fn connection_loss_removes_session() {
        let server = server();
        let (left, right) = UnixStream::pair().unwrap();
        let mux = Mux::new(left).unwrap();
        server.accept(&mux, ChannelOptions::default()).unwrap();

        drop(right);
        wait_until(|| server.sessions().is_empty());
    }
}
