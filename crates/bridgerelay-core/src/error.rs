use std::sync::Arc;
use std::time::Duration;

use bridgerelay_mux::MuxError;

/// Errors surfaced by sessions, clients, requests and relay streams.
///
/// `Clone` because one closing error is handed to every resource a channel owns.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    /// The control channel closed while work was still outstanding.
    #[error("channel closed")]
    ChannelClosed,

    /// The control channel was torn down locally.
    #[error("channel destroyed")]
    ChannelDestroyed,

    /// An explicit unpair cancelled a pending attempt or active stream.
    #[error("pairing cancelled")]
    PairingCancelled,

    /// A control channel with the same id is already open on this connection.
    #[error("duplicate channel")]
    DuplicateChannel,

    /// A malformed control message was received.
    #[error("decode error: {0}")]
    Decode(String),

    /// A request for this token is already pending on this client.
    #[error("a pairing request for this token is already pending")]
    AlreadyPairing,

    /// A host-applied deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The underlying connection failed.
    #[error("transport error: {0}")]
    Transport(Arc<MuxError>),
}

impl RelayError {
    /// Stable upper-snake name of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChannelClosed => "CHANNEL_CLOSED",
            Self::ChannelDestroyed => "CHANNEL_DESTROYED",
            Self::PairingCancelled => "PAIRING_CANCELLED",
            Self::DuplicateChannel => "DUPLICATE_CHANNEL",
            Self::Decode(_) => "DECODE_ERROR",
            Self::AlreadyPairing => "ALREADY_PAIRING",
            Self::Timeout(_) => "TIMEOUT",
            Self::Transport(_) => "TRANSPORT_ERROR",
        }
    }
}

impl From<MuxError> for RelayError {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::DuplicateChannel { .. } => Self::DuplicateChannel,
            MuxError::ChannelNotOpen => Self::ChannelClosed,
            other if other.is_disconnect() => Self::ChannelClosed,
            other => Self::Transport(Arc::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_kinds() {
        assert_eq!(RelayError::ChannelClosed.code(), "CHANNEL_CLOSED");
        assert_eq!(RelayError::PairingCancelled.code(), "PAIRING_CANCELLED");
        assert_eq!(RelayError::Decode("short".into()).code(), "DECODE_ERROR");
    }

    #[test]
    fn mux_errors_map_to_relay_kinds() {
        let dup: RelayError = MuxError::DuplicateChannel {
            protocol: "bridging-relay".into(),
        }
        .into();
        assert!(matches!(dup, RelayError::DuplicateChannel));

        let closed: RelayError = MuxError::ConnectionClosed.into();
        assert!(matches!(closed, RelayError::ChannelClosed));

        let gone: RelayError = MuxError::Io(std::io::ErrorKind::BrokenPipe.into()).into();
        assert!(matches!(gone, RelayError::ChannelClosed));

        let io: RelayError = MuxError::Io(std::io::ErrorKind::PermissionDenied.into()).into();
        assert_eq!(io.code(), "TRANSPORT_ERROR");
    }
}
