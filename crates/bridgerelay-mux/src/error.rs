use std::io::ErrorKind;

/// Errors that can occur while framing or multiplexing a connection.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4252 \"BR\")")]
    InvalidMagic,

    /// The frame kind byte is not one of OPEN, MESSAGE or CLOSE.
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A frame payload did not match its kind's layout.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("mux I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// A live channel with the same protocol and id already exists on this connection.
    #[error("duplicate channel for protocol '{protocol}'")]
    DuplicateChannel { protocol: String },

    /// The channel was closed locally or by the remote side.
    #[error("channel is not open")]
    ChannelNotOpen,
}

impl MuxError {
    /// True when the error means the peer has gone away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(err) => matches!(
                err.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_gone_is_disconnect() {
        assert!(MuxError::ConnectionClosed.is_disconnect());
        assert!(MuxError::Io(ErrorKind::BrokenPipe.into()).is_disconnect());
        assert!(MuxError::Io(ErrorKind::ConnectionReset.into()).is_disconnect());
        assert!(!MuxError::Io(ErrorKind::PermissionDenied.into()).is_disconnect());
        assert!(!MuxError::InvalidMagic.is_disconnect());
    }
}
