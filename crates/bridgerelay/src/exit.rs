use std::fmt;
use std::io;
use std::sync::Arc;

use bridgerelay_core::RelayError;
use bridgerelay_mux::MuxError;

/// Paired, served, or printed as asked.
pub const SUCCESS: i32 = 0;
/// The broker is unreachable, or pairing was cancelled or cut off.
pub const FAILURE: i32 = 1;
/// The relay connection broke in a way other than a clean close.
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
/// The peer sent frames or control messages that do not decode.
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
/// `pair` gave up waiting for the other side.
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

/// A failure to report on stderr, with the process exit code it maps to.
#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `"{context}: {err}"` under `code`.
    fn during(code: i32, context: &str, err: impl fmt::Display) -> Self {
        Self::new(code, format!("{context}: {err}"))
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CliError {}

/// Socket errors. A missing or refusing broker socket is an ordinary
/// failure; a bound socket path belongs to the caller to fix.
pub fn io_error(context: &str, err: io::Error) -> CliError {
    use io::ErrorKind::*;

    let code = match err.kind() {
        NotFound | ConnectionRefused => {
            return CliError::during(FAILURE, context, format!("broker not reachable ({err})"));
        }
        AddrInUse => USAGE,
        PermissionDenied => PERMISSION_DENIED,
        TimedOut | WouldBlock => TIMEOUT,
        BrokenPipe | ConnectionReset | ConnectionAborted => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::during(code, context, err)
}

pub fn mux_error(context: &str, err: MuxError) -> CliError {
    let code = match err {
        MuxError::Io(source) => return io_error(context, source),
        MuxError::PayloadTooLarge { .. }
        | MuxError::Malformed(_)
        | MuxError::InvalidMagic
        | MuxError::UnknownKind(_) => DATA_INVALID,
        MuxError::ConnectionClosed | MuxError::ChannelNotOpen => FAILURE,
        MuxError::DuplicateChannel { .. } => USAGE,
    };
    CliError::during(code, context, err)
}

pub fn relay_error(context: &str, err: RelayError) -> CliError {
    let code = match err {
        RelayError::Transport(source) => {
            return match Arc::try_unwrap(source) {
                Ok(source) => mux_error(context, source),
                Err(source) => CliError::during(TRANSPORT_ERROR, context, source),
            };
        }
        RelayError::Timeout(_) => TIMEOUT,
        RelayError::Decode(_) => DATA_INVALID,
        RelayError::AlreadyPairing | RelayError::DuplicateChannel => USAGE,
        RelayError::ChannelClosed | RelayError::ChannelDestroyed | RelayError::PairingCancelled => {
            FAILURE
        }
    };
    CliError::during(code, context, err)
}
