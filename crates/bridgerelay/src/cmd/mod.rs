use std::path::PathBuf;
use std::time::Duration;

use bridgerelay_core::ChannelOptions;
use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::logging::LogLevel;
use crate::output::OutputFormat;

pub mod pair;
pub mod serve;
pub mod token;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a relay broker on a Unix socket.
    Serve(ServeArgs),
    /// Generate a fresh pairing token.
    Token(TokenArgs),
    /// Pair through a running broker and print the relay stream id.
    Pair(PairArgs),
    /// Show version information.
    Version(VersionArgs),
}

impl Command {
    /// Level used without `--log-level`: info for `serve`, warn for one-shot commands.
    pub fn default_log_level(&self) -> LogLevel {
        match self {
            Command::Serve(_) => LogLevel::Info,
            _ => LogLevel::Warn,
        }
    }
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Token(args) => token::run(args, format),
        Command::Pair(args) => pair::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    #[arg(env = "BRIDGERELAY_SOCKET")]
    pub path: PathBuf,
    /// Relay channel id, when several relays share a connection.
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct TokenArgs {}

#[derive(Args, Debug)]
pub struct PairArgs {
    /// Socket path of the broker.
    #[arg(env = "BRIDGERELAY_SOCKET")]
    pub path: PathBuf,
    /// Shared token as 64 hex characters.
    #[arg(long)]
    pub token: String,
    /// Take the initiator slot (default: responder).
    #[arg(long)]
    pub initiator: bool,
    /// Id of the local stream announced to the broker.
    #[arg(long, default_value = "1")]
    pub stream_id: u64,
    /// Relay channel id, must match the broker's.
    #[arg(long)]
    pub id: Option<String>,
    /// How long to wait for the other side (e.g. 30s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn channel_options(id: Option<&str>) -> ChannelOptions {
    match id {
        Some(id) => ChannelOptions::default().with_id(id.as_bytes().to_vec()),
        None => ChannelOptions::default(),
    }
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}
