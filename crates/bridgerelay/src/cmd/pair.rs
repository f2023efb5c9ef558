use std::os::unix::net::UnixStream;

use bridgerelay_core::{Client, MemoryStream, RelayError, Token};
use bridgerelay_mux::Mux;
use serde::Serialize;
use tracing::debug;

use crate::cmd::{channel_options, parse_duration, PairArgs};
use crate::exit::{io_error, mux_error, relay_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_record, OutputFormat, Record};

#[derive(Serialize)]
struct PairOutput {
    token_prefix: String,
    role: &'static str,
    local_stream: u64,
    relay_stream: u64,
}

impl Record for PairOutput {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("token_prefix", self.token_prefix.clone()),
            ("role", self.role.to_string()),
            ("local_stream", self.local_stream.to_string()),
            ("relay_stream", self.relay_stream.to_string()),
        ]
    }
}

pub fn run(args: PairArgs, format: OutputFormat) -> CliResult<i32> {
    let token: Token = args
        .token
        .parse()
        .map_err(|err| CliError::new(USAGE, format!("--token: {err}")))?;
    let timeout = parse_duration(&args.timeout)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|err| io_error("runtime setup failed", err))?;

    let stream =
        UnixStream::connect(&args.path).map_err(|err| io_error("connect failed", err))?;
    let mux = Mux::new(stream).map_err(|err| mux_error("connect failed", err))?;
    let client = Client::from(&mux, channel_options(args.id.as_deref()))
        .map_err(|err| relay_error("channel open failed", err))?;

    let request = client
        .pair(
            args.initiator,
            token,
            MemoryStream::detached(args.stream_id),
        )
        .map_err(|err| relay_error("pair failed", err))?;

    let outcome =
        runtime.block_on(async { tokio::time::timeout(timeout, request.result()).await });
    let relay_stream = match outcome {
        Ok(result) => {
            client.close(None);
            result.map_err(|err| relay_error("pairing failed", err))?
        }
        Err(_) => {
            if let Err(err) = client.unpair(token) {
                debug!(error = %err, "unpair after timeout not delivered");
            }
            client.close(None);
            return Err(relay_error("pairing failed", RelayError::Timeout(timeout)));
        }
    };

    let output = PairOutput {
        token_prefix: token.short(),
        role: if args.initiator {
            "initiator"
        } else {
            "responder"
        },
        local_stream: args.stream_id,
        relay_stream,
    };
    print_record(&output, format);
    Ok(SUCCESS)
}
