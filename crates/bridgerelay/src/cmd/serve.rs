use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bridgerelay_core::{MemoryStreamFactory, Server};
use bridgerelay_mux::Mux;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cmd::{channel_options, ServeArgs};
use crate::exit::{io_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_record, OutputFormat, Record};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Serialize)]
struct ServeSummary {
    socket: String,
    sessions_accepted: u64,
    sessions_open: usize,
    pairings_pending: usize,
    relays_created: u64,
}

impl Record for ServeSummary {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("socket", self.socket.clone()),
            ("sessions_accepted", self.sessions_accepted.to_string()),
            ("sessions_open", self.sessions_open.to_string()),
            ("pairings_pending", self.pairings_pending.to_string()),
            ("relays_created", self.relays_created.to_string()),
        ]
    }
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    remove_stale_socket(&args.path)?;
    let listener = UnixListener::bind(&args.path).map_err(|err| io_error("bind failed", err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| io_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let factory = Arc::new(MemoryStreamFactory::new());
    let server = Server::new(factory.clone());
    let options = channel_options(args.id.as_deref());
    info!(path = %args.path.display(), "relay listening");

    let mut accepted = 0u64;
    while running.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(io_error("accept failed", err)),
        };

        if let Err(err) = stream.set_nonblocking(false) {
            warn!(error = %err, "dropping connection");
            continue;
        }
        let mux = match Mux::new(stream) {
            Ok(mux) => mux,
            Err(err) => {
                warn!(error = %err, "dropping connection");
                continue;
            }
        };
        match server.accept(&mux, options.clone()) {
            Ok(session) => {
                accepted += 1;
                debug!(session = session.id(), "connection accepted");
            }
            Err(err) => {
                warn!(error = %err, "session rejected");
                mux.destroy();
            }
        }
    }

    let summary = ServeSummary {
        socket: args.path.display().to_string(),
        sessions_accepted: accepted,
        sessions_open: server.sessions().len(),
        pairings_pending: server.pairing_len(),
        relays_created: factory.created(),
    };
    info!("shutting down");
    server.close();
    let _ = fs::remove_file(&args.path);

    print_record(&summary, format);
    Ok(SUCCESS)
}

fn remove_stale_socket(path: &Path) -> CliResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path).map_err(|err| io_error("removing stale socket failed", err))
        }
        Ok(_) => Err(CliError::new(
            USAGE,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error("inspecting socket path failed", err)),
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
