//! Minimal relay broker: accepts connections on a Unix socket and pairs
//! clients that present the same token.
//!
//! Run with:
//!   cargo run -p bridgerelay --example relay-server
//!
//! In two other terminals, with the same token (see `bridgerelay token`):
//!   cargo run -p bridgerelay --features cli -- pair <socket> --token <hex> --initiator
//!   cargo run -p bridgerelay --features cli -- pair <socket> --token <hex>

use std::fs;
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use bridgerelay::{ChannelOptions, MemoryStreamFactory, Mux, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("bridgerelay-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("relay.sock");

    let listener = UnixListener::bind(&sock_path)?;
    eprintln!("Listening on {}", sock_path.display());

    let server = Server::new(Arc::new(MemoryStreamFactory::new()));

    for stream in listener.incoming() {
        let mux = Mux::new(stream?)?;
        let session = server.accept(&mux, ChannelOptions::default())?;
        eprintln!(
            "Session {} connected ({} live)",
            session.id(),
            server.sessions().len()
        );
    }

    server.close();
    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
