use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// A connected, already-secured byte stream a [`Mux`](crate::Mux) can run over.
///
/// The mux needs three handles onto the same connection (reader thread,
/// writer, shutdown), so implementors must be cloneable at the OS level.
pub trait Duplex: Read + Write + Send + Sync + 'static {
    /// Create another handle to the same underlying connection.
    fn split_clone(&self) -> io::Result<Self>
    where
        Self: Sized;

    /// Shut the connection down in both directions, waking any blocked reader.
    fn shutdown_both(&self) -> io::Result<()>;
}

#[cfg(unix)]
impl Duplex for std::os::unix::net::UnixStream {
    fn split_clone(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Duplex for TcpStream {
    fn split_clone(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}
