//! TCP implementations of the transport traits.
//!
//! A multiplexed session typically rides on one TCP connection; this module
//! adapts `std::net` types to the engine's seam.

use std::net::{Shutdown, TcpListener, TcpStream};

use tracing::debug;

use crate::traits::{Transport, TransportListener};

impl Transport for TcpStream {
    fn try_clone(&self) -> std::io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> std::io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn local_desc(&self) -> String {
        match self.local_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "tcp:?".to_string(),
        }
    }

    fn peer_desc(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "tcp:?".to_string(),
        }
    }
}

impl TransportListener for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> std::io::Result<TcpStream> {
        let (stream, addr) = TcpListener::accept(self)?;
        debug!(%addr, "accepted tcp transport");
        Ok(stream)
    }

    /// `std::net::TcpListener` has no close method short of dropping it, and
    /// dropping cannot reach a thread parked inside `accept`. Shutting the
    /// socket down at the OS level makes that accept return an error.
    #[cfg(unix)]
    fn shutdown(&self) -> std::io::Result<()> {
        use std::os::fd::AsRawFd;

        // SAFETY: the fd is owned by this listener and remains open for the
        // duration of the call; shutdown(2) does not invalidate it.
        let rc = unsafe { libc::shutdown(self.as_raw_fd(), libc::SHUT_RDWR) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn shutdown(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "listener shutdown is only supported on unix",
        ))
    }

    fn local_desc(&self) -> String {
        match self.local_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "tcp:?".to_string(),
        }
    }
}
