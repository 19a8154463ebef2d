//! Unix domain socket implementations of the transport traits.
//!
//! Handy for same-host multiplexing and for tests: `UnixStream::pair()`
//! yields a connected transport pair with no listener involved.

use std::net::Shutdown;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};

use tracing::debug;

use crate::traits::{Transport, TransportListener};

fn describe(addr: std::io::Result<SocketAddr>) -> String {
    match addr {
        Ok(addr) => match addr.as_pathname() {
            Some(path) => format!("unix:{}", path.display()),
            None => "unix:unnamed".to_string(),
        },
        Err(_) => "unix:?".to_string(),
    }
}

impl Transport for UnixStream {
    fn try_clone(&self) -> std::io::Result<Self> {
        UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> std::io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }

    fn local_desc(&self) -> String {
        describe(self.local_addr())
    }

    fn peer_desc(&self) -> String {
        describe(self.peer_addr())
    }
}

impl TransportListener for UnixListener {
    type Stream = UnixStream;

    fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _addr) = UnixListener::accept(self)?;
        debug!("accepted unix transport");
        Ok(stream)
    }

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

    fn local_desc(&self) -> String {
        describe(self.local_addr())
    }
}
