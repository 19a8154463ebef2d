//! The user-facing channel endpoint.
//!
//! A [`Channel`] is one bidirectional byte stream inside a multiplexed
//! connection. It implements `std::io::Read` and `std::io::Write` with the
//! usual stream contract: reads block only while nothing has been read yet,
//! short reads and writes are normal, `Ok(0)` from `read` is EOF. One
//! reading thread and one writing thread per channel is the supported
//! pattern; the endpoint is not a broadcast primitive.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use crossbeam::channel::{bounded, select, Receiver};
use framemux_transport::Transport;
use framemux_wire::{FramePacket, MAX_WRITE};

use crate::conn::{Core, Outbound};
use crate::error::{Error, Result};
use crate::signal::CloseSignal;

/// One end of a multiplexed channel.
pub struct Channel<T: Transport> {
    core: Arc<Core<T>>,
    id: u16,
    inbound: Receiver<Bytes>,
    current: Bytes,
    closed: CloseSignal,
}

impl<T: Transport> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

/// A channel address: the transport endpoint plus the channel ID.
/// Diagnostic only; channels have no routable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAddr {
    pub transport: String,
    pub channel: u16,
}

impl std::fmt::Display for ChannelAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.transport, self.channel)
    }
}

/// Outcome of waiting for the next inbound chunk.
enum NextChunk {
    Chunk(Bytes),
    Eof,
    WouldBlock,
}

impl<T: Transport> Channel<T> {
    pub(crate) fn new(
        core: Arc<Core<T>>,
        id: u16,
        inbound: Receiver<Bytes>,
        closed: CloseSignal,
    ) -> Self {
        Self {
            core,
            id,
            inbound,
            current: Bytes::new(),
            closed,
        }
    }

    /// The channel's 16-bit ID on its connection.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Whether this endpoint has observed closure (local, peer, or
    /// connection).
    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    pub fn local_addr(&self) -> ChannelAddr {
        ChannelAddr {
            transport: self.core.local_desc(),
            channel: self.id,
        }
    }

    pub fn peer_addr(&self) -> ChannelAddr {
        ChannelAddr {
            transport: self.core.peer_desc(),
            channel: self.id,
        }
    }

    /// Deadlines are not supported on multiplexed channels.
    pub fn set_read_timeout(&self, _timeout: Option<Duration>) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Deadlines are not supported on multiplexed channels.
    pub fn set_write_timeout(&self, _timeout: Option<Duration>) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Close this channel. Idempotent; never fails.
    ///
    /// Sends `CLOSE` to the peer unless the channel or the connection is
    /// already down, then fires the close signal and retires the table
    /// entry. Blocked reads and writes on this channel return afterwards.
    pub fn close(&self) {
        if !self.closed.is_fired() && !self.core.closed.is_fired() {
            select! {
                send(self.core.egress, Outbound::fire_and_forget(FramePacket::close(self.id))) -> _ => (),
                recv(self.closed.observer()) -> _ => (),
                recv(self.core.closed.observer()) -> _ => (),
            }
        }
        self.closed.fire();
        self.core.take_channel(self.id);
    }

    /// Wait for the next inbound chunk.
    ///
    /// `block` follows the read contract: block only while the caller's
    /// buffer is still empty. Closure from any source reads as EOF here;
    /// the already-closed check at `read` entry is the only path that
    /// reports a closed-state error.
    fn next_chunk(&self, block: bool) -> NextChunk {
        if block {
            select! {
                recv(self.inbound) -> chunk => match chunk {
                    Ok(chunk) => NextChunk::Chunk(chunk),
                    Err(_) => NextChunk::Eof,
                },
                recv(self.closed.observer()) -> _ => NextChunk::Eof,
                recv(self.core.closed.observer()) -> _ => NextChunk::Eof,
            }
        } else {
            select! {
                recv(self.inbound) -> chunk => match chunk {
                    Ok(chunk) => NextChunk::Chunk(chunk),
                    Err(_) => NextChunk::Eof,
                },
                recv(self.closed.observer()) -> _ => NextChunk::Eof,
                recv(self.core.closed.observer()) -> _ => NextChunk::Eof,
                default => NextChunk::WouldBlock,
            }
        }
    }

    /// Hand one `DATA` segment (at most [`MAX_WRITE`] bytes) to the writer
    /// thread and wait for its ack.
    fn write_segment(&self, segment: &[u8]) -> Result<()> {
        // Connection closure supersedes channel closure: teardown fires
        // every channel signal, and the write must still report the
        // connection as the cause.
        if self.core.closed.is_fired() {
            return Err(Error::ClosedConn);
        }
        if self.closed.is_fired() {
            return Err(Error::ClosedWrite);
        }

        // Defensive copy: the caller may reuse its buffer as soon as we
        // return, but the packet outlives this call on the egress queue.
        let pkt = FramePacket::data(self.id, Bytes::copy_from_slice(segment));
        let (done_tx, done_rx) = bounded(1);

        select! {
            send(self.core.egress, Outbound { pkt, done: Some(done_tx) }) -> res => {
                if res.is_err() {
                    return Err(Error::ClosedConn);
                }
            }
            recv(self.closed.observer()) -> _ => return Err(Error::ClosedWrite),
            recv(self.core.closed.observer()) -> _ => return Err(Error::ClosedConn),
        }

        match done_rx.recv() {
            Ok(res) => res,
            // Writer exited without acking: the connection is gone.
            Err(_) => Err(Error::ClosedConn),
        }
    }
}

impl<T: Transport> io::Read for Channel<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.is_fired() {
            return Err(Error::ClosedRead.into());
        }

        let mut read = 0;
        while read < buf.len() {
            if self.current.is_empty() {
                match self.next_chunk(read == 0) {
                    NextChunk::Chunk(chunk) => self.current = chunk,
                    NextChunk::Eof => return Ok(read),
                    NextChunk::WouldBlock => return Ok(read),
                }
            }
            let n = self.current.len().min(buf.len() - read);
            buf[read..read + n].copy_from_slice(&self.current[..n]);
            self.current.advance(n);
            read += n;
        }
        Ok(read)
    }
}

impl<T: Transport> io::Write for Channel<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        for segment in buf.chunks(MAX_WRITE) {
            match self.write_segment(segment) {
                Ok(()) => written += segment.len(),
                // Report the prefix that the writer acked; the error
                // resurfaces on the next call.
                Err(_) if written > 0 => return Ok(written),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Writes are acked by the writer thread once they hit the
        // transport; there is nothing buffered here.
        Ok(())
    }
}

impl<T: Transport> Drop for Channel<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Transport> std::fmt::Display for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Channel{{{} -> {} #{}{}}}",
            self.core.local_desc(),
            self.core.peer_desc(),
            self.id,
            if self.is_closed() { " closed" } else { "" }
        )
    }
}
