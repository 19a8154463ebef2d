//! The initiator side of a connection.
//!
//! A [`Dialer`] wraps an established transport and opens channels over it.
//! Each `dial` enqueues a one-shot reply slot and an `OPEN` packet; the
//! reader thread matches `OPEN` replies to pending slots in strict FIFO
//! order, which holds because all our `OPEN`s leave through one serialized
//! writer and the peer replies through its own.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, select, Receiver, Sender};
use framemux_transport::Transport;
use framemux_wire::{FrameCmd, FramePacket, FrameStatus};
use serde::Serialize;
use tracing::debug;

use crate::channel::Channel;
use crate::conn::{self, Core, Outbound, DIAL_EGRESS_CAP, PENDING_DIAL_CAP};
use crate::error::{Error, Result};

/// Basic state of an initiator connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Info {
    /// Bytes read from the transport, headers included.
    #[serde(rename = "read")]
    pub bytes_read: u64,
    /// Bytes written to the transport, headers included.
    #[serde(rename = "written")]
    pub bytes_written: u64,
    /// Channels currently registered on the connection.
    #[serde(rename = "channels")]
    pub channels_open: usize,
}

impl std::fmt::Display for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{Info written={}, read={}, open={}}}",
            self.bytes_written, self.bytes_read, self.channels_open
        )
    }
}

type DialSlot<T> = Sender<Result<Channel<T>>>;

/// Opens channels over one multiplexed connection.
pub struct Dialer<T: Transport> {
    core: Arc<Core<T>>,
    pending: Sender<DialSlot<T>>,
}

impl<T: Transport> Dialer<T> {
    /// Wrap an established transport as the initiator of a multiplexed
    /// connection, spawning its reader and writer threads.
    pub fn new(transport: T) -> Result<Self> {
        let reader_half = transport.try_clone()?;
        let writer_half = transport.try_clone()?;

        let (egress_tx, egress_rx) = bounded(DIAL_EGRESS_CAP);
        let (pending_tx, pending_rx) = bounded(PENDING_DIAL_CAP);
        let core = Arc::new(Core::new(transport, egress_tx));

        let rcore = Arc::clone(&core);
        thread::spawn(move || reader_loop(reader_half, rcore, pending_rx));
        let wcore = Arc::clone(&core);
        thread::spawn(move || conn::writer_loop(writer_half, &wcore, egress_rx));

        Ok(Self {
            core,
            pending: pending_tx,
        })
    }

    /// Open a new channel.
    ///
    /// Blocks until the peer answers our `OPEN`. Every step races the
    /// connection's close signal: closure before the `OPEN` is submitted
    /// reports [`Error::ClosedConn`], closure while awaiting the reply
    /// reports [`Error::DialInterrupted`]. A peer that refuses the open
    /// reports [`Error::OpenRejected`] with the peer's reason.
    pub fn dial(&self) -> Result<Channel<T>> {
        let (slot_tx, slot_rx) = bounded(1);

        select! {
            send(self.pending, slot_tx) -> res => {
                if res.is_err() {
                    return Err(Error::ClosedConn);
                }
            }
            recv(self.core.closed.observer()) -> _ => return Err(Error::ClosedConn),
        }

        select! {
            send(self.core.egress, Outbound::fire_and_forget(FramePacket::open())) -> res => {
                if res.is_err() {
                    return Err(Error::ClosedConn);
                }
            }
            recv(self.core.closed.observer()) -> _ => return Err(Error::ClosedConn),
        }

        select! {
            recv(slot_rx) -> reply => match reply {
                Ok(reply) => reply,
                Err(_) => Err(Error::DialInterrupted),
            },
            recv(self.core.closed.observer()) -> _ => Err(Error::DialInterrupted),
        }
    }

    /// Connection counters.
    pub fn info(&self) -> Info {
        Info {
            bytes_read: self.core.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.core.bytes_written.load(Ordering::Relaxed),
            channels_open: self.core.channels_open(),
        }
    }

    /// Close the connection and every channel on it. Idempotent; further
    /// calls succeed with no effect.
    pub fn close(&self) -> Result<()> {
        self.core.close();
        Ok(())
    }
}

fn reader_loop<T: Transport>(
    mut transport: T,
    core: Arc<Core<T>>,
    pending: Receiver<DialSlot<T>>,
) {
    let result: Result<()> = (|| {
        loop {
            let pkt = conn::read_packet(&mut transport, &core)?;
            match pkt.cmd {
                FrameCmd::Open => handle_open_reply(&core, pkt, &pending)?,
                FrameCmd::Close => conn::handle_peer_close(&core, &pkt),
                FrameCmd::Data => conn::deliver_data(&core, pkt),
            }
        }
    })();
    if let Err(err) = result {
        debug!(peer = %core.peer_desc(), %err, "initiator reader exiting");
    }
    core.close();
}

/// Match an `OPEN` reply against the oldest pending dial.
///
/// A reply with nothing pending means the peer fabricated an open; that is
/// fatal to the connection, not to the process.
fn handle_open_reply<T: Transport>(
    core: &Arc<Core<T>>,
    pkt: FramePacket,
    pending: &Receiver<DialSlot<T>>,
) -> Result<()> {
    let slot = pending
        .try_recv()
        .map_err(|_| Error::Protocol("open reply with no pending dial".to_string()))?;

    if pkt.status == FrameStatus::Success {
        let (inbound, closed) = core.register(pkt.channel);
        let channel = Channel::new(Arc::clone(core), pkt.channel, inbound, closed);
        if slot.send(Ok(channel)).is_err() {
            // The dialer already gave up; dropping the endpoint emits CLOSE.
            debug!(channel = pkt.channel, "dial abandoned before its reply");
        }
    } else {
        let reason = String::from_utf8_lossy(&pkt.data).into_owned();
        let _ = slot.send(Err(Error::OpenRejected(reason)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;

    use framemux_wire::{FramePacket, Header, HEADER_LEN};

    use super::*;

    fn read_pkt(stream: &mut UnixStream) -> FramePacket {
        let mut hdr = [0u8; HEADER_LEN];
        stream.read_exact(&mut hdr).unwrap();
        let header = Header::parse(&hdr).unwrap();
        let mut data = vec![0u8; header.len as usize];
        stream.read_exact(&mut data).unwrap();
        FramePacket::from_parts(header, data.into())
    }

    fn write_pkt(stream: &mut UnixStream, pkt: &FramePacket) {
        stream.write_all(&pkt.bytes()).unwrap();
    }

    #[test]
    fn dial_matches_open_reply_and_channel_echoes() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let dialer = Dialer::new(local).unwrap();

        let peer = thread::spawn(move || {
            let open = read_pkt(&mut remote);
            assert_eq!(open.cmd, FrameCmd::Open);
            write_pkt(&mut remote, &FramePacket::open_ok(5));

            let data = read_pkt(&mut remote);
            assert_eq!(data.cmd, FrameCmd::Data);
            assert_eq!(data.channel, 5);
            write_pkt(&mut remote, &FramePacket::data(5, data.data));
            remote
        });

        let mut channel = dialer.dial().unwrap();
        assert_eq!(channel.id(), 5);

        channel.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        channel.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        let _remote = peer.join().unwrap();
        drop(channel);
        dialer.close().unwrap();
    }

    #[test]
    fn rejected_dial_surfaces_the_peer_reason() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let dialer = Dialer::new(local).unwrap();

        let peer = thread::spawn(move || {
            let open = read_pkt(&mut remote);
            assert_eq!(open.cmd, FrameCmd::Open);
            write_pkt(&mut remote, &FramePacket::open_err("nope"));
            remote
        });

        let err = dialer.dial().unwrap_err();
        assert!(matches!(err, Error::OpenRejected(_)));
        assert!(err.to_string().contains("nope"));

        let _remote = peer.join().unwrap();
        dialer.close().unwrap();
    }

    #[test]
    fn dial_after_close_reports_closed_connection() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let dialer = Dialer::new(local).unwrap();

        dialer.close().unwrap();
        let err = dialer.dial().unwrap_err();
        assert!(matches!(err, Error::ClosedConn));

        // Close stays idempotent.
        dialer.close().unwrap();
    }

    #[test]
    fn unsolicited_open_reply_tears_the_connection_down() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let dialer = Dialer::new(local).unwrap();

        write_pkt(&mut remote, &FramePacket::open_ok(1));

        // The reader treats the bogus reply as fatal and shuts the
        // transport down, which we observe as EOF.
        let mut buf = [0u8; 1];
        let n = remote.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0);

        let err = dialer.dial().unwrap_err();
        assert!(matches!(
            err,
            Error::ClosedConn | Error::DialInterrupted
        ));
    }

    #[test]
    fn peer_close_retires_the_dialed_channel() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let dialer = Dialer::new(local).unwrap();

        let peer = thread::spawn(move || {
            let open = read_pkt(&mut remote);
            assert_eq!(open.cmd, FrameCmd::Open);
            write_pkt(&mut remote, &FramePacket::open_ok(1));
            write_pkt(&mut remote, &FramePacket::close(1));
            remote
        });

        let mut channel = dialer.dial().unwrap();
        let _remote = peer.join().unwrap();

        // A read blocked when the CLOSE lands drains as EOF; a read that
        // starts after it reports the closed channel. Either way the table
        // entry is gone by the time the read returns.
        let mut buf = [0u8; 4];
        match channel.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(err) => assert!(err.to_string().contains("read on closed channel")),
        }
        assert_eq!(dialer.info().channels_open, 0);

        dialer.close().unwrap();
    }

    #[test]
    fn info_counts_wire_bytes() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let dialer = Dialer::new(local).unwrap();

        let peer = thread::spawn(move || {
            let open = read_pkt(&mut remote);
            assert_eq!(open.cmd, FrameCmd::Open);
            write_pkt(&mut remote, &FramePacket::open_ok(1));
            remote
        });

        let mut channel = dialer.dial().unwrap();
        let _remote = peer.join().unwrap();

        // The write ack orders this call after the writer's byte counting.
        channel.write_all(b"hi").unwrap();

        let info = dialer.info();
        // Out: one OPEN header plus one 2-byte DATA packet. In: one OPEN
        // reply header.
        assert_eq!(info.bytes_written, 2 * HEADER_LEN as u64 + 2);
        assert_eq!(info.bytes_read, HEADER_LEN as u64);
        assert_eq!(info.channels_open, 1);

        assert_eq!(
            serde_json::to_value(info).unwrap(),
            serde_json::json!({"read": 6, "written": 14, "channels": 1})
        );

        drop(channel);
        dialer.close().unwrap();
    }
}
