//! Per-connection shared state and the worker loops common to both sides.
//!
//! Every connection owns exactly two threads. The reader thread is the only
//! reader of the transport: it pulls packets off the wire and dispatches
//! them against the channel table (side-specific dispatch lives in
//! `dialer`/`responder`). The writer thread is the only writer: every
//! outbound packet from every channel funnels through one bounded egress
//! queue, which makes wire order exactly submission order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use crossbeam::channel::{select, unbounded, Receiver, Sender};
use framemux_transport::Transport;
use framemux_wire::{FrameCmd, FramePacket, Header, HEADER_LEN};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::signal::CloseSignal;

/// Egress queue capacity on the initiator side.
pub(crate) const DIAL_EGRESS_CAP: usize = 16;
/// Egress queue capacity on the responder side.
pub(crate) const ACCEPT_EGRESS_CAP: usize = 4096;
/// Pending-dial queue capacity.
pub(crate) const PENDING_DIAL_CAP: usize = 16;

/// An outbound packet plus its optional one-shot ack slot.
///
/// The writer signals the slot with the transport write outcome, which is
/// how a user `write` observes backpressure and errors synchronously even
/// though the actual I/O happens on the writer thread.
pub(crate) struct Outbound {
    pub pkt: FramePacket,
    pub done: Option<Sender<Result<()>>>,
}

impl Outbound {
    pub fn fire_and_forget(pkt: FramePacket) -> Self {
        Self { pkt, done: None }
    }
}

/// What the connection holds for each live channel: the delivery side of its
/// inbound queue and its close signal.
pub(crate) struct ChannelState {
    pub inbound: Sender<Bytes>,
    pub closed: CloseSignal,
}

/// The channel table and the responder-side ID cursor, guarded together so
/// allocation-and-registration is one critical section.
pub(crate) struct Table {
    pub channels: HashMap<u16, ChannelState>,
    last_id: u16,
}

/// State shared between the reader thread, the writer thread, and every
/// channel endpoint of one connection.
pub(crate) struct Core<T: Transport> {
    transport: T,
    pub table: Mutex<Table>,
    pub egress: Sender<Outbound>,
    pub closed: CloseSignal,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl<T: Transport> Core<T> {
    pub fn new(transport: T, egress: Sender<Outbound>) -> Self {
        Self {
            transport,
            table: Mutex::new(Table {
                channels: HashMap::new(),
                last_id: 0,
            }),
            egress,
            closed: CloseSignal::new(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a channel under an ID chosen by the peer (initiator side).
    ///
    /// Returns the endpoint half of the inbound queue and the channel's
    /// close signal.
    pub fn register(&self, id: u16) -> (Receiver<Bytes>, CloseSignal) {
        let (tx, rx) = unbounded();
        let closed = CloseSignal::new();
        let state = ChannelState {
            inbound: tx,
            closed: closed.clone(),
        };
        if let Some(stale) = self.lock_table().channels.insert(id, state) {
            // Peer reused an ID we still considered live; the old endpoint
            // can only observe closure.
            stale.closed.fire();
            debug!(channel = id, "replacing stale channel registration");
        }
        (rx, closed)
    }

    /// Allocate the next free channel ID and register it (responder side).
    ///
    /// Advances the cursor and probes up to 65535 slots; a full table is
    /// [`Error::ChannelsExhausted`].
    pub fn allocate(&self) -> Result<(u16, Receiver<Bytes>, CloseSignal)> {
        let mut table = self.lock_table();
        let mut id = table.last_id;
        for _ in 0..u16::MAX {
            id = id.wrapping_add(1);
            if !table.channels.contains_key(&id) {
                table.last_id = id;
                let (tx, rx) = unbounded();
                let closed = CloseSignal::new();
                table.channels.insert(
                    id,
                    ChannelState {
                        inbound: tx,
                        closed: closed.clone(),
                    },
                );
                return Ok((id, rx, closed));
            }
        }
        Err(Error::ChannelsExhausted)
    }

    /// Remove a channel's table entry, returning its state if it was live.
    pub fn take_channel(&self, id: u16) -> Option<ChannelState> {
        self.lock_table().channels.remove(&id)
    }

    pub fn channels_open(&self) -> usize {
        self.lock_table().channels.len()
    }

    /// Tear the connection down. Idempotent.
    ///
    /// The close signal fires before the channels are dropped from the
    /// table, so any channel code path racing this observes the connection
    /// signal first. Shutting the transport down last unblocks the reader
    /// thread if it is parked in a read.
    pub fn close(&self) {
        if !self.closed.fire() {
            return;
        }
        let mut table = self.lock_table();
        for (_, state) in table.channels.drain() {
            state.closed.fire();
        }
        drop(table);
        if let Err(err) = self.transport.shutdown() {
            debug!(%err, "transport shutdown during teardown");
        }
    }

    pub fn local_desc(&self) -> String {
        self.transport.local_desc()
    }

    pub fn peer_desc(&self) -> String {
        self.transport.peer_desc()
    }
}

/// Read one packet off the wire: header, then exactly `len` payload bytes.
pub(crate) fn read_packet<T: Transport>(transport: &mut T, core: &Core<T>) -> Result<FramePacket> {
    let mut hdr = [0u8; HEADER_LEN];
    transport.read_exact(&mut hdr)?;
    core.bytes_read.fetch_add(HEADER_LEN as u64, Ordering::Relaxed);

    let header = Header::parse(&hdr)?;
    let mut data = vec![0u8; header.len as usize];
    transport.read_exact(&mut data)?;
    core.bytes_read
        .fetch_add(header.len as u64, Ordering::Relaxed);

    Ok(FramePacket::from_parts(header, data.into()))
}

/// Deliver a `DATA` packet to its channel's inbound queue.
///
/// Data for an unknown channel, or for one whose close signal has fired, is
/// dropped: a `CLOSE` already in flight in either direction makes this an
/// ordinary race, not an error.
pub(crate) fn deliver_data<T: Transport>(core: &Core<T>, pkt: FramePacket) {
    let table = core.lock_table();
    match table.channels.get(&pkt.channel) {
        Some(state) if !state.closed.is_fired() => {
            let _ = state.inbound.send(pkt.data);
        }
        Some(_) => debug!(channel = pkt.channel, "data on closed channel"),
        None => debug!(channel = pkt.channel, "data on unknown channel"),
    }
}

/// Handle a peer `CLOSE`: fire the channel's signal and drop it from the
/// table. An unknown ID usually means our own close raced theirs.
pub(crate) fn handle_peer_close<T: Transport>(core: &Core<T>, pkt: &FramePacket) {
    match core.take_channel(pkt.channel) {
        Some(state) => {
            state.closed.fire();
        }
        None => debug!(channel = pkt.channel, "close for unknown channel"),
    }
}

/// The writer loop: the sole writer of the transport.
///
/// Drains the egress queue until the connection closes or a write fails.
/// Each packet's ack slot is signaled with the outcome; a `CLOSE` written to
/// the wire also retires its channel's table entry, the one table mutation
/// that happens off the reader thread.
pub(crate) fn writer_loop<T: Transport>(mut transport: T, core: &Core<T>, egress: Receiver<Outbound>) {
    loop {
        let out = select! {
            recv(egress) -> msg => match msg {
                Ok(out) => out,
                Err(_) => return,
            },
            recv(core.closed.observer()) -> _ => return,
        };

        let buf = out.pkt.bytes();
        let res = transport.write_all(&buf).and_then(|()| transport.flush());
        match res {
            Ok(()) => {
                core.bytes_written
                    .fetch_add(buf.len() as u64, Ordering::Relaxed);
                if let Some(done) = out.done {
                    let _ = done.send(Ok(()));
                }
                if out.pkt.cmd == FrameCmd::Close {
                    core.take_channel(out.pkt.channel);
                }
            }
            Err(err) => {
                warn!(peer = %core.peer_desc(), %err, "write error, closing connection");
                if let Some(done) = out.done {
                    let _ = done.send(Err(Error::Io(err)));
                }
                core.close();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;

    use bytes::Bytes;
    use crossbeam::channel::bounded;
    use framemux_wire::FramePacket;

    use super::*;

    fn pair_core() -> (Arc<Core<UnixStream>>, UnixStream, Receiver<Outbound>) {
        let (local, remote) = UnixStream::pair().unwrap();
        let (egress_tx, egress_rx) = bounded(DIAL_EGRESS_CAP);
        (Arc::new(Core::new(local, egress_tx)), remote, egress_rx)
    }

    #[test]
    fn allocate_assigns_sequential_ids() {
        let (core, _remote, _egress) = pair_core();
        let (first, ..) = core.allocate().unwrap();
        let (second, ..) = core.allocate().unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(core.channels_open(), 2);
    }

    #[test]
    fn allocate_skips_taken_ids() {
        let (core, _remote, _egress) = pair_core();
        let _ = core.register(1);
        let _ = core.register(2);
        let (id, ..) = core.allocate().unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn close_fires_every_channel_signal() {
        let (core, _remote, _egress) = pair_core();
        let (_rx1, closed1) = core.register(1);
        let (_rx2, closed2) = core.register(2);

        core.close();

        assert!(core.closed.is_fired());
        assert!(closed1.is_fired());
        assert!(closed2.is_fired());
        assert_eq!(core.channels_open(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let (core, _remote, _egress) = pair_core();
        core.close();
        core.close();
        assert!(core.closed.is_fired());
    }

    #[test]
    fn deliver_data_respects_channel_close() {
        let (core, _remote, _egress) = pair_core();
        let (rx, closed) = core.register(9);

        deliver_data(&core, FramePacket::data(9, Bytes::from_static(b"kept")));
        closed.fire();
        deliver_data(&core, FramePacket::data(9, Bytes::from_static(b"dropped")));

        assert_eq!(rx.try_recv().unwrap().as_ref(), b"kept");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn peer_close_retires_the_channel() {
        let (core, _remote, _egress) = pair_core();
        let (_rx, closed) = core.register(4);

        handle_peer_close(&core, &FramePacket::close(4));
        assert!(closed.is_fired());
        assert_eq!(core.channels_open(), 0);

        // Unknown IDs are ignored.
        handle_peer_close(&core, &FramePacket::close(4));
    }

    #[test]
    fn writer_acks_and_writes_to_the_wire() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let writer_half = Transport::try_clone(&local).unwrap();
        let (egress_tx, egress_rx) = bounded(DIAL_EGRESS_CAP);
        let core = Arc::new(Core::new(local, egress_tx));

        let wcore = Arc::clone(&core);
        let writer = thread::spawn(move || writer_loop(writer_half, &wcore, egress_rx));

        let (done_tx, done_rx) = bounded(1);
        core.egress
            .send(Outbound {
                pkt: FramePacket::data(3, Bytes::from_static(b"abc")),
                done: Some(done_tx),
            })
            .unwrap();

        done_rx.recv().unwrap().unwrap();

        let mut buf = [0u8; 9];
        std::io::Read::read_exact(&mut remote, &mut buf).unwrap();
        assert_eq!(&buf, &[0, 3, 0, 3, 2, 0, b'a', b'b', b'c']);
        assert_eq!(core.bytes_written.load(Ordering::Relaxed), 9);

        core.close();
        writer.join().unwrap();
    }

    #[test]
    fn writer_retires_channel_after_emitting_close() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let writer_half = Transport::try_clone(&local).unwrap();
        let (egress_tx, egress_rx) = bounded(DIAL_EGRESS_CAP);
        let core = Arc::new(Core::new(local, egress_tx));
        let (_rx, _closed) = core.register(5);

        let wcore = Arc::clone(&core);
        let writer = thread::spawn(move || writer_loop(writer_half, &wcore, egress_rx));

        let (done_tx, done_rx) = bounded(1);
        core.egress
            .send(Outbound {
                pkt: FramePacket::close(5),
                done: Some(done_tx),
            })
            .unwrap();

        done_rx.recv().unwrap().unwrap();
        assert_eq!(core.channels_open(), 0);

        core.close();
        writer.join().unwrap();
    }

    #[test]
    fn writer_reports_write_failure_and_tears_down() {
        let (local, remote) = UnixStream::pair().unwrap();
        let writer_half = Transport::try_clone(&local).unwrap();
        let (egress_tx, egress_rx) = bounded(DIAL_EGRESS_CAP);
        let core = Arc::new(Core::new(local, egress_tx));

        // Kill the wire before the writer touches it.
        Transport::shutdown(&remote).unwrap();
        drop(remote);

        let wcore = Arc::clone(&core);
        let writer = thread::spawn(move || writer_loop(writer_half, &wcore, egress_rx));

        let (done_tx, done_rx) = bounded(1);
        core.egress
            .send(Outbound {
                pkt: FramePacket::data(1, Bytes::from(vec![0u8; 1024])),
                done: Some(done_tx),
            })
            .unwrap();

        let res = done_rx.recv().unwrap();
        assert!(matches!(res, Err(Error::Io(_))));

        writer.join().unwrap();
        assert!(core.closed.is_fired());
    }
}
