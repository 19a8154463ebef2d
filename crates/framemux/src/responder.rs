//! The responder side of a connection.
//!
//! A [`Responder`] wraps an established transport and accepts the channels
//! the peer opens over it. The reader thread owns channel allocation: for
//! each `OPEN` it advances the ID cursor, registers the channel, emits the
//! `OPEN` reply, and publishes the new endpoint on the accept queue. ID
//! exhaustion is answered with an `OPEN` error and surfaced to `accept`,
//! while the connection keeps running.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, select, Receiver, Sender};
use framemux_transport::Transport;
use framemux_wire::{FrameCmd, FramePacket};
use tracing::debug;

use crate::channel::Channel;
use crate::conn::{self, Core, Outbound, ACCEPT_EGRESS_CAP};
use crate::error::{Error, Result};

/// Accepts channels over one multiplexed connection.
pub struct Responder<T: Transport> {
    core: Arc<Core<T>>,
    accept_rx: Receiver<Result<Channel<T>>>,
}

impl<T: Transport> Responder<T> {
    /// Wrap an established transport as the responder of a multiplexed
    /// connection, spawning its reader and writer threads.
    pub fn new(transport: T) -> Result<Self> {
        let reader_half = transport.try_clone()?;
        let writer_half = transport.try_clone()?;

        let (egress_tx, egress_rx) = bounded(ACCEPT_EGRESS_CAP);
        // Rendezvous queue: the reader parks on a new channel until someone
        // accepts it, the natural backpressure on opens.
        let (accept_tx, accept_rx) = bounded(0);
        let core = Arc::new(Core::new(transport, egress_tx));

        let rcore = Arc::clone(&core);
        thread::spawn(move || reader_loop(reader_half, rcore, accept_tx));
        let wcore = Arc::clone(&core);
        thread::spawn(move || conn::writer_loop(writer_half, &wcore, egress_rx));

        Ok(Self { core, accept_rx })
    }

    /// Receive the next channel the peer opened.
    ///
    /// An `Err` item can be a per-open failure (ID exhaustion) with the
    /// connection still live, or [`Error::ClosedConn`] once the connection
    /// is down.
    pub fn accept(&self) -> Result<Channel<T>> {
        select! {
            recv(self.accept_rx) -> res => match res {
                Ok(res) => res,
                Err(_) => Err(Error::ClosedConn),
            },
            recv(self.core.closed.observer()) -> _ => Err(Error::ClosedConn),
        }
    }

    /// Close the connection and every channel on it. Idempotent; further
    /// calls succeed with no effect.
    pub fn close(&self) -> Result<()> {
        self.core.close();
        Ok(())
    }

    /// Local transport endpoint description.
    pub fn local_desc(&self) -> String {
        self.core.local_desc()
    }
}

fn reader_loop<T: Transport>(
    mut transport: T,
    core: Arc<Core<T>>,
    accept_tx: Sender<Result<Channel<T>>>,
) {
    let result: Result<()> = (|| {
        loop {
            let pkt = conn::read_packet(&mut transport, &core)?;
            match pkt.cmd {
                FrameCmd::Open => handle_open(&core, &accept_tx),
                FrameCmd::Close => conn::handle_peer_close(&core, &pkt),
                FrameCmd::Data => conn::deliver_data(&core, pkt),
            }
        }
    })();
    if let Err(err) = result {
        debug!(peer = %core.peer_desc(), %err, "responder reader exiting");
    }
    core.close();
}

/// Answer one `OPEN`: allocate an ID, reply, publish the channel.
///
/// Both the reply and the publication race the connection's close signal so
/// a closing connection cannot wedge the reader.
fn handle_open<T: Transport>(core: &Arc<Core<T>>, accept_tx: &Sender<Result<Channel<T>>>) {
    match core.allocate() {
        Ok((id, inbound, closed)) => {
            select! {
                send(core.egress, Outbound::fire_and_forget(FramePacket::open_ok(id))) -> _ => (),
                recv(core.closed.observer()) -> _ => return,
            }
            let channel = Channel::new(Arc::clone(core), id, inbound, closed);
            select! {
                send(accept_tx, Ok(channel)) -> res => {
                    if res.is_err() {
                        // Nobody accepts anymore; dropping the endpoint
                        // emits CLOSE for the peer.
                        debug!(channel = id, "accepted channel abandoned");
                    }
                }
                recv(core.closed.observer()) -> _ => (),
            }
        }
        Err(err) => {
            debug!(%err, "refusing open");
            select! {
                send(core.egress, Outbound::fire_and_forget(FramePacket::open_err(&err.to_string()))) -> _ => (),
                recv(core.closed.observer()) -> _ => return,
            }
            select! {
                send(accept_tx, Err(err)) -> _ => (),
                recv(core.closed.observer()) -> _ => (),
            }
        }
    }
}
