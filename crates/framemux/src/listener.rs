//! The listener adapter: a listener of transports becomes a listener of
//! channels.
//!
//! Each transport accepted from the underlying listener is wrapped as a
//! [`Responder`] and a forwarder thread funnels its channels onto one shared
//! accept queue, so [`MuxListener::accept`] yields channels from every
//! connection interleaved. Thin glue; the engine does the real work.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, select, Receiver, Sender};
use framemux_transport::TransportListener;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::responder::Responder;
use crate::signal::CloseSignal;

/// Accepts channels across every transport of an underlying listener.
pub struct MuxListener<L: TransportListener> {
    listener: Arc<L>,
    accept_rx: Receiver<Result<Channel<L::Stream>>>,
    closed: CloseSignal,
}

impl<L: TransportListener> MuxListener<L> {
    /// Wrap a transport listener, accepting transports in the background.
    pub fn new(listener: L) -> Self {
        let listener = Arc::new(listener);
        let (accept_tx, accept_rx) = bounded(0);
        let closed = CloseSignal::new();

        let accepting = Arc::clone(&listener);
        let signal = closed.clone();
        thread::spawn(move || accept_loop(accepting, accept_tx, signal));

        Self {
            listener,
            accept_rx,
            closed,
        }
    }

    /// Receive the next channel opened on any accepted transport.
    pub fn accept(&self) -> Result<Channel<L::Stream>> {
        select! {
            recv(self.accept_rx) -> res => match res {
                Ok(res) => res,
                Err(_) => Err(Error::ClosedConn),
            },
            recv(self.closed.observer()) -> _ => Err(Error::ClosedConn),
        }
    }

    /// Stop accepting and close the underlying listener. Idempotent.
    ///
    /// Connections already accepted keep running; their channels stay
    /// usable until each connection closes on its own.
    pub fn close(&self) -> Result<()> {
        if self.closed.fire() {
            if let Err(err) = self.listener.shutdown() {
                debug!(%err, "listener shutdown during close");
            }
        }
        Ok(())
    }

    /// Bound endpoint description of the underlying listener.
    pub fn local_desc(&self) -> String {
        self.listener.local_desc()
    }
}

fn accept_loop<L: TransportListener>(
    listener: Arc<L>,
    accept_tx: Sender<Result<Channel<L::Stream>>>,
    closed: CloseSignal,
) {
    loop {
        let transport = match listener.accept() {
            Ok(transport) => transport,
            Err(err) => {
                // Normal on close(); anything else also ends the adapter.
                debug!(%err, "transport accept ended");
                closed.fire();
                return;
            }
        };

        let responder = match Responder::new(transport) {
            Ok(responder) => responder,
            Err(err) => {
                warn!(%err, "could not wrap accepted transport");
                continue;
            }
        };

        let forward_tx = accept_tx.clone();
        let signal = closed.clone();
        thread::spawn(move || forward_loop(responder, forward_tx, signal));
    }
}

/// Forward one connection's channels onto the shared accept queue until the
/// connection ends or the adapter closes.
fn forward_loop<T: framemux_transport::Transport>(
    responder: Responder<T>,
    accept_tx: Sender<Result<Channel<T>>>,
    closed: CloseSignal,
) {
    loop {
        match responder.accept() {
            Ok(channel) => {
                select! {
                    send(accept_tx, Ok(channel)) -> res => {
                        if res.is_err() {
                            return;
                        }
                    }
                    recv(closed.observer()) -> _ => return,
                }
            }
            Err(Error::ClosedConn) => return,
            Err(err) => {
                // Per-open failure (e.g. ID exhaustion): surface it, the
                // connection keeps going.
                select! {
                    send(accept_tx, Err(err)) -> res => {
                        if res.is_err() {
                            return;
                        }
                    }
                    recv(closed.observer()) -> _ => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use super::*;
    use crate::dialer::Dialer;

    #[test]
    fn accepts_channels_from_multiple_transports() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mux = MuxListener::new(listener);

        let dialer_a = Dialer::new(TcpStream::connect(addr).unwrap()).unwrap();
        let dialer_b = Dialer::new(TcpStream::connect(addr).unwrap()).unwrap();

        let client = thread::spawn(move || {
            let mut one = dialer_a.dial().unwrap();
            let mut two = dialer_b.dial().unwrap();
            one.write_all(b"from-a").unwrap();
            two.write_all(b"from-b").unwrap();

            let mut buf = [0u8; 2];
            one.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ok");
            two.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ok");

            drop((one, two));
            dialer_a.close().unwrap();
            dialer_b.close().unwrap();
        });

        let mut seen = Vec::new();
        // Hold the endpoints until the client has read both replies; a
        // dropped endpoint's CLOSE could otherwise race the reply data.
        let mut held = Vec::new();
        for _ in 0..2 {
            let mut channel = mux.accept().unwrap();
            let mut buf = [0u8; 6];
            channel.read_exact(&mut buf).unwrap();
            seen.push(buf.to_vec());
            channel.write_all(b"ok").unwrap();
            held.push(channel);
        }

        client.join().unwrap();
        drop(held);
        seen.sort();
        assert_eq!(seen, vec![b"from-a".to_vec(), b"from-b".to_vec()]);

        mux.close().unwrap();
    }

    #[test]
    fn close_unblocks_a_pending_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mux = Arc::new(MuxListener::new(listener));

        let accepting = Arc::clone(&mux);
        let blocked = thread::spawn(move || accepting.accept());

        thread::sleep(std::time::Duration::from_millis(50));
        mux.close().unwrap();

        let res = blocked.join().unwrap();
        assert!(matches!(res, Err(Error::ClosedConn)));
        // Idempotent.
        mux.close().unwrap();
    }

    #[test]
    fn channels_survive_adapter_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mux = MuxListener::new(listener);

        let dialer = Dialer::new(TcpStream::connect(addr).unwrap()).unwrap();
        let mut local = dialer.dial().unwrap();
        let mut accepted = mux.accept().unwrap();

        mux.close().unwrap();

        local.write_all(b"still-on").unwrap();
        let mut buf = [0u8; 8];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"still-on");

        drop((local, accepted));
        dialer.close().unwrap();
    }
}
