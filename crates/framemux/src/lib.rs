//! Stream multiplexing: many bidirectional byte channels over one reliable
//! transport.
//!
//! Two peers share a single established byte stream (typically a TCP
//! socket). The *initiator* opens channels with [`Dialer::dial`]; the
//! *responder* receives them from [`Responder::accept`]. Once open, a
//! [`Channel`] is a plain bidirectional byte stream implementing
//! `std::io::Read` and `std::io::Write`.
//!
//! Per connection there are exactly two worker threads: a reader that
//! demultiplexes incoming packets to their channels, and a writer that
//! serializes every outbound packet onto the wire. User writes hand their
//! frames to the writer through a bounded egress queue and wait on a
//! per-packet ack slot, so backpressure and transport errors surface at the
//! call that caused them.
//!
//! [`MuxListener`] flattens an entire listener of transports into one
//! stream of accepted channels.
//!
//! There is no flow control beyond the transport's, no per-channel
//! deadlines, and no retransmission: the transport is assumed reliable.

pub mod channel;
pub mod dialer;
pub mod error;
pub mod listener;
pub mod responder;

mod conn;
mod signal;

pub use channel::{Channel, ChannelAddr};
pub use dialer::{Dialer, Info};
pub use error::{Error, Result};
pub use listener::MuxListener;
pub use responder::Responder;

pub use framemux_transport::{Transport, TransportListener};
pub use framemux_wire::MAX_WRITE;
