use std::io::{Read, Write};

/// An established, reliable, ordered byte stream carrying one multiplexed
/// session.
///
/// The engine runs a dedicated reader thread and a dedicated writer thread
/// per connection, so a transport must be able to hand out an independently
/// owned duplicate of itself via [`try_clone`](Transport::try_clone). Both
/// handles refer to the same underlying stream; closing one side via
/// [`shutdown`](Transport::shutdown) unblocks any thread parked in a read
/// or write on either handle.
pub trait Transport: Read + Write + Send + Sync + Sized + 'static {
    /// Create an independently owned handle to the same underlying stream.
    fn try_clone(&self) -> std::io::Result<Self>;

    /// Shut down both directions of the stream.
    ///
    /// Any blocked read or write on any handle to this stream returns
    /// afterwards (with EOF or an error).
    fn shutdown(&self) -> std::io::Result<()>;

    /// Local endpoint description, for diagnostics only.
    fn local_desc(&self) -> String;

    /// Remote endpoint description, for diagnostics only.
    fn peer_desc(&self) -> String;
}

/// A source of established transports, consumed by the listener adapter.
pub trait TransportListener: Send + Sync + 'static {
    /// The transport type this listener produces.
    type Stream: Transport;

    /// Accept the next incoming transport (blocking).
    fn accept(&self) -> std::io::Result<Self::Stream>;

    /// Stop listening and unblock any pending accept.
    fn shutdown(&self) -> std::io::Result<()>;

    /// Bound endpoint description, for diagnostics only.
    fn local_desc(&self) -> String;
}
