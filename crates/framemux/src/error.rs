/// Errors that can occur on a multiplexed connection or channel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection has been closed.
    #[error("closed connection")]
    ClosedConn,

    /// Read attempted on a channel that was already closed locally.
    #[error("read on closed channel")]
    ClosedRead,

    /// Write attempted on a channel that was already closed locally.
    #[error("write on closed channel")]
    ClosedWrite,

    /// All 65536 channel IDs on the connection are in use.
    #[error("channels exhausted")]
    ChannelsExhausted,

    /// The peer refused an `OPEN`; the message is the peer's reason.
    #[error("open rejected by peer: {0}")]
    OpenRejected(String),

    /// The peer violated the protocol; the connection is torn down.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The connection closed while a dial was awaiting its reply.
    #[error("connection closed while dialing")]
    DialInterrupted,

    /// Deadlines are not supported on multiplexed channels.
    #[error("not implemented")]
    NotImplemented,

    /// A framing error on the wire; fatal to the connection.
    #[error(transparent)]
    Wire(#[from] framemux_wire::WireError),

    /// An I/O error on the underlying transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;

        match err {
            Error::Io(io) => io,
            Error::ClosedConn => std::io::Error::new(ErrorKind::ConnectionAborted, err),
            Error::ClosedRead | Error::ClosedWrite => {
                std::io::Error::new(ErrorKind::NotConnected, err)
            }
            Error::DialInterrupted => std::io::Error::new(ErrorKind::UnexpectedEof, err),
            Error::NotImplemented => std::io::Error::new(ErrorKind::Unsupported, err),
            other => std::io::Error::other(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
