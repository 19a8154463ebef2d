use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Wire header length: length (2) + channel (2) + command (1) + status (1).
pub const HEADER_LEN: usize = 6;

/// Maximum payload bytes per packet.
///
/// Could be the full 16 bits, but a smaller value makes it easy to tell when
/// a stream has lost framing.
pub const MAX_WRITE: usize = 32768;

/// The command carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameCmd {
    /// Open a channel on the connection.
    Open = 0,
    /// Close a channel on the connection.
    Close = 1,
    /// The packet carries channel data.
    Data = 2,
}

impl TryFrom<u8> for FrameCmd {
    type Error = WireError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(FrameCmd::Open),
            1 => Ok(FrameCmd::Close),
            2 => Ok(FrameCmd::Data),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

impl std::fmt::Display for FrameCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameCmd::Open => f.write_str("OPEN"),
            FrameCmd::Close => f.write_str("CLOSE"),
            FrameCmd::Data => f.write_str("DATA"),
        }
    }
}

/// The status carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FrameStatus {
    /// The command succeeded.
    #[default]
    Success = 0,
    /// The command failed; the payload carries the reason.
    Error = 1,
}

impl FrameStatus {
    /// Decode a status byte. Zero is success; anything else is an error
    /// (peers only ever test for "not success").
    pub fn from_byte(byte: u8) -> Self {
        if byte == 0 {
            FrameStatus::Success
        } else {
            FrameStatus::Error
        }
    }
}

impl std::fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameStatus::Success => f.write_str("SUCCESS"),
            FrameStatus::Error => f.write_str("ERROR"),
        }
    }
}

/// A parsed packet header.
///
/// Decoding is two-step: parse [`HEADER_LEN`] bytes into a `Header`, read
/// exactly [`Header::len`] payload bytes, then assemble with
/// [`FramePacket::from_parts`]. The split keeps the codec free of I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes, at most [`MAX_WRITE`].
    pub len: u16,
    /// Channel the packet addresses.
    pub channel: u16,
    /// The command.
    pub cmd: FrameCmd,
    /// The command status.
    pub status: FrameStatus,
}

impl Header {
    /// Parse a wire header.
    ///
    /// Fails on a truncated buffer, a declared length above [`MAX_WRITE`],
    /// or an unknown command byte. All three are fatal framing errors for
    /// the connection that read them.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::TruncatedHeader(buf.len()));
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]);
        if len as usize > MAX_WRITE {
            return Err(WireError::PayloadTooLarge { size: len as usize });
        }
        Ok(Header {
            len,
            channel: u16::from_be_bytes([buf[2], buf[3]]),
            cmd: FrameCmd::try_from(buf[4])?,
            status: FrameStatus::from_byte(buf[5]),
        })
    }
}

/// One packet sent or received over a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePacket {
    /// The command.
    pub cmd: FrameCmd,
    /// The command status.
    pub status: FrameStatus,
    /// Channel the packet addresses.
    pub channel: u16,
    /// Payload, at most [`MAX_WRITE`] bytes.
    pub data: Bytes,
}

impl FramePacket {
    /// An `OPEN` request (the responder assigns the channel ID).
    pub fn open() -> Self {
        Self {
            cmd: FrameCmd::Open,
            status: FrameStatus::Success,
            channel: 0,
            data: Bytes::new(),
        }
    }

    /// An `OPEN` reply granting `channel`.
    pub fn open_ok(channel: u16) -> Self {
        Self {
            cmd: FrameCmd::Open,
            status: FrameStatus::Success,
            channel,
            data: Bytes::new(),
        }
    }

    /// An `OPEN` reply refusing the request, with the reason as payload.
    pub fn open_err(reason: &str) -> Self {
        Self {
            cmd: FrameCmd::Open,
            status: FrameStatus::Error,
            channel: 0,
            data: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    /// A `CLOSE` for `channel`.
    pub fn close(channel: u16) -> Self {
        Self {
            cmd: FrameCmd::Close,
            status: FrameStatus::Success,
            channel,
            data: Bytes::new(),
        }
    }

    /// A `DATA` packet for `channel`. `data` must not exceed [`MAX_WRITE`].
    pub fn data(channel: u16, data: Bytes) -> Self {
        debug_assert!(data.len() <= MAX_WRITE);
        Self {
            cmd: FrameCmd::Data,
            status: FrameStatus::Success,
            channel,
            data,
        }
    }

    /// Assemble a packet from a parsed header and its payload bytes.
    pub fn from_parts(header: Header, data: Bytes) -> Self {
        debug_assert_eq!(header.len as usize, data.len());
        Self {
            cmd: header.cmd,
            status: header.status,
            channel: header.channel,
            data,
        }
    }

    /// Encode this packet into its network representation.
    pub fn bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        buf.put_u16(self.data.len() as u16);
        buf.put_u16(self.channel);
        buf.put_u8(self.cmd as u8);
        buf.put_u8(self.status as u8);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

impl std::fmt::Display for FramePacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{FramePacket cmd={}, status={}, channel={}, datalen={}}}",
            self.cmd,
            self.status,
            self.channel,
            self.data.len()
        )
    }
}
