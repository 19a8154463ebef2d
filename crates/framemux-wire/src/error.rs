use crate::pkt::{HEADER_LEN, MAX_WRITE};

/// Errors that can occur while encoding or decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The declared or supplied payload exceeds [`MAX_WRITE`].
    #[error("payload too large ({size} bytes, max {})", MAX_WRITE)]
    PayloadTooLarge { size: usize },

    /// The command byte is not one of OPEN, CLOSE, DATA.
    #[error("unknown command byte 0x{0:02x}")]
    UnknownCommand(u8),

    /// The header buffer is shorter than [`HEADER_LEN`].
    #[error("truncated header ({0} bytes, need {})", HEADER_LEN)]
    TruncatedHeader(usize),
}

pub type Result<T> = std::result::Result<T, WireError>;
