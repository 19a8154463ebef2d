//! Wire codec for the framemux multiplexing protocol.
//!
//! Every unit on the wire is a fixed 6-byte big-endian header followed by a
//! payload of at most [`MAX_WRITE`] bytes:
//!
//! ```text
//! ┌────────────┬────────────┬──────────┬──────────┬───────────────┐
//! │ Length     │ Channel    │ Command  │ Status   │ Payload       │
//! │ (2B BE)    │ (2B BE)    │ (1B)     │ (1B)     │ Length bytes  │
//! └────────────┴────────────┴──────────┴──────────┴───────────────┘
//! ```
//!
//! There is no magic number and no version byte; both peers agree on the
//! protocol out-of-band. The codec is pure: no I/O, no shared state.

pub mod error;
pub mod pkt;

pub use error::{Result, WireError};
pub use pkt::{FrameCmd, FramePacket, FrameStatus, Header, HEADER_LEN, MAX_WRITE};
