//! Wire format of lock manager messages.
//!
//! A frame is a fixed 16-byte header followed by a fixed 64-byte message
//! body and a variable `extra` tail (resource name or LVB). All multi-byte
//! fields are little-endian.
//!
//! Header layout:
//! ```text
//! 0   u16 version major
//! 2   u16 version minor
//! 4   u32 lockspace id
//! 8   u32 sender node id
//! 12  u16 total frame length
//! 14  u8  command (1 = MSG, 2 = RCOM)
//! 15  u8  padding
//! ```

mod message;

pub use message::{LockFields, Message, MsgType, BODY_SIZE};

use crate::cluster::NodeId;

/// Protocol major version; frames with another major are dropped
pub const VERSION_MAJOR: u16 = 3;
/// Protocol minor version
pub const VERSION_MINOR: u16 = 1;
/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Errors decoding or encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Input shorter than the fixed part of the frame.
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required
        need: usize,
        /// Bytes available
        have: usize,
    },
    /// Header length field disagrees with the buffer.
    #[error("frame length {header} does not match buffer length {actual}")]
    LengthMismatch {
        /// Length in the header
        header: usize,
        /// Length of the buffer
        actual: usize,
    },
    /// Frame does not fit the 16-bit length field.
    #[error("frame of {0} bytes is too long")]
    TooLong(usize),
    /// Incompatible protocol version.
    #[error("version {major}.{minor} not supported")]
    Version {
        /// Major version in the frame
        major: u16,
        /// Minor version in the frame
        minor: u16,
    },
    /// Unknown command byte.
    #[error("unknown command {0}")]
    Command(u8),
    /// RCOM frames are handled by the recovery layer, not the lock core.
    #[error("recovery command frames are not handled here")]
    Rcom,
    /// Unknown message type.
    #[error("unknown message type {0}")]
    MessageType(u32),
    /// A mode field is out of range.
    #[error("invalid lock mode {0}")]
    Mode(i32),
    /// A result field is not a known status.
    #[error("invalid result {0}")]
    Result(i32),
    /// A message that needs a resource name has none.
    #[error("{0:?} without resource name")]
    MissingName(MsgType),
}

/// Frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Lock message
    Msg = 1,
    /// Recovery communication
    Rcom = 2,
}

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Lockspace the frame belongs to
    pub lockspace: u32,
    /// Sender
    pub nodeid: NodeId,
    /// Total frame length, header included
    pub length: u16,
    /// Command
    pub cmd: Command,
}

impl Header {
    /// Parse a header and check the version
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                need: HEADER_SIZE,
                have: bytes.len(),
            });
        }
        let major = read_u16(bytes, 0);
        let minor = read_u16(bytes, 2);
        if major != VERSION_MAJOR {
            return Err(WireError::Version { major, minor });
        }
        let cmd = match bytes[14] {
            1 => Command::Msg,
            2 => Command::Rcom,
            other => return Err(WireError::Command(other)),
        };
        Ok(Self {
            lockspace: read_u32(bytes, 4),
            nodeid: read_u32(bytes, 8),
            length: read_u16(bytes, 12),
            cmd,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&VERSION_MAJOR.to_le_bytes());
        out.extend_from_slice(&VERSION_MINOR.to_le_bytes());
        out.extend_from_slice(&self.lockspace.to_le_bytes());
        out.extend_from_slice(&self.nodeid.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.push(self.cmd as u8);
        out.push(0);
    }
}

/// A decoded lock message with its routing information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Lockspace id
    pub lockspace: u32,
    /// Sender
    pub nodeid: NodeId,
    /// Message
    pub message: Message,
}

impl Frame {
    /// Encode into a freshly allocated buffer
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let extra = self.message.extra();
        let total = HEADER_SIZE + BODY_SIZE + extra.len();
        let length = u16::try_from(total).map_err(|_| WireError::TooLong(total))?;

        let mut out = Vec::with_capacity(total);
        Header {
            lockspace: self.lockspace,
            nodeid: self.nodeid,
            length,
            cmd: Command::Msg,
        }
        .encode_into(&mut out);
        self.message.encode_body(&mut out);
        out.extend_from_slice(extra);
        Ok(out)
    }

    /// Decode a complete frame. Nothing is partially applied on error.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Header::decode(bytes)?;
        if header.cmd == Command::Rcom {
            return Err(WireError::Rcom);
        }
        let length = header.length as usize;
        if length != bytes.len() {
            return Err(WireError::LengthMismatch {
                header: length,
                actual: bytes.len(),
            });
        }
        if length < HEADER_SIZE + BODY_SIZE {
            return Err(WireError::Truncated {
                need: HEADER_SIZE + BODY_SIZE,
                have: length,
            });
        }
        let body = &bytes[HEADER_SIZE..HEADER_SIZE + BODY_SIZE];
        let extra = &bytes[HEADER_SIZE + BODY_SIZE..];
        Ok(Self {
            lockspace: header.lockspace,
            nodeid: header.nodeid,
            message: Message::decode_body(body, extra)?,
        })
    }
}

#[inline]
pub(crate) fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
pub(crate) fn read_i32(bytes: &[u8], at: usize) -> i32 {
    read_u32(bytes, at) as i32
}
