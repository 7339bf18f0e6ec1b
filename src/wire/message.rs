//! Typed lock messages and their fixed body layout.
//!
//! Body layout (64 bytes, little-endian):
//! ```text
//! 0  type     4  nodeid   8  pid      12 lkid
//! 16 remid    20 exflags  24 sbflags  28 flags
//! 32 lvbseq   36 hash     40 status   44 grmode
//! 48 rqmode   52 bastmode 56 asts     60 result
//! ```

use crate::cluster::NodeId;
use crate::flags::{LockFlags, SbFlags};
use crate::mode::LockMode;
use crate::status::Status;

use super::{read_i32, read_u32, WireError};

/// Size of the fixed message body
pub const BODY_SIZE: usize = 64;

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    /// New lock request, to the master
    Request = 1,
    /// Conversion, to the master
    Convert = 2,
    /// Unlock, to the master
    Unlock = 3,
    /// Cancel, to the master
    Cancel = 4,
    /// Reply to `Request` (or to a `Lookup` the directory node mastered)
    RequestReply = 5,
    /// Reply to `Convert`
    ConvertReply = 6,
    /// Reply to `Unlock`
    UnlockReply = 7,
    /// Reply to `Cancel`
    CancelReply = 8,
    /// Asynchronous grant of a queued request or conversion
    Grant = 9,
    /// Blocking notification
    Bast = 10,
    /// Master lookup, to the directory node
    Lookup = 11,
    /// Directory entry removal
    Remove = 12,
    /// Reply to `Lookup`
    LookupReply = 13,
    /// Purge a process's locks
    Purge = 14,
}

impl MsgType {
    fn from_u32(value: u32) -> Result<Self, WireError> {
        Ok(match value {
            1 => MsgType::Request,
            2 => MsgType::Convert,
            3 => MsgType::Unlock,
            4 => MsgType::Cancel,
            5 => MsgType::RequestReply,
            6 => MsgType::ConvertReply,
            7 => MsgType::UnlockReply,
            8 => MsgType::CancelReply,
            9 => MsgType::Grant,
            10 => MsgType::Bast,
            11 => MsgType::Lookup,
            12 => MsgType::Remove,
            13 => MsgType::LookupReply,
            14 => MsgType::Purge,
            other => return Err(WireError::MessageType(other)),
        })
    }
}

/// Lock state carried by every lock-bearing message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockFields {
    /// Sender's lock id
    pub lkid: u32,
    /// Receiver's lock id (zero if not known yet)
    pub remid: u32,
    /// Owner process id
    pub pid: u32,
    /// Caller flags
    pub exflags: LockFlags,
    /// Completion flags
    pub sbflags: SbFlags,
    /// Shared half of the internal lock flags
    pub flags: u32,
    /// LVB sequence
    pub lvbseq: u32,
    /// Resource name hash
    pub hash: u32,
    /// Queue the sender's copy is on
    pub status: i32,
    /// Granted mode
    pub grmode: LockMode,
    /// Requested mode
    pub rqmode: LockMode,
    /// Callbacks the owner registered (1 = completion, 2 = blocking)
    pub asts: u32,
}

impl LockFields {
    /// `asts` bit: owner has a completion callback
    pub const AST_COMP: u32 = 1;
    /// `asts` bit: owner has a blocking callback
    pub const AST_BAST: u32 = 2;
}

/// A lock manager message.
///
/// LVBs are optional tails: an empty LVB is encoded as no LVB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// New lock request
    Request {
        /// Lock state
        lock: LockFields,
        /// Resource name
        name: Vec<u8>,
    },
    /// Conversion request
    Convert {
        /// Lock state
        lock: LockFields,
        /// Caller's LVB for up-conversions from writers
        lvb: Option<Vec<u8>>,
    },
    /// Unlock request
    Unlock {
        /// Lock state
        lock: LockFields,
        /// Caller's LVB (written to the resource if the lock is a writer)
        lvb: Option<Vec<u8>>,
    },
    /// Cancel request
    Cancel {
        /// Lock state
        lock: LockFields,
    },
    /// Reply to a request
    RequestReply {
        /// Master's copy of the lock state
        lock: LockFields,
        /// Outcome
        result: Status,
        /// Resource LVB, for read grants
        lvb: Option<Vec<u8>>,
    },
    /// Reply to a conversion
    ConvertReply {
        /// Master's copy of the lock state
        lock: LockFields,
        /// Outcome
        result: Status,
        /// Resource LVB, for read grants
        lvb: Option<Vec<u8>>,
    },
    /// Reply to an unlock
    UnlockReply {
        /// Master's copy of the lock state
        lock: LockFields,
        /// Outcome
        result: Status,
    },
    /// Reply to a cancel
    CancelReply {
        /// Master's copy of the lock state
        lock: LockFields,
        /// Outcome
        result: Status,
    },
    /// Asynchronous grant
    Grant {
        /// Master's copy of the lock state
        lock: LockFields,
        /// Resource LVB, for read grants
        lvb: Option<Vec<u8>>,
    },
    /// Blocking notification
    Bast {
        /// Master's copy of the lock state
        lock: LockFields,
        /// Mode of the blocked request
        mode: LockMode,
    },
    /// Master lookup; carries a full request so the directory node can
    /// execute it directly when it is the master
    Lookup {
        /// Lock state
        lock: LockFields,
        /// Resource name
        name: Vec<u8>,
    },
    /// Directory entry removal
    Remove {
        /// Resource name hash
        hash: u32,
        /// Resource name
        name: Vec<u8>,
    },
    /// Reply to a lookup
    LookupReply {
        /// Requester's lock id
        lkid: u32,
        /// Master node (zero if the lookup failed)
        master: NodeId,
        /// Outcome
        result: Status,
    },
    /// Purge the locks of a process
    Purge {
        /// Node the process runs on
        nodeid: NodeId,
        /// Process id
        pid: u32,
    },
}

impl Message {
    /// Message type code
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Request { .. } => MsgType::Request,
            Message::Convert { .. } => MsgType::Convert,
            Message::Unlock { .. } => MsgType::Unlock,
            Message::Cancel { .. } => MsgType::Cancel,
            Message::RequestReply { .. } => MsgType::RequestReply,
            Message::ConvertReply { .. } => MsgType::ConvertReply,
            Message::UnlockReply { .. } => MsgType::UnlockReply,
            Message::CancelReply { .. } => MsgType::CancelReply,
            Message::Grant { .. } => MsgType::Grant,
            Message::Bast { .. } => MsgType::Bast,
            Message::Lookup { .. } => MsgType::Lookup,
            Message::Remove { .. } => MsgType::Remove,
            Message::LookupReply { .. } => MsgType::LookupReply,
            Message::Purge { .. } => MsgType::Purge,
        }
    }

    /// Lock fields, for lock-bearing messages
    pub fn lock(&self) -> Option<&LockFields> {
        match self {
            Message::Request { lock, .. }
            | Message::Convert { lock, .. }
            | Message::Unlock { lock, .. }
            | Message::Cancel { lock }
            | Message::RequestReply { lock, .. }
            | Message::ConvertReply { lock, .. }
            | Message::UnlockReply { lock, .. }
            | Message::CancelReply { lock, .. }
            | Message::Grant { lock, .. }
            | Message::Bast { lock, .. }
            | Message::Lookup { lock, .. } => Some(lock),
            Message::Remove { .. } | Message::LookupReply { .. } | Message::Purge { .. } => None,
        }
    }

    pub(super) fn extra(&self) -> &[u8] {
        match self {
            Message::Request { name, .. }
            | Message::Lookup { name, .. }
            | Message::Remove { name, .. } => name,
            Message::Convert { lvb, .. }
            | Message::Unlock { lvb, .. }
            | Message::RequestReply { lvb, .. }
            | Message::ConvertReply { lvb, .. }
            | Message::Grant { lvb, .. } => lvb.as_deref().unwrap_or(&[]),
            _ => &[],
        }
    }

    pub(super) fn encode_body(&self, out: &mut Vec<u8>) {
        let empty = LockFields::default();
        let lock = self.lock().unwrap_or(&empty);
        let mut nodeid = 0;
        let mut pid = lock.pid;
        let mut lkid = lock.lkid;
        let mut hash = lock.hash;
        let mut bastmode = LockMode::Iv;
        let mut result = 0;

        match self {
            Message::RequestReply { result: r, .. }
            | Message::ConvertReply { result: r, .. }
            | Message::UnlockReply { result: r, .. }
            | Message::CancelReply { result: r, .. } => result = r.errno(),
            Message::Bast { mode, .. } => bastmode = *mode,
            Message::Remove { hash: h, .. } => hash = *h,
            Message::LookupReply {
                lkid: id,
                master,
                result: r,
            } => {
                lkid = *id;
                nodeid = *master;
                result = r.errno();
            }
            Message::Purge { nodeid: n, pid: p } => {
                nodeid = *n;
                pid = *p;
            }
            _ => {}
        }

        let words: [u32; 16] = [
            self.msg_type() as u32,
            nodeid,
            pid,
            lkid,
            lock.remid,
            lock.exflags.bits(),
            lock.sbflags.bits(),
            lock.flags,
            lock.lvbseq,
            hash,
            lock.status as u32,
            i32::from(lock.grmode.as_i8()) as u32,
            i32::from(lock.rqmode.as_i8()) as u32,
            i32::from(bastmode.as_i8()) as u32,
            lock.asts,
            result as u32,
        ];
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }

    pub(super) fn decode_body(body: &[u8], extra: &[u8]) -> Result<Self, WireError> {
        let msg_type = MsgType::from_u32(read_u32(body, 0))?;
        let nodeid = read_u32(body, 4);
        let lock = LockFields {
            lkid: read_u32(body, 12),
            remid: read_u32(body, 16),
            pid: read_u32(body, 8),
            exflags: LockFlags::from_bits_retain(read_u32(body, 20)),
            sbflags: SbFlags::from_bits_retain(read_u32(body, 24)),
            flags: read_u32(body, 28),
            lvbseq: read_u32(body, 32),
            hash: read_u32(body, 36),
            status: read_i32(body, 40),
            grmode: decode_mode(read_i32(body, 44))?,
            rqmode: decode_mode(read_i32(body, 48))?,
            asts: read_u32(body, 56),
        };
        let bastmode = decode_mode(read_i32(body, 52))?;
        let raw_result = read_i32(body, 60);
        let result = || Status::from_errno(raw_result).ok_or(WireError::Result(raw_result));
        let lvb = || (!extra.is_empty()).then(|| extra.to_vec());
        let name = || {
            if extra.is_empty() {
                Err(WireError::MissingName(msg_type))
            } else {
                Ok(extra.to_vec())
            }
        };

        Ok(match msg_type {
            MsgType::Request => Message::Request {
                lock,
                name: name()?,
            },
            MsgType::Convert => Message::Convert { lock, lvb: lvb() },
            MsgType::Unlock => Message::Unlock { lock, lvb: lvb() },
            MsgType::Cancel => Message::Cancel { lock },
            MsgType::RequestReply => Message::RequestReply {
                lock,
                result: result()?,
                lvb: lvb(),
            },
            MsgType::ConvertReply => Message::ConvertReply {
                lock,
                result: result()?,
                lvb: lvb(),
            },
            MsgType::UnlockReply => Message::UnlockReply {
                lock,
                result: result()?,
            },
            MsgType::CancelReply => Message::CancelReply {
                lock,
                result: result()?,
            },
            MsgType::Grant => Message::Grant { lock, lvb: lvb() },
            MsgType::Bast => Message::Bast {
                lock,
                mode: bastmode,
            },
            MsgType::Lookup => Message::Lookup {
                lock,
                name: name()?,
            },
            MsgType::Remove => Message::Remove {
                hash: lock.hash,
                name: name()?,
            },
            MsgType::LookupReply => Message::LookupReply {
                lkid: lock.lkid,
                master: nodeid,
                result: result()?,
            },
            MsgType::Purge => Message::Purge {
                nodeid,
                pid: lock.pid,
            },
        })
    }
}

fn decode_mode(raw: i32) -> Result<LockMode, WireError> {
    i8::try_from(raw)
        .ok()
        .and_then(LockMode::from_i8)
        .ok_or(WireError::Mode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Frame;

    fn frame(message: Message) -> Frame {
        Frame {
            lockspace: 5,
            nodeid: 1,
            message,
        }
    }

    #[test]
    fn test_lookup_reply_and_purge_round_trip() {
        for message in [
            Message::LookupReply {
                lkid: 0x10003,
                master: 4,
                result: Status::Ok,
            },
            Message::Purge { nodeid: 2, pid: 77 },
            Message::Remove {
                hash: 12,
                name: b"gone".to_vec(),
            },
            Message::Bast {
                lock: LockFields {
                    lkid: 3,
                    remid: 8,
                    ..LockFields::default()
                },
                mode: LockMode::Pw,
            },
        ] {
            let f = frame(message);
            assert_eq!(Frame::decode(&f.encode().unwrap()).unwrap(), f);
        }
    }

    #[test]
    fn test_request_without_name_rejected() {
        let f = frame(Message::Request {
            lock: LockFields::default(),
            name: Vec::new(),
        });
        let bytes = f.encode().unwrap();
        assert_eq!(
            Frame::decode(&bytes),
            Err(WireError::MissingName(MsgType::Request))
        );
    }

    #[test]
    fn test_bad_mode_rejected() {
        let f = frame(Message::Cancel {
            lock: LockFields::default(),
        });
        let mut bytes = f.encode().unwrap();
        let at = crate::wire::HEADER_SIZE + 44;
        bytes[at..at + 4].copy_from_slice(&9i32.to_le_bytes());
        assert_eq!(Frame::decode(&bytes), Err(WireError::Mode(9)));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let f = frame(Message::Cancel {
            lock: LockFields::default(),
        });
        let mut bytes = f.encode().unwrap();
        let at = crate::wire::HEADER_SIZE;
        bytes[at..at + 4].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(Frame::decode(&bytes), Err(WireError::MessageType(99)));
    }
}
