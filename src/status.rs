//! Status codes for lock operations
//!
//! A `Status` is what the caller sees: the synchronous return of
//! `lock`/`unlock`, the value written into the lock status block on
//! completion, and (through its errno encoding) the `result` field of reply
//! messages.

use std::fmt;

/// Lock manager private errno for a completed unlock.
pub const EUNLOCK: i32 = 0x10002;
/// Lock manager private errno for a completed cancel.
pub const ECANCEL: i32 = 0x10001;

const EINPROGRESS: i32 = 115;
const EAGAIN: i32 = 11;
const EDEADLK: i32 = 35;
const EINVAL: i32 = 22;
const EBUSY: i32 = 16;
const ENOENT: i32 = 2;
const ETIMEDOUT: i32 = 110;
const EBADR: i32 = 53;
const ENOTBLK: i32 = 15;
const ESHUTDOWN: i32 = 108;

/// Result of a lock manager operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Accepted; the result arrives through the completion callback
    InProgress = 1,
    /// Not grantable now and the caller asked not to queue
    Again = 2,
    /// In-place conversion deadlock
    Deadlock = 3,
    /// Invalid argument or flag combination
    Invalid = 4,
    /// Another operation on the lock is in flight
    Busy = 5,
    /// Lock or resource does not exist
    NotFound = 6,
    /// Lock was released
    Unlocked = 7,
    /// Request or conversion was cancelled
    Cancelled = 8,
    /// Conversion was cancelled after its timeout expired
    TimedOut = 9,
    /// The resource exists here but is mastered elsewhere
    NotMasterHere = 10,
    /// The resource does not exist on the master
    BadResource = 11,
    /// Lockspace was aborted after an internal invariant violation
    Aborted = 12,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the operation is still in progress
    #[inline]
    pub const fn is_in_progress(&self) -> bool {
        matches!(self, Status::InProgress)
    }

    /// Check if the status reports anything other than success or progress
    #[inline]
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Status::Ok | Status::InProgress)
    }

    /// Negative errno encoding used on the wire and in `Lksb` status words.
    pub const fn errno(&self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::InProgress => -EINPROGRESS,
            Status::Again => -EAGAIN,
            Status::Deadlock => -EDEADLK,
            Status::Invalid => -EINVAL,
            Status::Busy => -EBUSY,
            Status::NotFound => -ENOENT,
            Status::Unlocked => -EUNLOCK,
            Status::Cancelled => -ECANCEL,
            Status::TimedOut => -ETIMEDOUT,
            Status::NotMasterHere => -ENOTBLK,
            Status::BadResource => -EBADR,
            Status::Aborted => -ESHUTDOWN,
        }
    }

    /// Decode a negative errno. Unknown values yield `None`.
    pub const fn from_errno(errno: i32) -> Option<Status> {
        let status = match -errno {
            0 => Status::Ok,
            EINPROGRESS => Status::InProgress,
            EAGAIN => Status::Again,
            EDEADLK => Status::Deadlock,
            EINVAL => Status::Invalid,
            EBUSY => Status::Busy,
            ENOENT => Status::NotFound,
            EUNLOCK => Status::Unlocked,
            ECANCEL => Status::Cancelled,
            ETIMEDOUT => Status::TimedOut,
            ENOTBLK => Status::NotMasterHere,
            EBADR => Status::BadResource,
            ESHUTDOWN => Status::Aborted,
            _ => return None,
        };
        Some(status)
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::InProgress => "InProgress",
            Status::Again => "Again",
            Status::Deadlock => "Deadlock",
            Status::Invalid => "Invalid",
            Status::Busy => "Busy",
            Status::NotFound => "NotFound",
            Status::Unlocked => "Unlocked",
            Status::Cancelled => "Cancelled",
            Status::TimedOut => "TimedOut",
            Status::NotMasterHere => "NotMasterHere",
            Status::BadResource => "BadResource",
            Status::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Status; 13] = [
        Status::Ok,
        Status::InProgress,
        Status::Again,
        Status::Deadlock,
        Status::Invalid,
        Status::Busy,
        Status::NotFound,
        Status::Unlocked,
        Status::Cancelled,
        Status::TimedOut,
        Status::NotMasterHere,
        Status::BadResource,
        Status::Aborted,
    ];

    #[test]
    fn test_errno_is_invertible() {
        for status in ALL {
            assert_eq!(Status::from_errno(status.errno()), Some(status));
        }
    }

    #[test]
    fn test_private_errnos() {
        assert_eq!(Status::Unlocked.errno(), -0x10002);
        assert_eq!(Status::Cancelled.errno(), -0x10001);
        assert_eq!(Status::from_errno(-9999), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::Deadlock.to_string(), "Deadlock");
        assert!(Status::Ok.is_ok());
        assert!(!Status::InProgress.is_failure());
        assert!(Status::Again.is_failure());
    }
}
