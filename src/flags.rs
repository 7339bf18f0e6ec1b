//! Flag sets carried by requests, completions, locks and resources.

use bitflags::bitflags;

bitflags! {
    /// Caller-supplied request flags (the lock's external flags).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LockFlags: u32 {
        /// Fail with `Again` instead of queueing
        const NOQUEUE     = 0x0000_0001;
        /// Cancel an in-flight request or conversion (unlock only)
        const CANCEL      = 0x0000_0002;
        /// Convert an existing lock
        const CONVERT     = 0x0000_0004;
        /// The lock value block participates
        const VALBLK      = 0x0000_0008;
        /// Queue the conversion even if it could be granted in place
        const QUECVT      = 0x0000_0010;
        /// Invalidate the resource LVB on unlock
        const IVVALBLK    = 0x0000_0020;
        /// Demote to NL instead of failing on conversion deadlock
        const CONVDEADLK  = 0x0000_0040;
        /// Opt out of deadlock detection
        const NODLCKWT    = 0x0000_0100;
        /// Grant brand-new NL requests without consulting the queues
        const EXPEDITE    = 0x0000_0400;
        /// Send blocking notifications even when returning `Again`
        const NOQUEUEBAST = 0x0000_0800;
        /// Insert at the head of the waiting or converting queue
        const HEADQUE     = 0x0000_1000;
        /// Grant without regard to queue order
        const NOORDER     = 0x0000_2000;
        /// Accept PR when the requested mode is blocked
        const ALTPR       = 0x0000_8000;
        /// Accept CW when the requested mode is blocked
        const ALTCW       = 0x0001_0000;
        /// Unlock even with an operation in flight
        const FORCEUNLOCK = 0x0002_0000;
        /// Cancel the conversion after `timeout_cs`
        const TIMEOUT     = 0x0004_0000;
    }
}

impl LockFlags {
    /// Flags accepted by `unlock`
    pub const UNLOCK_MASK: Self = Self::CANCEL
        .union(Self::VALBLK)
        .union(Self::IVVALBLK)
        .union(Self::FORCEUNLOCK);
}

bitflags! {
    /// Flags written into the lock status block on completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SbFlags: u32 {
        /// Granted mode was demoted to NL to break a conversion deadlock
        const DEMOTED     = 0x0000_0001;
        /// The LVB content is not valid
        const VALNOTVALID = 0x0000_0002;
        /// The alternate mode (ALTPR/ALTCW) was granted
        const ALTMODE     = 0x0000_0004;
    }
}

bitflags! {
    /// Internal lock flags. The low half is shared with the peer copy
    /// through the wire `flags` field; the high half is node-local.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LkbFlags: u32 {
        /// This is the master's copy of a remote process's lock
        const MSTCPY          = 0x0001_0000;
        /// Recovery wants the outstanding operation resent
        const RESEND          = 0x0002_0000;
        /// The cancel was issued by the timeout scanner
        const TIMEOUT_CANCEL  = 0x0004_0000;
        /// The cancel was issued to break a deadlock
        const DEADLOCK_CANCEL = 0x0008_0000;
        /// The lock's final completion was queued
        const ENDOFLIFE       = 0x0010_0000;
    }
}

impl LkbFlags {
    /// Bits mirrored between process and master copies
    pub const SHARED_MASK: u32 = 0x0000_ffff;

    /// Replace the shared half with `wire`
    pub fn merge_shared(&mut self, wire: u32) {
        *self = Self::from_bits_retain((self.bits() & !Self::SHARED_MASK) | (wire & Self::SHARED_MASK));
    }

    /// The shared half, as carried on the wire
    pub const fn shared(&self) -> u32 {
        self.bits() & Self::SHARED_MASK
    }
}

bitflags! {
    /// Resource flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RsbFlags: u32 {
        /// Cached master was revived from the toss list and must be confirmed
        const MASTER_UNCERTAIN = 0x0000_0001;
        /// The resource LVB was invalidated
        const VALNOTVALID      = 0x0000_0002;
        /// Recovery demoted a mid-range conversion on this resource
        const RECOVER_CONVERT  = 0x0000_0004;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_contains() {
        let mut flags = LockFlags::CONVERT | LockFlags::VALBLK;
        assert!(flags.contains(LockFlags::CONVERT));
        assert!(flags.intersects(LockFlags::VALBLK | LockFlags::QUECVT));
        flags.remove(LockFlags::CONVERT);
        assert!(!flags.contains(LockFlags::CONVERT));
        flags.insert(LockFlags::QUECVT);
        assert_eq!(flags.bits(), 0x18);
    }

    #[test]
    fn test_unlock_mask() {
        let flags = LockFlags::CANCEL | LockFlags::NOQUEUE;
        assert!(!flags.difference(LockFlags::UNLOCK_MASK).is_empty());
        assert!(LockFlags::UNLOCK_MASK.contains(LockFlags::FORCEUNLOCK | LockFlags::IVVALBLK));
        assert!(!LockFlags::UNLOCK_MASK.contains(LockFlags::CONVERT));
    }

    #[test]
    fn test_shared_merge_keeps_local_half() {
        let mut flags = LkbFlags::MSTCPY | LkbFlags::from_bits_retain(0x3);
        flags.merge_shared(0x4);
        assert!(flags.contains(LkbFlags::MSTCPY));
        assert_eq!(flags.shared(), 0x4);
    }

    #[test]
    fn test_wire_bits_survive_decoding() {
        // bits the peer sets but this node has no name for are kept
        let flags = LockFlags::from_bits_retain(0x8000_0008);
        assert!(flags.contains(LockFlags::VALBLK));
        assert_eq!(flags.bits(), 0x8000_0008);
    }

    #[test]
    fn test_debug_names() {
        let text = format!("{:?}", SbFlags::DEMOTED | SbFlags::ALTMODE);
        assert_eq!(text, "SbFlags(DEMOTED | ALTMODE)");
    }
}
