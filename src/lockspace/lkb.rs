//! Lock blocks.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::ast::{BlockingFn, CompletionFn, Lksb};
use crate::cluster::{NodeId, NodeRef};
use crate::flags::{LkbFlags, LockFlags, SbFlags};
use crate::mode::LockMode;
use crate::wire::LockFields;

use super::rsb::Rsb;
use super::waiters::WaitState;

/// Which resource queue a lock is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LkbStatus {
    /// On no queue
    #[default]
    None,
    /// Waiting for a first grant
    Waiting,
    /// Granted
    Granted,
    /// Granted, waiting for a conversion
    Convert,
}

impl LkbStatus {
    /// Wire encoding
    pub const fn as_i32(self) -> i32 {
        match self {
            LkbStatus::None => 0,
            LkbStatus::Waiting => 1,
            LkbStatus::Granted => 2,
            LkbStatus::Convert => 3,
        }
    }
}

/// Callbacks and status block of a local lock.
#[derive(Clone)]
pub(crate) struct LockOwner {
    pub(crate) lksb: Arc<Lksb>,
    pub(crate) on_complete: CompletionFn,
    pub(crate) on_blocking: Option<BlockingFn>,
}

/// Mutable lock state, guarded by the lock block mutex.
pub(crate) struct LkbState {
    /// Process copy: the master. Master copy: the owning node.
    pub(crate) nodeid: NodeRef,
    pub(crate) remid: u32,
    pub(crate) ownpid: u32,
    pub(crate) exflags: LockFlags,
    pub(crate) sbflags: SbFlags,
    pub(crate) flags: LkbFlags,
    pub(crate) status: LkbStatus,
    pub(crate) grmode: LockMode,
    pub(crate) rqmode: LockMode,
    pub(crate) highbast: LockMode,
    pub(crate) lvbseq: u32,
    pub(crate) lvb: Option<Vec<u8>>,
    pub(crate) timeout_cs: u64,
    pub(crate) resource: Option<Arc<Rsb>>,
    pub(crate) wait: WaitState,
    pub(crate) wait_nodeid: NodeId,
    pub(crate) owner: Option<LockOwner>,
    /// Callbacks the remote owner registered, for master copies
    pub(crate) remote_asts: u32,
}

impl Default for LkbState {
    fn default() -> Self {
        Self {
            nodeid: NodeRef::Unknown,
            remid: 0,
            ownpid: 0,
            exflags: LockFlags::empty(),
            sbflags: SbFlags::empty(),
            flags: LkbFlags::empty(),
            status: LkbStatus::None,
            grmode: LockMode::Iv,
            rqmode: LockMode::Iv,
            highbast: LockMode::Iv,
            lvbseq: 0,
            lvb: None,
            timeout_cs: 0,
            resource: None,
            wait: WaitState::Idle,
            wait_nodeid: 0,
            owner: None,
            remote_asts: 0,
        }
    }
}

impl LkbState {
    #[inline]
    pub(crate) fn is_master_copy(&self) -> bool {
        self.flags.contains(LkbFlags::MSTCPY)
    }

    /// Whether a blocking notification has somewhere to go
    pub(crate) fn has_bast(&self) -> bool {
        if self.is_master_copy() {
            self.remote_asts & LockFields::AST_BAST != 0
        } else {
            self.owner
                .as_ref()
                .is_some_and(|owner| owner.on_blocking.is_some())
        }
    }

    /// Whether a failed request may be queued instead
    #[inline]
    pub(crate) fn can_be_queued(&self) -> bool {
        !self.exflags.contains(LockFlags::NOQUEUE)
    }

    /// Whether a NOQUEUE failure should still notify the holders
    #[inline]
    pub(crate) fn force_blocking_asts(&self) -> bool {
        self.exflags.contains(LockFlags::NOQUEUEBAST)
    }

    #[inline]
    pub(crate) fn is_demoted(&self) -> bool {
        self.sbflags.contains(SbFlags::DEMOTED)
    }

    #[inline]
    pub(crate) fn is_altmode(&self) -> bool {
        self.sbflags.contains(SbFlags::ALTMODE)
    }

    #[inline]
    pub(crate) fn is_middle_conversion(&self) -> bool {
        LockMode::is_middle_conversion(self.grmode, self.rqmode)
    }

    #[inline]
    pub(crate) fn is_down_conversion(&self) -> bool {
        LockMode::is_down_conversion(self.grmode, self.rqmode)
    }

    /// Fill the message fields describing this lock
    pub(crate) fn fields(&self, lkid: u32, hash: u32) -> LockFields {
        let asts = match &self.owner {
            Some(owner) if owner.on_blocking.is_some() => {
                LockFields::AST_COMP | LockFields::AST_BAST
            }
            Some(_) => LockFields::AST_COMP,
            None => self.remote_asts,
        };
        LockFields {
            lkid,
            remid: self.remid,
            pid: self.ownpid,
            exflags: self.exflags,
            sbflags: self.sbflags,
            flags: self.flags.shared(),
            lvbseq: self.lvbseq,
            hash,
            status: self.status.as_i32(),
            grmode: self.grmode,
            rqmode: self.rqmode,
            asts,
        }
    }
}

/// A lock: either a process copy (the caller's handle, possibly mirrored on
/// a remote master) or a master copy of a remote process's lock.
pub(crate) struct Lkb {
    pub(crate) id: u32,
    refs: AtomicU32,
    state: Mutex<LkbState>,
}

impl Lkb {
    pub(super) fn new(id: u32) -> Self {
        Self {
            id,
            refs: AtomicU32::new(1),
            state: Mutex::new(LkbState::default()),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> MutexGuard<'_, LkbState> {
        self.state.lock()
    }

    #[inline]
    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Take another reference. The caller must already hold one.
    #[inline]
    pub(crate) fn hold(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference known not to be the last; false if it was.
    pub(crate) fn unhold(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 1).then(|| n - 1)
            })
            .is_ok()
    }

    /// Drop a reference; true if it was the last. Only the lock table calls
    /// this, under the bucket lock.
    pub(super) fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Resource the lock is attached to
    pub(crate) fn resource(&self) -> Option<Arc<Rsb>> {
        self.state().resource.clone()
    }
}

impl fmt::Debug for Lkb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lkb")
            .field("id", &format_args!("{:08x}", self.id))
            .field("refs", &self.refs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_unqueued() {
        let lkb = Lkb::new(0x0003_0001);
        let st = lkb.state();
        assert_eq!(st.status, LkbStatus::None);
        assert_eq!(st.grmode, LockMode::Iv);
        assert!(st.can_be_queued());
        assert!(!st.has_bast());
        assert_eq!(lkb.refs(), 1);
    }

    #[test]
    fn test_unhold_never_drops_last_ref() {
        let lkb = Lkb::new(1);
        assert!(!lkb.unhold());
        lkb.hold();
        assert!(lkb.unhold());
        assert_eq!(lkb.refs(), 1);
    }

    #[test]
    fn test_master_copy_fields() {
        let lkb = Lkb::new(9);
        let mut st = lkb.state();
        st.flags.insert(LkbFlags::MSTCPY | LkbFlags::from_bits_retain(0x5));
        st.remote_asts = LockFields::AST_COMP | LockFields::AST_BAST;
        st.remid = 0x0002_0004;
        st.status = LkbStatus::Granted;
        assert!(st.has_bast());
        let fields = st.fields(lkb.id, 0xabcd);
        assert_eq!(fields.remid, 0x0002_0004);
        assert_eq!(fields.flags, 0x5);
        assert_eq!(fields.status, 2);
        assert_eq!(fields.asts, 3);
    }

    #[test]
    fn test_conversion_classes() {
        let lkb = Lkb::new(1);
        let mut st = lkb.state();
        st.grmode = LockMode::Pr;
        st.rqmode = LockMode::Cw;
        assert!(st.is_middle_conversion());
        assert!(!st.is_down_conversion());
        st.grmode = LockMode::Ex;
        assert!(st.is_down_conversion());
    }
}
