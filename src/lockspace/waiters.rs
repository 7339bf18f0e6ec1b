//! Bookkeeping of operations awaiting a reply from another node.
//!
//! Each lock carries a [`WaitState`]. Locks with anything in flight are also
//! on the lockspace waiters list, which recovery walks. An unlock or cancel
//! may overlap an operation already in flight: it is either sent on top of
//! it (`Overlapped`) or, when the master is not known yet, deferred until the
//! reply to the first operation arrives.

use std::sync::Arc;

use tracing::{debug, error};

use crate::cluster::NodeId;
use crate::flags::LkbFlags;
use crate::status::Status;
use crate::wire::MsgType;

use super::lkb::Lkb;
use super::Lockspace;

/// Operation awaiting a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOp {
    /// Master lookup
    Lookup,
    /// New request
    Request,
    /// Conversion
    Convert,
    /// Unlock
    Unlock,
    /// Cancel
    Cancel,
}

impl WaitOp {
    /// Message type that carries this operation
    pub(crate) fn msg_type(self) -> MsgType {
        match self {
            WaitOp::Lookup => MsgType::Lookup,
            WaitOp::Request => MsgType::Request,
            WaitOp::Convert => MsgType::Convert,
            WaitOp::Unlock => MsgType::Unlock,
            WaitOp::Cancel => MsgType::Cancel,
        }
    }

    /// Message type of the expected reply
    pub(crate) fn reply_type(self) -> MsgType {
        match self {
            WaitOp::Lookup => MsgType::LookupReply,
            WaitOp::Request => MsgType::RequestReply,
            WaitOp::Convert => MsgType::ConvertReply,
            WaitOp::Unlock => MsgType::UnlockReply,
            WaitOp::Cancel => MsgType::CancelReply,
        }
    }

    fn answered_by(self, reply: MsgType) -> bool {
        // A lookup may be answered with a request reply when the directory
        // node turned out to be the master.
        matches!(
            (self, reply),
            (WaitOp::Lookup, MsgType::LookupReply)
                | (WaitOp::Lookup, MsgType::RequestReply)
                | (WaitOp::Request, MsgType::RequestReply)
                | (WaitOp::Convert, MsgType::ConvertReply)
                | (WaitOp::Unlock, MsgType::UnlockReply)
                | (WaitOp::Cancel, MsgType::CancelReply)
        )
    }
}

/// Unlock and cancel requests layered on top of another operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Overlap {
    /// Unlock
    pub unlock: bool,
    /// Cancel
    pub cancel: bool,
}

impl Overlap {
    /// Nothing overlaps
    pub const NONE: Overlap = Overlap {
        unlock: false,
        cancel: false,
    };

    /// Neither unlock nor cancel
    #[inline]
    pub fn is_empty(self) -> bool {
        !self.unlock && !self.cancel
    }

    pub(crate) fn union(self, other: Overlap) -> Overlap {
        Overlap {
            unlock: self.unlock || other.unlock,
            cancel: self.cancel || other.cancel,
        }
    }
}

/// What a lock is waiting for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitState {
    /// Nothing in flight
    #[default]
    Idle,
    /// One operation in flight; `deferred` overlaps are sent once it settles
    Waiting {
        /// Operation in flight
        op: WaitOp,
        /// Unlock or cancel requested but not sent yet
        deferred: Overlap,
    },
    /// An unlock or cancel was sent on top of `op` (`None` once the reply to
    /// `op` arrived)
    Overlapped {
        /// Original operation still awaiting its reply
        op: Option<WaitOp>,
        /// Overlapping operations awaiting their replies
        sent: Overlap,
        /// An overlap was answered before `op`; the reply to `op` is still
        /// matched but no longer acted on
        overtaken: bool,
    },
}

/// Result of matching a reply against a wait state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Removed {
    /// Wait references to drop
    pub(crate) refs: u32,
    /// Overlaps that were deferred behind the answered operation
    pub(crate) deferred: Overlap,
    /// The lock is no longer waiting on anything
    pub(crate) idle: bool,
    /// The reply answered an operation an overlap already settled
    pub(crate) stale: bool,
}

impl WaitState {
    /// Primary operation in flight
    pub fn op(&self) -> Option<WaitOp> {
        match *self {
            WaitState::Idle => None,
            WaitState::Waiting { op, .. } => Some(op),
            WaitState::Overlapped { op, .. } => op,
        }
    }

    /// Replies still expected
    pub fn count(&self) -> u32 {
        match *self {
            WaitState::Idle => 0,
            WaitState::Waiting { .. } => 1,
            WaitState::Overlapped { op, sent, .. } => {
                u32::from(op.is_some()) + u32::from(sent.unlock) + u32::from(sent.cancel)
            }
        }
    }

    /// Deferred and sent overlaps together
    pub fn overlap(&self) -> Overlap {
        match *self {
            WaitState::Idle => Overlap::NONE,
            WaitState::Waiting { deferred, .. } => deferred,
            WaitState::Overlapped { sent, .. } => sent,
        }
    }

    /// The operation in flight was overtaken by its overlap
    #[inline]
    pub fn is_overtaken(&self) -> bool {
        matches!(*self, WaitState::Overlapped { op: Some(_), overtaken: true, .. })
    }

    /// An unlock or cancel overlaps the operation in flight
    #[inline]
    pub fn is_overlap(&self) -> bool {
        !self.overlap().is_empty()
    }

    /// A force unlock overlaps
    #[inline]
    pub fn is_overlap_unlock(&self) -> bool {
        self.overlap().unlock
    }

    /// A cancel overlaps
    #[inline]
    pub fn is_overlap_cancel(&self) -> bool {
        self.overlap().cancel
    }

    /// Record a new operation in flight.
    ///
    /// Returns whether the lock was idle before (and so must join the
    /// waiters list).
    pub(crate) fn add(&mut self, op: WaitOp) -> Result<bool, Status> {
        let overlap = self.overlap();
        if overlap.unlock || (overlap.cancel && op == WaitOp::Cancel) {
            return Err(Status::Invalid);
        }
        match (*self, op) {
            (WaitState::Idle, op) => {
                *self = WaitState::Waiting {
                    op,
                    deferred: Overlap::NONE,
                };
                Ok(true)
            }
            (WaitState::Waiting { op: first, deferred }, WaitOp::Unlock | WaitOp::Cancel)
                if deferred.is_empty() =>
            {
                *self = WaitState::Overlapped {
                    op: Some(first),
                    sent: Overlap {
                        unlock: op == WaitOp::Unlock,
                        cancel: op == WaitOp::Cancel,
                    },
                    overtaken: false,
                };
                Ok(false)
            }
            (
                WaitState::Overlapped {
                    op: first,
                    sent,
                    overtaken,
                },
                WaitOp::Unlock | WaitOp::Cancel,
            ) => {
                *self = WaitState::Overlapped {
                    op: first,
                    sent: Overlap {
                        unlock: sent.unlock || op == WaitOp::Unlock,
                        cancel: sent.cancel || op == WaitOp::Cancel,
                    },
                    overtaken,
                };
                Ok(false)
            }
            _ => Err(Status::Busy),
        }
    }

    /// Park an unlock (or cancel) until the operation in flight settles.
    pub(crate) fn defer(&mut self, unlock: bool) {
        if let WaitState::Waiting { deferred, .. } = self {
            if unlock {
                deferred.unlock = true;
            } else {
                deferred.cancel = true;
            }
        }
    }

    /// Match a reply of type `reply` carrying `result`.
    ///
    /// An overlap reply only settles its overlap; the original operation
    /// stays in flight until its own reply arrives.
    pub(crate) fn remove(&mut self, reply: MsgType, result: Status) -> Result<Removed, ()> {
        let (mut op, mut sent, deferred, mut overtaken) = match *self {
            WaitState::Idle => (None, Overlap::NONE, Overlap::NONE, false),
            WaitState::Waiting { op, deferred } => (Some(op), Overlap::NONE, deferred, false),
            WaitState::Overlapped { op, sent, overtaken } => (op, sent, Overlap::NONE, overtaken),
        };
        let mut refs = 1;
        let mut stale = false;

        if sent.unlock && reply == MsgType::UnlockReply {
            sent.unlock = false;
            overtaken |= op.is_some();
        } else if sent.cancel && reply == MsgType::CancelReply {
            sent.cancel = false;
            overtaken |= op.is_some();
        } else if reply == MsgType::CancelReply && op != Some(WaitOp::Cancel) {
            // the cancel was made moot by a granted conversion
            return Err(());
        } else if reply == MsgType::ConvertReply
            && op == Some(WaitOp::Convert)
            && sent.cancel
            && result == Status::Ok
        {
            op = None;
            sent.cancel = false;
            refs = 2;
        } else if op.is_some_and(|op| op.answered_by(reply)) {
            op = None;
            stale = overtaken;
        } else {
            return Err(());
        }

        *self = match (op, sent.is_empty()) {
            (None, true) => WaitState::Idle,
            (Some(op), true) if !overtaken => WaitState::Waiting {
                op,
                deferred: Overlap::NONE,
            },
            (op, _) => WaitState::Overlapped {
                op,
                sent,
                overtaken: overtaken && op.is_some(),
            },
        };
        Ok(Removed {
            refs,
            deferred,
            idle: *self == WaitState::Idle,
            stale,
        })
    }

    /// Forget everything in flight. Returns the number of wait references
    /// held and every overlap that was pending.
    pub(crate) fn reset(&mut self) -> (u32, Overlap) {
        let out = (self.count(), self.overlap());
        *self = WaitState::Idle;
        out
    }
}

impl Lockspace {
    /// Record `op` in flight to `to`. Takes a lock reference per operation.
    pub(super) fn add_to_waiters(&self, lkb: &Arc<Lkb>, op: WaitOp, to: NodeId) -> Status {
        let mut waiters = self.waiters.lock();
        let mut st = lkb.state();
        match st.wait.add(op) {
            Ok(first) => {
                lkb.hold();
                if first {
                    st.wait_nodeid = to;
                    waiters.push(Arc::clone(lkb));
                } else {
                    debug!(lkid = lkb.id, ?op, wait = ?st.wait, "overlapping operation");
                }
                Status::Ok
            }
            Err(status) => {
                error!(
                    lkid = lkb.id,
                    ?op,
                    wait = ?st.wait,
                    flags = ?st.flags,
                    "add_to_waiters rejected"
                );
                status
            }
        }
    }

    /// Match a reply against the lock's wait state and drop the references
    /// the answered operations held. Returns the overlaps deferred behind it.
    pub(super) fn remove_from_waiters(
        &self,
        lkb: &Arc<Lkb>,
        reply: MsgType,
        result: Status,
    ) -> Result<Overlap, ()> {
        let mut waiters = self.waiters.lock();
        let removed = {
            let mut st = lkb.state();
            match st.wait.remove(reply, result) {
                Ok(removed) => {
                    st.flags.remove(LkbFlags::RESEND);
                    removed
                }
                Err(()) => {
                    if reply == MsgType::CancelReply {
                        debug!(lkid = lkb.id, wait = ?st.wait, "cancel reply after cancel was zapped");
                    } else {
                        error!(
                            lkid = lkb.id,
                            ?reply,
                            wait = ?st.wait,
                            nodeid = st.wait_nodeid,
                            "reply with nothing waiting"
                        );
                    }
                    return Err(());
                }
            }
        };
        if removed.idle {
            waiters.retain(|l| !Arc::ptr_eq(l, lkb));
        }
        drop(waiters);
        for _ in 0..removed.refs {
            self.unhold_lkb(lkb);
        }
        if removed.stale {
            debug!(lkid = lkb.id, ?reply, %result, "reply absorbed, its overlap settled first");
            return Err(());
        }
        Ok(removed.deferred)
    }

    /// Locks with anything in flight, in the order they started waiting
    pub(super) fn waiters_snapshot(&self) -> Vec<Arc<Lkb>> {
        self.waiters.lock().clone()
    }

    /// Drop every wait entry of `lkb`; used when recovery restarts or
    /// completes its operation. Returns the overlaps that were pending.
    pub(super) fn clear_waiters(&self, lkb: &Arc<Lkb>) -> Overlap {
        let mut waiters = self.waiters.lock();
        let (count, overlap) = {
            let mut st = lkb.state();
            st.flags.remove(LkbFlags::RESEND);
            st.wait_nodeid = 0;
            st.wait.reset()
        };
        waiters.retain(|l| !Arc::ptr_eq(l, lkb));
        drop(waiters);
        for _ in 0..count {
            self.unhold_lkb(lkb);
        }
        overlap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting(op: WaitOp) -> WaitState {
        let mut w = WaitState::Idle;
        assert_eq!(w.add(op), Ok(true));
        w
    }

    // ============ Add Tests ============

    #[test]
    fn test_second_primary_op_is_busy() {
        let mut w = waiting(WaitOp::Convert);
        assert_eq!(w.add(WaitOp::Convert), Err(Status::Busy));
        assert_eq!(w.count(), 1);
    }

    #[test]
    fn test_cancel_then_unlock_overlap() {
        let mut w = waiting(WaitOp::Convert);
        assert_eq!(w.add(WaitOp::Cancel), Ok(false));
        assert_eq!(w.add(WaitOp::Cancel), Err(Status::Invalid));
        assert_eq!(w.add(WaitOp::Unlock), Ok(false));
        assert_eq!(w.count(), 3);
        assert_eq!(w.add(WaitOp::Unlock), Err(Status::Invalid));
    }

    #[test]
    fn test_deferred_unlock_blocks_new_ops() {
        let mut w = waiting(WaitOp::Request);
        w.defer(true);
        assert!(w.is_overlap_unlock());
        assert_eq!(w.add(WaitOp::Cancel), Err(Status::Invalid));
        assert_eq!(w.count(), 1);
    }

    // ============ Remove Tests ============

    #[test]
    fn test_plain_reply_goes_idle() {
        let mut w = waiting(WaitOp::Request);
        let removed = w.remove(MsgType::RequestReply, Status::Ok).unwrap();
        assert_eq!(removed.refs, 1);
        assert!(removed.idle);
        assert_eq!(w, WaitState::Idle);
    }

    #[test]
    fn test_lookup_answered_by_request_reply() {
        let mut w = waiting(WaitOp::Lookup);
        assert!(w.remove(MsgType::RequestReply, Status::InProgress).is_ok());
        assert_eq!(w, WaitState::Idle);
    }

    #[test]
    fn test_deferred_overlap_is_returned() {
        let mut w = waiting(WaitOp::Request);
        w.defer(false);
        let removed = w.remove(MsgType::RequestReply, Status::InProgress).unwrap();
        assert!(removed.deferred.cancel);
        assert!(!removed.deferred.unlock);
        assert!(removed.idle);
    }

    #[test]
    fn test_granted_convert_zaps_cancel() {
        let mut w = waiting(WaitOp::Convert);
        w.add(WaitOp::Cancel).unwrap();
        let removed = w.remove(MsgType::ConvertReply, Status::Ok).unwrap();
        assert_eq!(removed.refs, 2);
        assert!(removed.idle);
        // the late cancel reply matches nothing
        assert!(w.remove(MsgType::CancelReply, Status::Ok).is_err());
    }

    #[test]
    fn test_queued_convert_keeps_cancel() {
        let mut w = waiting(WaitOp::Convert);
        w.add(WaitOp::Cancel).unwrap();
        let removed = w.remove(MsgType::ConvertReply, Status::InProgress).unwrap();
        assert_eq!(removed.refs, 1);
        assert!(!removed.idle);
        assert_eq!(
            w,
            WaitState::Overlapped {
                op: None,
                sent: Overlap {
                    unlock: false,
                    cancel: true
                },
                overtaken: false,
            }
        );
        let removed = w.remove(MsgType::CancelReply, Status::Cancelled).unwrap();
        assert!(removed.idle);
    }

    #[test]
    fn test_overlap_reply_first_keeps_original() {
        let mut w = waiting(WaitOp::Convert);
        w.add(WaitOp::Unlock).unwrap();
        assert_eq!(w.count(), 2);

        let removed = w.remove(MsgType::UnlockReply, Status::Unlocked).unwrap();
        assert_eq!(removed.refs, 1);
        assert!(!removed.idle);
        assert!(!removed.stale);
        assert_eq!(w.op(), Some(WaitOp::Convert));
        assert_eq!(w.count(), 1);
        assert!(w.is_overtaken());
        assert!(!w.is_overlap());

        // the original reply still matches, and is marked for absorbing
        let removed = w.remove(MsgType::ConvertReply, Status::Ok).unwrap();
        assert_eq!(removed.refs, 1);
        assert!(removed.idle);
        assert!(removed.stale);
        assert_eq!(w, WaitState::Idle);
    }

    #[test]
    fn test_cancel_reply_first_then_unlock() {
        let mut w = waiting(WaitOp::Convert);
        w.add(WaitOp::Cancel).unwrap();
        w.add(WaitOp::Unlock).unwrap();

        assert!(!w.remove(MsgType::CancelReply, Status::Cancelled).unwrap().idle);
        assert!(w.is_overtaken());
        assert!(w.is_overlap_unlock());
        assert!(!w.remove(MsgType::UnlockReply, Status::Unlocked).unwrap().idle);
        assert_eq!(w.count(), 1);

        let removed = w.remove(MsgType::ConvertReply, Status::InProgress).unwrap();
        assert!(removed.stale);
        assert!(removed.idle);
    }

    #[test]
    fn test_original_reply_first_is_not_stale() {
        let mut w = waiting(WaitOp::Convert);
        w.add(WaitOp::Unlock).unwrap();
        let removed = w.remove(MsgType::ConvertReply, Status::Ok).unwrap();
        assert!(!removed.stale);
        assert!(!removed.idle);
        assert!(w.is_overlap_unlock());
        assert!(!w.is_overtaken());
        assert!(w.remove(MsgType::UnlockReply, Status::Unlocked).unwrap().idle);
    }

    #[test]
    fn test_unexpected_reply() {
        let mut w = WaitState::Idle;
        assert!(w.remove(MsgType::UnlockReply, Status::Unlocked).is_err());
        let mut w = waiting(WaitOp::Unlock);
        assert!(w.remove(MsgType::ConvertReply, Status::Ok).is_err());
        assert_eq!(w.count(), 1);
    }

    #[test]
    fn test_reset_reports_everything() {
        let mut w = waiting(WaitOp::Convert);
        w.add(WaitOp::Cancel).unwrap();
        let (count, overlap) = w.reset();
        assert_eq!(count, 2);
        assert!(overlap.cancel);
        assert_eq!(w, WaitState::Idle);
    }
}
