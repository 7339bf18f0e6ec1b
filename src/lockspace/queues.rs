//! Resource queue manipulation, value blocks, and callback queueing.
//!
//! Every function here runs under the resource mutex. Queue membership holds
//! a lock reference.

use std::sync::Arc;

use tracing::{debug, error};

use crate::ast::Ast;
use crate::flags::{LkbFlags, LockFlags, RsbFlags, SbFlags};
use crate::mode::{LockMode, LvbOp};
use crate::status::Status;

use super::lkb::{Lkb, LkbState, LkbStatus};
use super::rsb::{Rsb, RsbInner};
use super::waiters::Overlap;
use super::Lockspace;

impl Lockspace {
    // ============ Queues ============

    /// Put `lkb` on the queue for `status`.
    ///
    /// The granted queue is kept ordered by granted mode, strongest first.
    /// HEADQUE puts a converting or waiting lock at the head of its queue.
    pub(crate) fn add_lkb(&self, ri: &mut RsbInner, lkb: &Arc<Lkb>, status: LkbStatus) {
        let (headque, grmode) = {
            let mut st = lkb.state();
            if st.status != LkbStatus::None {
                error!(lkid = lkb.id, status = ?st.status, "adding a queued lock");
            }
            st.status = status;
            (st.exflags.contains(LockFlags::HEADQUE), st.grmode)
        };
        lkb.hold();
        match status {
            LkbStatus::Granted => {
                let pos = ri
                    .grant
                    .iter()
                    .position(|other| other.state().grmode < grmode)
                    .unwrap_or(ri.grant.len());
                ri.grant.insert(pos, Arc::clone(lkb));
            }
            LkbStatus::Convert | LkbStatus::Waiting => {
                if let Some(queue) = ri.queue_mut(status) {
                    if headque {
                        queue.insert(0, Arc::clone(lkb));
                    } else {
                        queue.push(Arc::clone(lkb));
                    }
                }
            }
            LkbStatus::None => {
                error!(lkid = lkb.id, "adding a lock to no queue");
                self.unhold_lkb(lkb);
            }
        }
    }

    /// Take `lkb` off its queue. Returns false if it was on none.
    pub(crate) fn del_lkb(&self, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> bool {
        let status = std::mem::take(&mut lkb.state().status);
        let Some(queue) = ri.queue_mut(status) else {
            return false;
        };
        match queue.iter().position(|l| Arc::ptr_eq(l, lkb)) {
            Some(pos) => {
                queue.remove(pos);
                self.unhold_lkb(lkb);
                true
            }
            None => {
                self.abort("lock missing from its queue", lkb.id);
                false
            }
        }
    }

    pub(crate) fn move_lkb(&self, ri: &mut RsbInner, lkb: &Arc<Lkb>, status: LkbStatus) {
        // the queue reference keeps the lock alive across the move
        lkb.hold();
        self.del_lkb(ri, lkb);
        self.add_lkb(ri, lkb, status);
        self.unhold_lkb(lkb);
    }

    // ============ Value blocks ============

    fn resource_lvb<'a>(&self, ri: &'a mut RsbInner) -> &'a mut Box<[u8]> {
        let lvblen = self.config.lvblen;
        ri.lvb
            .get_or_insert_with(|| vec![0; lvblen].into_boxed_slice())
    }

    /// LVB transfer on a grant at the master.
    pub(crate) fn set_lvb_lock(&self, ri: &mut RsbInner, st: &mut LkbState) {
        if !st.exflags.contains(LockFlags::VALBLK) {
            return;
        }
        match st.grmode.lvb_op(st.rqmode) {
            LvbOp::Read => {
                let Some(lvb) = st.lvb.as_mut() else {
                    return;
                };
                let seq = ri.lvbseq;
                let src = self.resource_lvb(ri);
                let n = src.len().min(lvb.len());
                lvb[..n].copy_from_slice(&src[..n]);
                st.lvbseq = seq;
            }
            LvbOp::Write => {
                if st.exflags.contains(LockFlags::IVVALBLK) {
                    ri.flags.insert(RsbFlags::VALNOTVALID);
                    return;
                }
                let Some(lvb) = st.lvb.as_ref() else {
                    return;
                };
                let dst = self.resource_lvb(ri);
                let n = dst.len().min(lvb.len());
                dst[..n].copy_from_slice(&lvb[..n]);
                ri.lvbseq = ri.lvbseq.wrapping_add(1);
                st.lvbseq = ri.lvbseq;
                ri.flags.remove(RsbFlags::VALNOTVALID);
            }
            LvbOp::None => {}
        }
        if ri.flags.contains(RsbFlags::VALNOTVALID) {
            st.sbflags.insert(SbFlags::VALNOTVALID);
        }
    }

    /// LVB transfer when a writer releases its lock at the master.
    pub(crate) fn set_lvb_unlock(&self, ri: &mut RsbInner, st: &LkbState) {
        if st.grmode < LockMode::Pw {
            return;
        }
        if st.exflags.contains(LockFlags::IVVALBLK) {
            ri.flags.insert(RsbFlags::VALNOTVALID);
            return;
        }
        if !st.exflags.contains(LockFlags::VALBLK) {
            return;
        }
        let Some(lvb) = st.lvb.as_ref() else {
            return;
        };
        let dst = self.resource_lvb(ri);
        let n = dst.len().min(lvb.len());
        dst[..n].copy_from_slice(&lvb[..n]);
        ri.lvbseq = ri.lvbseq.wrapping_add(1);
        ri.flags.remove(RsbFlags::VALNOTVALID);
    }

    /// LVB transfer on a grant reported by the master.
    fn set_lvb_lock_pc(st: &mut LkbState, lvb: Option<&[u8]>, lvbseq: u32) {
        if !st.exflags.contains(LockFlags::VALBLK) {
            return;
        }
        if st.grmode.lvb_op(st.rqmode) != LvbOp::Read {
            return;
        }
        let (Some(dst), Some(src)) = (st.lvb.as_mut(), lvb) else {
            return;
        };
        let n = dst.len().min(src.len());
        dst[..n].copy_from_slice(&src[..n]);
        st.lvbseq = lvbseq;
    }

    // ============ Grant, revert, remove ============

    fn grant_lock_state(&self, ri: &mut RsbInner, lkb: &Arc<Lkb>) {
        let (requeue, status) = {
            let mut st = lkb.state();
            let changed = st.grmode != st.rqmode;
            st.grmode = st.rqmode;
            st.rqmode = LockMode::Iv;
            st.highbast = LockMode::Iv;
            (changed || st.status != LkbStatus::Granted, st.status)
        };
        if requeue {
            if status == LkbStatus::None {
                self.add_lkb(ri, lkb, LkbStatus::Granted);
            } else {
                self.move_lkb(ri, lkb, LkbStatus::Granted);
            }
        }
        self.stats.record_grant();
    }

    /// Grant at the master
    pub(crate) fn grant_lock(&self, ri: &mut RsbInner, lkb: &Arc<Lkb>) {
        {
            let mut st = lkb.state();
            self.set_lvb_lock(ri, &mut st);
        }
        self.grant_lock_state(ri, lkb);
    }

    /// Mirror a grant the master reported
    pub(crate) fn grant_lock_pc(
        &self,
        ri: &mut RsbInner,
        lkb: &Arc<Lkb>,
        lvb: Option<&[u8]>,
        lvbseq: u32,
    ) {
        Self::set_lvb_lock_pc(&mut lkb.state(), lvb, lvbseq);
        self.grant_lock_state(ri, lkb);
    }

    /// Grant a queued lock and tell its owner
    pub(crate) fn grant_lock_pending(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) {
        self.grant_lock(ri, lkb);
        if lkb.state().is_master_copy() {
            self.send_grant(r, lkb);
        } else {
            self.queue_cast(lkb, Status::Ok);
        }
    }

    /// Undo a pending conversion or request. Returns whether anything was
    /// pending.
    pub(crate) fn revert_lock(&self, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> bool {
        let status = {
            let mut st = lkb.state();
            st.rqmode = LockMode::Iv;
            st.status
        };
        match status {
            LkbStatus::Granted => false,
            LkbStatus::Convert => {
                self.move_lkb(ri, lkb, LkbStatus::Granted);
                true
            }
            LkbStatus::Waiting => {
                self.del_lkb(ri, lkb);
                lkb.state().grmode = LockMode::Iv;
                // the creation reference
                self.unhold_lkb(lkb);
                true
            }
            LkbStatus::None => {
                debug!(lkid = lkb.id, "revert of an unqueued lock");
                false
            }
        }
    }

    /// Release a lock at the master, writing its value block back
    pub(crate) fn remove_lock(&self, ri: &mut RsbInner, lkb: &Arc<Lkb>) {
        {
            let st = lkb.state();
            self.set_lvb_unlock(ri, &st);
        }
        self.remove_lock_pc(ri, lkb);
    }

    /// Release a lock whose master already did so
    pub(crate) fn remove_lock_pc(&self, ri: &mut RsbInner, lkb: &Arc<Lkb>) {
        self.del_lkb(ri, lkb);
        lkb.state().grmode = LockMode::Iv;
        // the creation reference
        self.unhold_lkb(lkb);
    }

    /// Adopt the alternate mode the master granted
    pub(crate) fn munge_altmode(st: &mut LkbState) {
        if st.exflags.contains(LockFlags::ALTPR) {
            st.rqmode = LockMode::Pr;
        } else if st.exflags.contains(LockFlags::ALTCW) {
            st.rqmode = LockMode::Cw;
        } else {
            error!(rqmode = %st.rqmode, "alternate mode granted without ALTPR or ALTCW");
        }
    }

    // ============ Callbacks ============

    /// Queue the completion of a local lock's operation.
    ///
    /// Cancels issued by the timeout scanner or the deadlock detector are
    /// reported as `TimedOut` and `Deadlock`.
    pub(crate) fn queue_cast(&self, lkb: &Arc<Lkb>, status: Status) {
        if lkb.state().is_master_copy() {
            return;
        }
        self.del_timeout(lkb);

        let mut st = lkb.state();
        let status = match status {
            Status::Cancelled if st.flags.contains(LkbFlags::TIMEOUT_CANCEL) => Status::TimedOut,
            Status::Cancelled if st.flags.contains(LkbFlags::DEADLOCK_CANCEL) => Status::Deadlock,
            other => other,
        };
        st.flags
            .remove(LkbFlags::TIMEOUT_CANCEL | LkbFlags::DEADLOCK_CANCEL);
        if status == Status::Unlocked || (status.is_failure() && st.grmode == LockMode::Iv) {
            st.flags.insert(LkbFlags::ENDOFLIFE);
        }
        let Some(owner) = st.owner.clone() else {
            error!(lkid = lkb.id, %status, "completion for a lock without owner");
            return;
        };
        let lvb = if st.exflags.contains(LockFlags::VALBLK) {
            st.lvb.clone()
        } else {
            None
        };
        let flags = st.sbflags;
        drop(st);

        debug!(lkid = lkb.id, %status, ?flags, "queue completion");
        self.stats.record_completion(status);
        self.asts.enqueue(Ast::Completion {
            lksb: owner.lksb,
            status,
            flags,
            lvb,
            callback: owner.on_complete,
        });
    }

    /// Complete a lock whose deferred unlock or cancel takes over
    pub(crate) fn queue_cast_overlap(&self, lkb: &Arc<Lkb>, overlap: Overlap) {
        if overlap.unlock {
            self.queue_cast(lkb, Status::Unlocked);
        } else if overlap.cancel {
            self.queue_cast(lkb, Status::Cancelled);
        }
    }

    /// Tell the holder of `lkb` that a request at `mode` is blocked on it
    pub(crate) fn queue_bast(&self, r: &Rsb, lkb: &Arc<Lkb>, mode: LockMode) {
        let st = lkb.state();
        if st.is_master_copy() {
            drop(st);
            self.send_bast(r, lkb, mode);
        } else if let Some(callback) = st.owner.as_ref().and_then(|o| o.on_blocking.clone()) {
            drop(st);
            debug!(lkid = lkb.id, %mode, "queue blocking callback");
            self.asts.enqueue(Ast::Blocking { mode, callback });
        } else {
            return;
        }
        self.stats.record_bast();
    }
}
