//! Recovery after a membership change.
//!
//! [`Lockspace::recover`] runs with the barrier held for writing, so no
//! caller operation or message handler runs alongside it. Messages that
//! arrive meanwhile are queued and processed before the barrier is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::cluster::{NodeId, NodeRef};
use crate::flags::{LkbFlags, LockFlags, RsbFlags};
use crate::mode::LockMode;
use crate::status::Status;
use crate::wire::MsgType;

use super::lkb::{Lkb, LkbStatus};
use super::receive::Origin;
use super::rsb::{Rsb, RsbInner};
use super::waiters::{Overlap, WaitOp};
use super::Lockspace;

/// A reply recovery made up for an operation whose peer left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubReply {
    /// Lock the reply was applied to
    pub lkid: u32,
    /// Reply type
    pub reply: MsgType,
    /// Result it carried
    pub result: Status,
}

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Master copies of departed nodes' locks removed
    pub purged: usize,
    /// Replies made up for operations that will never be answered
    pub stubs: Vec<StubReply>,
    /// Locks whose operation was sent again, in order
    pub resent: Vec<u32>,
    /// Resources whose cached master departed
    pub masters_reset: usize,
    /// Resources this node took over as master
    pub adopted: usize,
    /// Waiting locks replayed as new requests at a new master
    pub requeued: usize,
    /// Toss list entries dropped
    pub dropped_toss: usize,
    /// Queued messages from departed nodes dropped
    pub dropped_messages: usize,
    /// Time the lockspace was held
    pub duration: Duration,
}

/// Work carried between the phases of one recovery.
#[derive(Default)]
struct RecoveryPass {
    report: RecoveryReport,
    /// Locks to replay, each with a reference
    resend: Vec<(Arc<Lkb>, WaitOp)>,
    /// Resources mastered here whose queues need re-driving, each with a
    /// reference
    regrant: Vec<Arc<Rsb>>,
}

impl RecoveryPass {
    fn push_resend(&mut self, lkb: &Arc<Lkb>, op: WaitOp) {
        if self.resend.iter().any(|(l, _)| Arc::ptr_eq(l, lkb)) {
            return;
        }
        lkb.state().flags.insert(LkbFlags::RESEND);
        lkb.hold();
        self.resend.push((Arc::clone(lkb), op));
    }

    fn push_regrant(&mut self, r: &Arc<Rsb>) {
        if self.regrant.iter().any(|x| Arc::ptr_eq(x, r)) {
            return;
        }
        r.hold();
        self.regrant.push(Arc::clone(r));
    }
}

/// Pick the resource LVB from the locks that survived: the value of any
/// holder above CR wins; otherwise the newest one is kept but marked not
/// valid.
fn recover_lvb(ri: &mut RsbInner, lvblen: usize) {
    let mut seen = false;
    let mut best: Option<(u32, Vec<u8>)> = None;
    let mut big: Option<(u32, Vec<u8>)> = None;
    for lkb in ri.grant.iter().chain(ri.convert.iter()) {
        let st = lkb.state();
        if !st.exflags.contains(LockFlags::VALBLK) {
            continue;
        }
        seen = true;
        let lvb = st.lvb.clone().unwrap_or_default();
        if st.grmode > LockMode::Cr {
            big = Some((st.lvbseq, lvb));
            break;
        }
        let newer = best
            .as_ref()
            .map_or(true, |(seq, _)| st.lvbseq.wrapping_sub(*seq) as i32 >= 0);
        if newer {
            best = Some((st.lvbseq, lvb));
        }
    }
    if !seen {
        return;
    }
    if big.is_none() {
        ri.flags.insert(RsbFlags::VALNOTVALID);
    }
    let (seq, mut lvb) = big.or(best).unwrap_or((0, Vec::new()));
    lvb.resize(lvblen, 0);
    ri.lvbseq = seq;
    ri.lvb = Some(lvb.into_boxed_slice());
}

impl Lockspace {
    /// Bring the lockspace in line with the current membership.
    ///
    /// Called after the membership layer removed nodes. Operations waiting
    /// on departed peers are answered locally or resent, master copies the
    /// departed nodes owned are dropped, and resources whose master left
    /// are re-resolved.
    pub fn recover(&self) -> RecoveryReport {
        let start = Instant::now();
        self.requestqueue.lock().stopped = true;
        let _barrier = self.barrier.write();
        info!(lockspace = %self.name, "recovery started");

        let mut pass = RecoveryPass::default();
        pass.report.dropped_messages = self.purge_requestqueue();
        pass.report.purged = self.purge_departed(&mut pass);
        self.recover_waiters_pre(&mut pass);
        self.recover_masters(&mut pass);
        self.recover_grant(&mut pass);
        pass.report.dropped_toss = self.rsbs.purge_toss(|r| {
            let ri = r.lock();
            self.master_departed(r, &ri)
        });
        self.recover_waiters_post(&mut pass);

        let took = start.elapsed();
        self.adjust_timeouts(took);
        self.drain_requestqueue();

        let mut report = pass.report;
        report.duration = took;
        self.stats.record_recovery();
        info!(
            lockspace = %self.name,
            purged = report.purged,
            stubs = report.stubs.len(),
            resent = report.resent.len(),
            adopted = report.adopted,
            elapsed_ms = took.as_millis() as u64,
            "recovery done"
        );
        report
    }

    fn node_removed(&self, nodeid: NodeId) -> bool {
        self.membership.is_removed(nodeid)
    }

    /// Whether the peer an operation went to can no longer answer for it
    fn waiter_needs_recovery(&self, r: &Rsb, nodeid: NodeId) -> bool {
        self.node_removed(nodeid) || (self.config.no_directory && self.dir_nodeid(r.hash) != nodeid)
    }

    fn master_departed(&self, r: &Rsb, ri: &RsbInner) -> bool {
        match ri.master {
            NodeRef::Remote(n) => {
                self.node_removed(n) || (self.config.no_directory && self.hash_master(r.hash) != ri.master)
            }
            _ => false,
        }
    }

    fn purge_requestqueue(&self) -> usize {
        let mut rq = self.requestqueue.lock();
        let before = rq.queue.len();
        rq.queue
            .retain(|frame| !self.membership.is_removed(frame.nodeid));
        let dropped = before - rq.queue.len();
        if dropped > 0 {
            debug!(lockspace = %self.name, dropped, "dropped queued messages from departed nodes");
        }
        dropped
    }

    /// Process the messages that arrived during recovery, then reopen.
    fn drain_requestqueue(&self) {
        loop {
            let next = {
                let mut rq = self.requestqueue.lock();
                match rq.queue.pop_front() {
                    Some(frame) => Some(frame),
                    None => {
                        rq.stopped = false;
                        None
                    }
                }
            };
            match next {
                Some(frame) => self.dispatch(frame),
                None => break,
            }
        }
    }

    /// Drop the master copies departed nodes owned on resources mastered
    /// here.
    fn purge_departed(&self, pass: &mut RecoveryPass) -> usize {
        let mut purged = 0;
        for r in self.rsbs.snapshot() {
            {
                let mut ri = r.lock();
                if ri.master.is_local() {
                    let gone: Vec<_> = ri
                        .all_locks()
                        .into_iter()
                        .filter(|lkb| {
                            let st = lkb.state();
                            st.is_master_copy()
                                && st.nodeid.remote().is_some_and(|n| self.node_removed(n))
                        })
                        .collect();
                    for lkb in &gone {
                        let lost_lvb = {
                            let st = lkb.state();
                            st.exflags.contains(LockFlags::VALBLK) && st.grmode >= LockMode::Pw
                        };
                        if lost_lvb {
                            ri.flags.insert(RsbFlags::VALNOTVALID);
                        }
                        debug!(lkid = lkb.id, name = %r.name_lossy(), "purging master copy of departed node");
                        self.del_lkb(&mut ri, lkb);
                        // the creation reference; this frees the lock
                        self.put_lkb(lkb);
                    }
                    if !gone.is_empty() {
                        purged += gone.len();
                        pass.push_regrant(&r);
                    }
                }
            }
            self.rsbs.put(&r);
        }
        purged
    }

    /// Answer or mark for resending every operation waiting on a departed
    /// peer.
    fn recover_waiters_pre(&self, pass: &mut RecoveryPass) {
        for lkb in self.waiters_snapshot() {
            lkb.hold();
            if let Some(r) = lkb.resource() {
                r.hold();
                {
                    let mut ri = r.lock();
                    self.recover_waiter(&r, &mut ri, &lkb, pass);
                }
                self.rsbs.put(&r);
            }
            self.put_lkb(&lkb);
        }
    }

    fn recover_waiter(&self, r: &Arc<Rsb>, ri: &mut RsbInner, lkb: &Arc<Lkb>, pass: &mut RecoveryPass) {
        let (op, overlap, overtaken, wait_nodeid, never_granted, middle) = {
            let st = lkb.state();
            (
                st.wait.op(),
                st.wait.overlap(),
                st.wait.is_overtaken(),
                st.wait_nodeid,
                st.grmode == LockMode::Iv,
                st.is_middle_conversion(),
            )
        };

        // lookups are resent whenever their directory node changed
        if op == Some(WaitOp::Lookup) {
            if self.node_removed(wait_nodeid) || self.dir_nodeid(r.hash) != wait_nodeid {
                debug!(lkid = lkb.id, wait_nodeid, "lookup will be resent");
                pass.push_resend(lkb, WaitOp::Request);
            }
            return;
        }
        if !self.waiter_needs_recovery(r, wait_nodeid) {
            return;
        }
        if overtaken {
            // the lost reply would have been absorbed anyway
            self.stub_overlaps(ri, lkb, overlap, never_granted, pass);
            self.clear_waiters(lkb);
            return;
        }

        match op {
            Some(WaitOp::Request) => pass.push_resend(lkb, WaitOp::Request),
            Some(WaitOp::Convert) if middle => {
                // the master's queues are gone; the conversion restarts
                // from NL
                self.stub_reply(ri, lkb, MsgType::ConvertReply, Status::InProgress, pass);
                lkb.state().grmode = LockMode::Nl;
                ri.flags.insert(RsbFlags::RECOVER_CONVERT);
                pass.push_resend(lkb, WaitOp::Convert);
            }
            Some(WaitOp::Convert) => pass.push_resend(lkb, WaitOp::Convert),
            Some(WaitOp::Unlock) => {
                let result = if never_granted { Status::NotFound } else { Status::Unlocked };
                self.stub_reply(ri, lkb, MsgType::UnlockReply, result, pass);
            }
            Some(WaitOp::Cancel) => {
                let result = if never_granted { Status::Ok } else { Status::Cancelled };
                self.stub_reply(ri, lkb, MsgType::CancelReply, result, pass);
            }
            Some(WaitOp::Lookup) => {}
            // the main reply came; only the overlap is missing
            None => self.stub_overlaps(ri, lkb, overlap, never_granted, pass),
        }
    }

    fn stub_overlaps(
        &self,
        ri: &mut RsbInner,
        lkb: &Arc<Lkb>,
        overlap: Overlap,
        never_granted: bool,
        pass: &mut RecoveryPass,
    ) {
        if overlap.cancel {
            let result = if never_granted { Status::Ok } else { Status::Cancelled };
            self.stub_reply(ri, lkb, MsgType::CancelReply, result, pass);
        }
        if overlap.unlock {
            let result = if never_granted { Status::NotFound } else { Status::Unlocked };
            self.stub_reply(ri, lkb, MsgType::UnlockReply, result, pass);
        }
    }

    fn stub_reply(
        &self,
        ri: &mut RsbInner,
        lkb: &Arc<Lkb>,
        reply: MsgType,
        result: Status,
        pass: &mut RecoveryPass,
    ) {
        if self.remove_from_waiters(lkb, reply, result).is_err() {
            return;
        }
        debug!(lkid = lkb.id, ?reply, %result, "stub reply");
        self.stats.record_stub();
        pass.report.stubs.push(StubReply {
            lkid: lkb.id,
            reply,
            result,
        });
        match reply {
            MsgType::ConvertReply => self.apply_convert_reply(ri, lkb, Origin::Stub, None, result, None),
            MsgType::UnlockReply => self.apply_unlock_reply(ri, lkb, Origin::Stub, None, result),
            MsgType::CancelReply => self.apply_cancel_reply(ri, lkb, Origin::Stub, None, result),
            _ => {}
        }
    }

    /// Forget departed masters; resources with locks held here get a new
    /// master right away.
    fn recover_masters(&self, pass: &mut RecoveryPass) {
        for r in self.rsbs.snapshot() {
            {
                let mut ri = r.lock();
                if self.master_departed(&r, &ri) {
                    pass.report.masters_reset += 1;
                    self.recover_master(&r, &mut ri, pass);
                }
            }
            self.rsbs.put(&r);
        }
    }

    fn recover_master(&self, r: &Arc<Rsb>, ri: &mut RsbInner, pass: &mut RecoveryPass) {
        let old = ri.master;
        ri.first_lkid = 0;
        ri.flags.remove(RsbFlags::MASTER_UNCERTAIN);

        if ri.grant.is_empty() && ri.convert.is_empty() && ri.wait.is_empty() {
            debug!(name = %r.name_lossy(), ?old, "master departed");
            ri.master = NodeRef::Unknown;
            return;
        }

        let master = if self.config.no_directory {
            self.hash_master(r.hash)
        } else {
            NodeRef::from_nodeid(self.directory.lookup(&r.name, self.our_nodeid), self.our_nodeid)
        };
        debug!(name = %r.name_lossy(), ?old, new = ?master, "master re-resolved");
        ri.master = master;

        if master.is_local() {
            for lkb in ri.all_locks() {
                let mut st = lkb.state();
                st.nodeid = NodeRef::Local;
                st.remid = 0;
            }
            recover_lvb(ri, self.config.lvblen);
            pass.report.adopted += 1;
            pass.push_regrant(r);
            return;
        }

        for lkb in ri.grant.clone() {
            lkb.state().nodeid = master;
        }
        for lkb in ri.convert.clone() {
            lkb.state().nodeid = master;
            self.move_lkb(ri, &lkb, LkbStatus::Granted);
            pass.push_resend(&lkb, WaitOp::Convert);
        }
        for lkb in ri.wait.clone() {
            self.del_lkb(ri, &lkb);
            lkb.state().nodeid = NodeRef::Unknown;
            pass.report.requeued += 1;
            pass.push_resend(&lkb, WaitOp::Request);
        }
    }

    /// Re-drive the queues of resources that changed under recovery
    fn recover_grant(&self, pass: &mut RecoveryPass) {
        for r in std::mem::take(&mut pass.regrant) {
            {
                let mut ri = r.lock();
                if ri.master.is_local() {
                    let recover = ri.flags.contains(RsbFlags::RECOVER_CONVERT);
                    ri.flags.remove(RsbFlags::RECOVER_CONVERT);
                    let granted = self.grant_pending_locks(&r, &mut ri, recover);
                    debug!(name = %r.name_lossy(), granted, "queues re-driven");
                }
            }
            self.rsbs.put(&r);
        }
    }

    /// Replay what the pre phase marked, or finish locks whose unlock or
    /// cancel came in while their operation was lost.
    fn recover_waiters_post(&self, pass: &mut RecoveryPass) {
        for (lkb, op) in std::mem::take(&mut pass.resend) {
            if let Some(r) = lkb.resource() {
                r.hold();
                {
                    let mut ri = r.lock();
                    let overlap = self.clear_waiters(&lkb);
                    if overlap.is_empty() {
                        if self.resend(&r, &mut ri, &lkb, op) {
                            pass.report.resent.push(lkb.id);
                            self.stats.record_resend();
                        }
                    } else {
                        self.finish_overlap(&r, &mut ri, &lkb, op, overlap);
                    }
                }
                self.rsbs.put(&r);
            }
            self.put_lkb(&lkb);
        }
    }

    /// Replay `op` for `lkb`. Returns false when there was nothing left to
    /// replay.
    fn resend(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>, op: WaitOp) -> bool {
        match op {
            WaitOp::Request => {
                debug!(lkid = lkb.id, ?op, master = ?ri.master, "resending");
                self.request_async(r, ri, lkb);
                if ri.master.is_local() && ri.first_lkid == 0 && !ri.lookup.is_empty() {
                    self.process_lookup_list(r, ri);
                }
                true
            }
            WaitOp::Convert => {
                let (status, rqmode) = {
                    let st = lkb.state();
                    (st.status, st.rqmode)
                };
                // granted by the regrant pass on this node
                if rqmode == LockMode::Iv {
                    debug!(lkid = lkb.id, "conversion settled during recovery");
                    return false;
                }
                // a local master re-drives its convert queue itself
                if status == LkbStatus::Convert && ri.master.is_local() {
                    return false;
                }
                debug!(lkid = lkb.id, ?op, master = ?ri.master, "resending");
                self.start_convert(r, ri, lkb);
                true
            }
            other => {
                debug!(lkid = lkb.id, ?other, "nothing to resend");
                false
            }
        }
    }

    fn finish_overlap(
        &self,
        r: &Rsb,
        ri: &mut RsbInner,
        lkb: &Arc<Lkb>,
        op: WaitOp,
        overlap: Overlap,
    ) {
        debug!(lkid = lkb.id, ?op, ?overlap, "overlap replaces resend");
        match op {
            WaitOp::Request => {
                self.queue_cast_overlap(lkb, overlap);
                // the creation reference
                self.unhold_lkb(lkb);
            }
            _ if overlap.cancel && !overlap.unlock => {
                self.revert_lock(ri, lkb);
                self.queue_cast(lkb, Status::Cancelled);
            }
            _ => {
                lkb.state().exflags.insert(LockFlags::FORCEUNLOCK);
                self.start_unlock(r, ri, lkb);
            }
        }
    }
}
