//! Master resolution, dispatch to the master, and the operations the master
//! executes.

use std::sync::Arc;

use tracing::{debug, error};

use crate::cluster::NodeRef;
use crate::flags::{LockFlags, RsbFlags};
use crate::status::Status;

use super::grant::Grantable;
use super::lkb::{Lkb, LkbStatus};
use super::rsb::{Rsb, RsbInner};
use super::Lockspace;

impl Lockspace {
    // ============ Master resolution ============

    /// Make sure the master of `r` is known before `lkb` is sent there.
    ///
    /// Returns `Ok(true)` when `lkb` can proceed, `Ok(false)` when it was
    /// parked behind another lock's lookup or its own lookup was sent.
    pub(crate) fn set_master(
        &self,
        r: &Rsb,
        ri: &mut RsbInner,
        lkb: &Arc<Lkb>,
    ) -> Result<bool, Status> {
        if ri.flags.contains(RsbFlags::MASTER_UNCERTAIN) {
            // the cached master is used, but confirmed by this request
            ri.flags.remove(RsbFlags::MASTER_UNCERTAIN);
            ri.first_lkid = lkb.id;
            lkb.state().nodeid = ri.master;
            return Ok(true);
        }

        if ri.first_lkid != 0 && ri.first_lkid != lkb.id {
            debug!(lkid = lkb.id, first = ri.first_lkid, "parked behind master lookup");
            ri.lookup.push_back(Arc::clone(lkb));
            return Ok(false);
        }

        if !ri.master.is_unknown() {
            lkb.state().nodeid = ri.master;
            return Ok(true);
        }

        let dir_nodeid = self.dir_nodeid(r.hash);
        if dir_nodeid == 0 {
            error!(name = %r.name_lossy(), "no directory node");
            self.queue_cast(lkb, Status::Again);
            return Err(Status::Again);
        }
        if dir_nodeid != self.our_nodeid {
            ri.first_lkid = lkb.id;
            let rv = self.send_lookup(r, lkb, dir_nodeid);
            if rv != Status::Ok {
                ri.first_lkid = 0;
                return Err(rv);
            }
            return Ok(false);
        }

        let master = self.directory.lookup(&r.name, self.our_nodeid);
        let master = NodeRef::from_nodeid(master, self.our_nodeid);
        debug!(name = %r.name_lossy(), ?master, "directory lookup");
        self.stats.record_lookup();
        ri.master = master;
        ri.first_lkid = if master.is_local() { 0 } else { lkb.id };
        lkb.state().nodeid = master;
        Ok(true)
    }

    /// Settle the master after the first request sent to it answered.
    ///
    /// Success releases the parked locks; a rejection moves the lookup on
    /// to the next parked lock.
    pub(crate) fn confirm_master(&self, r: &Rsb, ri: &mut RsbInner, result: Status) {
        if ri.first_lkid == 0 {
            return;
        }
        match result {
            Status::Ok | Status::InProgress => {
                ri.first_lkid = 0;
                self.process_lookup_list(r, ri);
            }
            Status::Again | Status::BadResource | Status::NotMasterHere => {
                ri.first_lkid = 0;
                if let Some(next) = ri.lookup.pop_front() {
                    ri.first_lkid = next.id;
                    self.request_async(r, ri, &next);
                }
            }
            other => {
                error!(name = %r.name_lossy(), result = %other, "confirm_master unexpected result");
            }
        }
    }

    pub(crate) fn process_lookup_list(&self, r: &Rsb, ri: &mut RsbInner) {
        let parked = std::mem::take(&mut ri.lookup);
        for lkb in parked {
            self.request_async(r, ri, &lkb);
        }
    }

    // ============ Dispatch ============

    /// Send a request to the master or execute it here.
    pub(crate) fn start_request(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        match self.set_master(r, ri, lkb) {
            Err(status) => return status,
            Ok(false) => return Status::Ok,
            Ok(true) => {}
        }
        if ri.master.is_local() {
            let rv = self.do_request(r, ri, lkb);
            self.do_request_effects(r, ri, lkb, rv);
            rv
        } else {
            self.send_request(r, ri, lkb)
        }
    }

    /// `start_request` for a lock whose caller was already told the request
    /// was accepted: a failure completes the lock.
    pub(crate) fn request_async(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) {
        let rv = self.start_request(r, ri, lkb);
        if rv.is_failure() {
            if rv != Status::Again {
                self.queue_cast(lkb, rv);
            }
            // the creation reference
            self.put_lkb(lkb);
        }
    }

    pub(crate) fn start_convert(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        if ri.master.is_local() {
            let rv = self.do_convert(r, ri, lkb);
            self.do_convert_effects(r, ri, lkb, rv);
            rv
        } else {
            self.send_convert(r, ri, lkb)
        }
    }

    pub(crate) fn start_unlock(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        if ri.master.is_local() {
            let rv = self.do_unlock(r, ri, lkb);
            self.do_unlock_effects(r, ri, lkb, rv);
            rv
        } else {
            self.send_unlock(r, ri, lkb)
        }
    }

    pub(crate) fn start_cancel(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        if ri.master.is_local() {
            let rv = self.do_cancel(r, ri, lkb);
            self.do_cancel_effects(r, ri, lkb, rv);
            rv
        } else {
            self.send_cancel(r, ri, lkb)
        }
    }

    // ============ Master operations ============

    pub(crate) fn do_request(&self, _r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        if self.can_be_granted(ri, lkb, true, false).yes() {
            self.grant_lock(ri, lkb);
            self.queue_cast(lkb, Status::Ok);
            return Status::Ok;
        }
        if lkb.state().can_be_queued() {
            self.add_lkb(ri, lkb, LkbStatus::Waiting);
            self.add_timeout(lkb);
            return Status::InProgress;
        }
        self.queue_cast(lkb, Status::Again);
        Status::Again
    }

    pub(crate) fn do_request_effects(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>, rv: Status) {
        match rv {
            Status::InProgress => self.send_blocking_asts(r, ri, lkb),
            Status::Again if lkb.state().force_blocking_asts() => {
                self.send_blocking_asts_all(r, ri, lkb)
            }
            _ => {}
        }
    }

    pub(crate) fn do_convert(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        let grantable = self.can_be_granted(ri, lkb, true, false);
        if grantable.yes() {
            self.grant_lock(ri, lkb);
            self.queue_cast(lkb, Status::Ok);
            return Status::Ok;
        }

        // deadlocked conversions stay granted at their old mode
        if grantable == Grantable::Deadlock && !lkb.state().exflags.contains(LockFlags::NODLCKWT) {
            self.revert_lock(ri, lkb);
            self.queue_cast(lkb, Status::Deadlock);
            return Status::Deadlock;
        }

        // Demotion to NL may have made other conversions (and this one)
        // grantable; they go first.
        if lkb.state().is_demoted() {
            // the grant queue is ordered by grmode, which just became NL
            self.move_lkb(ri, lkb, LkbStatus::Granted);
            self.grant_pending_converts(r, ri);
            if self.can_be_granted(ri, lkb, true, false).yes() {
                self.grant_lock(ri, lkb);
                self.queue_cast(lkb, Status::Ok);
                return Status::Ok;
            }
        }

        if lkb.state().can_be_queued() {
            self.move_lkb(ri, lkb, LkbStatus::Convert);
            self.add_timeout(lkb);
            return Status::InProgress;
        }

        self.revert_lock(ri, lkb);
        self.queue_cast(lkb, Status::Again);
        Status::Again
    }

    pub(crate) fn do_convert_effects(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>, rv: Status) {
        match rv {
            Status::Ok => {
                self.grant_pending_locks(r, ri, false);
            }
            Status::InProgress => self.send_blocking_asts(r, ri, lkb),
            Status::Again if lkb.state().force_blocking_asts() => {
                self.send_blocking_asts_all(r, ri, lkb)
            }
            _ => {}
        }
    }

    pub(crate) fn do_unlock(&self, _r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        self.remove_lock(ri, lkb);
        self.queue_cast(lkb, Status::Unlocked);
        Status::Unlocked
    }

    pub(crate) fn do_unlock_effects(&self, r: &Rsb, ri: &mut RsbInner, _lkb: &Arc<Lkb>, _rv: Status) {
        self.grant_pending_locks(r, ri, false);
    }

    pub(crate) fn do_cancel(&self, _r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        if self.revert_lock(ri, lkb) {
            self.queue_cast(lkb, Status::Cancelled);
            return Status::Cancelled;
        }
        Status::Ok
    }

    pub(crate) fn do_cancel_effects(&self, r: &Rsb, ri: &mut RsbInner, _lkb: &Arc<Lkb>, rv: Status) {
        if rv == Status::Cancelled {
            self.grant_pending_locks(r, ri, false);
        }
    }
}
