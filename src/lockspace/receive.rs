//! Inbound message handlers.
//!
//! Handlers run with the recovery barrier held for reading (or, while
//! recovery drains its queue, held for writing by recovery itself), so they
//! never take it.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::cluster::{NodeId, NodeRef};
use crate::flags::{LockFlags, LkbFlags};
use crate::mode::LockMode;
use crate::status::Status;
use crate::wire::{Frame, LockFields, Message, MsgType};

use super::lkb::{Lkb, LkbState, LkbStatus};
use super::rsb::{Rsb, RsbInner};
use super::Lockspace;

/// Where a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Sent by a peer
    Peer(NodeId),
    /// Made up locally, for a reply that will never arrive
    Stub,
}

fn receive_flags(st: &mut LkbState, lock: &LockFields) {
    st.exflags = lock.exflags;
    st.sbflags = lock.sbflags;
    st.flags.merge_shared(lock.flags);
}

fn receive_flags_reply(st: &mut LkbState, lock: Option<&LockFields>, origin: Origin) {
    if origin == Origin::Stub {
        return;
    }
    if let Some(lock) = lock {
        st.sbflags = lock.sbflags;
        st.flags.merge_shared(lock.flags);
    }
}

/// Whether an unlock was sent or deferred; its completion is the only one
/// the caller gets.
fn unlock_outstanding(st: &LkbState) -> bool {
    use super::waiters::WaitOp;
    st.wait.op() == Some(WaitOp::Unlock) || st.wait.is_overlap_unlock()
}

impl Lockspace {
    /// Route one message to its handler
    pub(crate) fn dispatch(&self, frame: Frame) {
        let from = frame.nodeid;
        self.stats.record_receive();
        match frame.message {
            Message::Request { lock, name } => self.receive_request(from, &lock, &name),
            Message::Convert { lock, lvb } => self.receive_convert(from, &lock, lvb),
            Message::Unlock { lock, lvb } => self.receive_unlock(from, &lock, lvb),
            Message::Cancel { lock } => self.receive_cancel(from, &lock),
            Message::RequestReply { lock, result, lvb } => {
                self.receive_request_reply(from, &lock, result, lvb.as_deref())
            }
            Message::ConvertReply { lock, result, lvb } => {
                self.receive_convert_reply(from, &lock, result, lvb.as_deref())
            }
            Message::UnlockReply { lock, result } => self.receive_unlock_reply(from, &lock, result),
            Message::CancelReply { lock, result } => self.receive_cancel_reply(from, &lock, result),
            Message::Grant { lock, lvb } => self.receive_grant(from, &lock, lvb.as_deref()),
            Message::Bast { lock, mode } => self.receive_bast(from, &lock, mode),
            Message::Lookup { lock, name } => self.receive_lookup(from, &lock, &name),
            Message::Remove { hash, name } => self.receive_remove(from, hash, &name),
            Message::LookupReply {
                lkid,
                master,
                result,
            } => self.receive_lookup_reply(from, lkid, master, result),
            Message::Purge { pid, .. } => {
                self.do_purge(pid);
            }
        }
    }

    /// Find the lock a message names, with references on it and its
    /// resource.
    fn message_lock(&self, lkid: u32) -> Option<(Arc<Lkb>, Arc<Rsb>)> {
        let lkb = self.lkbs.find(lkid)?;
        match lkb.resource() {
            Some(r) => {
                r.hold();
                Some((lkb, r))
            }
            None => {
                self.put_lkb(&lkb);
                None
            }
        }
    }

    fn release_message_lock(&self, lkb: &Arc<Lkb>, r: &Arc<Rsb>) {
        self.rsbs.put(r);
        self.put_lkb(lkb);
    }

    /// Check that a message for `st` comes from where it should.
    fn validate_message(&self, lkid: u32, st: &LkbState, msg: MsgType, origin: Origin) -> bool {
        let Origin::Peer(from) = origin else {
            return true;
        };
        let peer = st.nodeid.remote();
        let ok = match msg {
            MsgType::Convert | MsgType::Unlock | MsgType::Cancel => {
                st.is_master_copy() && peer == Some(from)
            }
            MsgType::ConvertReply
            | MsgType::UnlockReply
            | MsgType::CancelReply
            | MsgType::Grant
            | MsgType::Bast => !st.is_master_copy() && peer == Some(from),
            MsgType::RequestReply => {
                !st.is_master_copy() && (st.nodeid.is_unknown() || peer == Some(from))
            }
            _ => false,
        };
        if !ok {
            warn!(
                lockspace = %self.name,
                lkid = format_args!("{lkid:08x}"),
                ?msg,
                from,
                nodeid = ?st.nodeid,
                master_copy = st.is_master_copy(),
                "message does not match lock"
            );
        }
        ok
    }

    // ============ Master side ============

    fn receive_request(&self, from: NodeId, lock: &LockFields, name: &[u8]) {
        let lkb = self.lkbs.create();
        {
            let mut st = lkb.state();
            receive_flags(&mut st, lock);
            st.flags.insert(LkbFlags::MSTCPY);
            st.nodeid = NodeRef::Remote(from);
            st.ownpid = lock.pid;
            st.remid = lock.lkid;
            st.grmode = LockMode::Iv;
            st.rqmode = lock.rqmode;
            st.remote_asts = lock.asts;
            if st.exflags.contains(LockFlags::VALBLK) {
                st.lvb = Some(vec![0; self.config.lvblen]);
            }
        }

        let found = if lock.rqmode == LockMode::Iv {
            Err(Status::Invalid)
        } else {
            self.find_master_rsb(name)
        };
        let r = match found {
            Ok(r) => r,
            Err(status) => {
                self.put_lkb(&lkb);
                self.send_fail_reply(from, MsgType::RequestReply, lock.lkid, status);
                return;
            }
        };

        let rv = {
            let mut ri = r.lock();
            if ri.master.is_local() {
                self.attach_lkb(&r, &lkb);
                let rv = self.do_request(&r, &mut ri, &lkb);
                self.send_request_reply(&r, &lkb, rv);
                self.do_request_effects(&r, &mut ri, &lkb, rv);
                rv
            } else {
                debug!(name = %r.name_lossy(), master = ?ri.master, from, "request for resource mastered elsewhere");
                Status::NotMasterHere
            }
        };
        self.rsbs.put(&r);

        if rv == Status::NotMasterHere {
            self.send_fail_reply(from, MsgType::RequestReply, lock.lkid, rv);
        }
        if rv.is_failure() {
            self.put_lkb(&lkb);
        }
    }

    /// Look up the master copy a convert, unlock or cancel names. Failures
    /// are answered here.
    fn master_copy(&self, from: NodeId, lock: &LockFields, reply: MsgType) -> Option<(Arc<Lkb>, Arc<Rsb>)> {
        let Some((lkb, r)) = self.message_lock(lock.remid) else {
            debug!(remid = lock.remid, from, ?reply, "no master copy");
            self.send_fail_reply(from, reply, lock.lkid, Status::NotFound);
            return None;
        };
        let remid = lkb.state().remid;
        if remid != lock.lkid {
            warn!(
                lkid = format_args!("{:08x}", lkb.id),
                remid = format_args!("{remid:08x}"),
                sender = format_args!("{:08x}", lock.lkid),
                from,
                "remote lock id mismatch"
            );
            self.release_message_lock(&lkb, &r);
            self.send_fail_reply(from, reply, lock.lkid, Status::Invalid);
            return None;
        }
        Some((lkb, r))
    }

    /// Store the value block a peer sent along
    fn receive_lvb(&self, st: &mut LkbState, lvb: Option<Vec<u8>>) {
        if !st.exflags.contains(LockFlags::VALBLK) {
            return;
        }
        let mut lvb = lvb.unwrap_or_default();
        lvb.resize(self.config.lvblen, 0);
        st.lvb = Some(lvb);
    }

    fn receive_convert(&self, from: NodeId, lock: &LockFields, lvb: Option<Vec<u8>>) {
        let Some((lkb, r)) = self.master_copy(from, lock, MsgType::ConvertReply) else {
            return;
        };
        {
            let mut ri = r.lock();
            let granted = {
                let mut st = lkb.state();
                if self.validate_message(lkb.id, &st, MsgType::Convert, Origin::Peer(from)) {
                    receive_flags(&mut st, lock);
                    Some(st.status == LkbStatus::Granted)
                } else {
                    None
                }
            };
            match granted {
                None => {}
                Some(false) => self.send_convert_reply(&r, &lkb, Status::Busy),
                Some(true) => {
                    let reply = {
                        let mut st = lkb.state();
                        st.rqmode = lock.rqmode;
                        st.lvbseq = lock.lvbseq;
                        self.receive_lvb(&mut st, lvb);
                        // down-conversions are not answered
                        !st.is_down_conversion()
                    };
                    let rv = self.do_convert(&r, &mut ri, &lkb);
                    if reply {
                        self.send_convert_reply(&r, &lkb, rv);
                    }
                    self.do_convert_effects(&r, &mut ri, &lkb, rv);
                }
            }
        }
        self.release_message_lock(&lkb, &r);
    }

    fn receive_unlock(&self, from: NodeId, lock: &LockFields, lvb: Option<Vec<u8>>) {
        let Some((lkb, r)) = self.master_copy(from, lock, MsgType::UnlockReply) else {
            return;
        };
        {
            let mut ri = r.lock();
            let valid = {
                let mut st = lkb.state();
                let valid = self.validate_message(lkb.id, &st, MsgType::Unlock, Origin::Peer(from));
                if valid {
                    receive_flags(&mut st, lock);
                    self.receive_lvb(&mut st, lvb);
                }
                valid
            };
            if valid {
                let rv = self.do_unlock(&r, &mut ri, &lkb);
                self.send_unlock_reply(&r, &lkb, rv);
                self.do_unlock_effects(&r, &mut ri, &lkb, rv);
            }
        }
        self.release_message_lock(&lkb, &r);
    }

    fn receive_cancel(&self, from: NodeId, lock: &LockFields) {
        let Some((lkb, r)) = self.master_copy(from, lock, MsgType::CancelReply) else {
            return;
        };
        {
            let mut ri = r.lock();
            let valid = {
                let mut st = lkb.state();
                let valid = self.validate_message(lkb.id, &st, MsgType::Cancel, Origin::Peer(from));
                if valid {
                    receive_flags(&mut st, lock);
                }
                valid
            };
            if valid {
                let rv = self.do_cancel(&r, &mut ri, &lkb);
                self.send_cancel_reply(&r, &lkb, rv);
                self.do_cancel_effects(&r, &mut ri, &lkb, rv);
            }
        }
        self.release_message_lock(&lkb, &r);
    }

    // ============ Directory node ============

    fn receive_lookup(&self, from: NodeId, lock: &LockFields, name: &[u8]) {
        let dir_nodeid = self.dir_nodeid(lock.hash);
        if dir_nodeid != self.our_nodeid {
            warn!(from, dir_nodeid, name = %String::from_utf8_lossy(name), "lookup sent to the wrong directory node");
            self.send_lookup_reply(from, lock.lkid, 0, Status::Invalid);
            return;
        }
        let master = self.directory.lookup(name, from);
        if master == self.our_nodeid {
            // we are the master: the lookup doubles as the request
            self.receive_request(from, lock, name);
            return;
        }
        self.send_lookup_reply(from, lock.lkid, master, Status::Ok);
    }

    fn receive_remove(&self, from: NodeId, hash: u32, name: &[u8]) {
        let dir_nodeid = self.dir_nodeid(hash);
        if dir_nodeid != self.our_nodeid {
            warn!(from, dir_nodeid, name = %String::from_utf8_lossy(name), "remove sent to the wrong directory node");
            return;
        }
        self.directory.remove(name, from);
    }

    // ============ Process side ============

    fn receive_request_reply(&self, from: NodeId, lock: &LockFields, result: Status, lvb: Option<&[u8]>) {
        let Some((lkb, r)) = self.message_lock(lock.remid) else {
            warn!(remid = lock.remid, from, %result, "request reply for unknown lock");
            return;
        };
        {
            let mut ri = r.lock();
            let (valid, op) = {
                let st = lkb.state();
                (
                    self.validate_message(lkb.id, &st, MsgType::RequestReply, Origin::Peer(from)),
                    st.wait.op(),
                )
            };
            if valid {
                if let Ok(deferred) = self.remove_from_waiters(&lkb, MsgType::RequestReply, result) {
                    if op == Some(super::waiters::WaitOp::Lookup) {
                        // the directory node was the master and took the
                        // lookup as the request
                        ri.master = NodeRef::from_nodeid(from, self.our_nodeid);
                        lkb.state().nodeid = ri.master;
                    }
                    self.request_reply_body(&r, &mut ri, &lkb, lock, result, lvb, deferred);
                }
            }
        }
        self.release_message_lock(&lkb, &r);
    }

    #[allow(clippy::too_many_arguments)]
    fn request_reply_body(
        &self,
        r: &Rsb,
        ri: &mut RsbInner,
        lkb: &Arc<Lkb>,
        lock: &LockFields,
        result: Status,
        lvb: Option<&[u8]>,
        deferred: super::waiters::Overlap,
    ) {
        match result {
            Status::Again => {
                self.queue_cast(lkb, Status::Again);
                self.confirm_master(r, ri, Status::Again);
                // the creation reference
                self.unhold_lkb(lkb);
            }
            Status::Ok | Status::InProgress => {
                {
                    let mut st = lkb.state();
                    st.sbflags = lock.sbflags;
                    st.flags.merge_shared(lock.flags);
                    st.remid = lock.lkid;
                    if st.is_altmode() {
                        Self::munge_altmode(&mut st);
                    }
                }
                if result == Status::InProgress {
                    self.add_lkb(ri, lkb, LkbStatus::Waiting);
                    self.add_timeout(lkb);
                } else {
                    self.grant_lock_pc(ri, lkb, lvb, lock.lvbseq);
                    if !deferred.unlock {
                        self.queue_cast(lkb, Status::Ok);
                    }
                }
                self.confirm_master(r, ri, result);

                if deferred.unlock {
                    debug!(lkid = lkb.id, %result, "sending deferred unlock");
                    lkb.state().exflags.insert(LockFlags::FORCEUNLOCK);
                    if self.send_unlock(r, ri, lkb) != Status::Ok && result == Status::Ok {
                        self.queue_cast(lkb, Status::Ok);
                    }
                } else if deferred.cancel && result == Status::InProgress {
                    debug!(lkid = lkb.id, "sending deferred cancel");
                    lkb.state().exflags.insert(LockFlags::CANCEL);
                    self.send_cancel(r, ri, lkb);
                }
            }
            Status::BadResource | Status::NotMasterHere => {
                debug!(lkid = lkb.id, name = %r.name_lossy(), %result, "master rejected request");
                ri.master = NodeRef::Unknown;
                lkb.state().nodeid = NodeRef::Unknown;
                if !deferred.is_empty() {
                    self.queue_cast_overlap(lkb, deferred);
                    self.confirm_master(r, ri, result);
                    // the creation reference
                    self.unhold_lkb(lkb);
                } else {
                    self.request_async(r, ri, lkb);
                }
            }
            other => {
                error!(lkid = lkb.id, result = %other, "request failed on master");
                self.queue_cast(lkb, other);
                self.confirm_master(r, ri, Status::Again);
                self.unhold_lkb(lkb);
            }
        }
    }

    fn receive_convert_reply(&self, from: NodeId, lock: &LockFields, result: Status, lvb: Option<&[u8]>) {
        let Some((lkb, r)) = self.message_lock(lock.remid) else {
            warn!(remid = lock.remid, from, %result, "convert reply for unknown lock");
            return;
        };
        {
            let mut ri = r.lock();
            let valid = self.validate_message(lkb.id, &lkb.state(), MsgType::ConvertReply, Origin::Peer(from));
            if valid && self.remove_from_waiters(&lkb, MsgType::ConvertReply, result).is_ok() {
                self.apply_convert_reply(&mut ri, &lkb, Origin::Peer(from), Some(lock), result, lvb);
            }
        }
        self.release_message_lock(&lkb, &r);
    }

    /// Act on a conversion result from the master (or a stub for it).
    pub(crate) fn apply_convert_reply(
        &self,
        ri: &mut RsbInner,
        lkb: &Arc<Lkb>,
        origin: Origin,
        lock: Option<&LockFields>,
        result: Status,
        lvb: Option<&[u8]>,
    ) {
        let quiet = unlock_outstanding(&lkb.state());
        let cast = |status| {
            if !quiet {
                self.queue_cast(lkb, status);
            }
        };
        match result {
            Status::Ok => {
                let lvbseq = {
                    let mut st = lkb.state();
                    receive_flags_reply(&mut st, lock, origin);
                    if st.is_demoted() {
                        st.grmode = LockMode::Nl;
                    }
                    if st.is_altmode() {
                        Self::munge_altmode(&mut st);
                    }
                    lock.map_or(st.lvbseq, |l| l.lvbseq)
                };
                self.grant_lock_pc(ri, lkb, lvb, lvbseq);
                cast(Status::Ok);
            }
            Status::InProgress => {
                {
                    let mut st = lkb.state();
                    receive_flags_reply(&mut st, lock, origin);
                    if st.is_demoted() {
                        st.grmode = LockMode::Nl;
                    }
                }
                self.move_lkb(ri, lkb, LkbStatus::Convert);
                self.add_timeout(lkb);
            }
            Status::Deadlock => {
                receive_flags_reply(&mut lkb.state(), lock, origin);
                self.revert_lock(ri, lkb);
                cast(Status::Deadlock);
            }
            other => {
                debug!(lkid = lkb.id, result = %other, "conversion refused");
                self.revert_lock(ri, lkb);
                cast(other);
            }
        }
    }

    fn receive_unlock_reply(&self, from: NodeId, lock: &LockFields, result: Status) {
        let Some((lkb, r)) = self.message_lock(lock.remid) else {
            warn!(remid = lock.remid, from, %result, "unlock reply for unknown lock");
            return;
        };
        {
            let mut ri = r.lock();
            let valid = self.validate_message(lkb.id, &lkb.state(), MsgType::UnlockReply, Origin::Peer(from));
            if valid && self.remove_from_waiters(&lkb, MsgType::UnlockReply, result).is_ok() {
                self.apply_unlock_reply(&mut ri, &lkb, Origin::Peer(from), Some(lock), result);
            }
        }
        self.release_message_lock(&lkb, &r);
    }

    /// Act on an unlock result. `NotFound` means the master has no copy
    /// left; the lock is finished here as well.
    pub(crate) fn apply_unlock_reply(
        &self,
        ri: &mut RsbInner,
        lkb: &Arc<Lkb>,
        origin: Origin,
        lock: Option<&LockFields>,
        result: Status,
    ) {
        match result {
            Status::Unlocked | Status::NotFound => {
                let queued = {
                    let mut st = lkb.state();
                    receive_flags_reply(&mut st, lock, origin);
                    st.status != LkbStatus::None
                };
                // an unqueued lock already gave up its creation reference
                if queued {
                    self.remove_lock_pc(ri, lkb);
                }
                self.queue_cast(lkb, Status::Unlocked);
            }
            other => {
                error!(lkid = lkb.id, result = %other, "unlock failed on master");
                self.queue_cast(lkb, other);
            }
        }
    }

    fn receive_cancel_reply(&self, from: NodeId, lock: &LockFields, result: Status) {
        let Some((lkb, r)) = self.message_lock(lock.remid) else {
            warn!(remid = lock.remid, from, %result, "cancel reply for unknown lock");
            return;
        };
        {
            let mut ri = r.lock();
            let valid = self.validate_message(lkb.id, &lkb.state(), MsgType::CancelReply, Origin::Peer(from));
            if valid && self.remove_from_waiters(&lkb, MsgType::CancelReply, result).is_ok() {
                self.apply_cancel_reply(&mut ri, &lkb, Origin::Peer(from), Some(lock), result);
            }
        }
        self.release_message_lock(&lkb, &r);
    }

    /// Act on a cancel result. A stub `Ok` for a never-granted lock means
    /// the request died with its master; it is cancelled here.
    pub(crate) fn apply_cancel_reply(
        &self,
        ri: &mut RsbInner,
        lkb: &Arc<Lkb>,
        origin: Origin,
        lock: Option<&LockFields>,
        result: Status,
    ) {
        let (quiet, never_granted) = {
            let mut st = lkb.state();
            receive_flags_reply(&mut st, lock, origin);
            (
                unlock_outstanding(&st),
                st.grmode == LockMode::Iv && st.status == LkbStatus::Waiting,
            )
        };
        let cancelled = match result {
            Status::Cancelled => true,
            Status::Ok => origin == Origin::Stub && never_granted,
            other => {
                error!(lkid = lkb.id, result = %other, "cancel failed on master");
                false
            }
        };
        if cancelled {
            self.revert_lock(ri, lkb);
            if !quiet {
                self.queue_cast(lkb, Status::Cancelled);
            }
        }
    }

    fn receive_grant(&self, from: NodeId, lock: &LockFields, lvb: Option<&[u8]>) {
        let Some((lkb, r)) = self.message_lock(lock.remid) else {
            warn!(remid = lock.remid, from, "grant for unknown lock");
            return;
        };
        {
            let mut ri = r.lock();
            let quiet = {
                let mut st = lkb.state();
                if self.validate_message(lkb.id, &st, MsgType::Grant, Origin::Peer(from)) {
                    receive_flags_reply(&mut st, Some(lock), Origin::Peer(from));
                    if st.is_altmode() {
                        Self::munge_altmode(&mut st);
                    }
                    Some(unlock_outstanding(&st))
                } else {
                    None
                }
            };
            if let Some(quiet) = quiet {
                self.grant_lock_pc(&mut ri, &lkb, lvb, lock.lvbseq);
                if !quiet {
                    self.queue_cast(&lkb, Status::Ok);
                }
            }
        }
        self.release_message_lock(&lkb, &r);
    }

    fn receive_bast(&self, from: NodeId, lock: &LockFields, mode: LockMode) {
        let Some((lkb, r)) = self.message_lock(lock.remid) else {
            warn!(remid = lock.remid, from, "blocking notification for unknown lock");
            return;
        };
        {
            let _ri = r.lock();
            let valid = self.validate_message(lkb.id, &lkb.state(), MsgType::Bast, Origin::Peer(from));
            if valid {
                self.queue_bast(&r, &lkb, mode);
                lkb.state().highbast = mode;
            }
        }
        self.release_message_lock(&lkb, &r);
    }

    fn receive_lookup_reply(&self, from: NodeId, lkid: u32, master: NodeId, result: Status) {
        let Some((lkb, r)) = self.message_lock(lkid) else {
            warn!(lkid, from, "lookup reply for unknown lock");
            return;
        };
        {
            let mut ri = r.lock();
            if let Ok(overlap) = self.remove_from_waiters(&lkb, MsgType::LookupReply, result) {
                self.lookup_reply_body(&r, &mut ri, &lkb, master, result, overlap);
            }
        }
        self.release_message_lock(&lkb, &r);
    }

    fn lookup_reply_body(
        &self,
        r: &Rsb,
        ri: &mut RsbInner,
        lkb: &Arc<Lkb>,
        master: NodeId,
        result: Status,
        overlap: super::waiters::Overlap,
    ) {
        if result != Status::Ok || master == 0 {
            warn!(lkid = lkb.id, name = %r.name_lossy(), %result, "master lookup failed");
            if overlap.is_empty() {
                self.queue_cast(lkb, Status::Again);
            } else {
                self.queue_cast_overlap(lkb, overlap);
            }
            // the creation reference
            self.unhold_lkb(lkb);
            self.confirm_master(r, ri, Status::Again);
            return;
        }

        let master = NodeRef::from_nodeid(master, self.our_nodeid);
        debug!(lkid = lkb.id, name = %r.name_lossy(), ?master, "master found");
        ri.master = master;
        if master.is_local() {
            ri.first_lkid = 0;
        }

        if !overlap.is_empty() {
            self.queue_cast_overlap(lkb, overlap);
            self.unhold_lkb(lkb);
            if !master.is_local() {
                self.confirm_master(r, ri, Status::Again);
            }
        } else {
            self.request_async(r, ri, lkb);
        }
        if master.is_local() {
            self.process_lookup_list(r, ri);
        }
    }
}
