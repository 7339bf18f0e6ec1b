//! Caller entry points: lock, convert, unlock, cancel, purge.

use std::sync::Arc;

use tracing::{debug, info};

use crate::ast::{BlockingFn, CompletionFn, Lksb};
use crate::cluster::NodeId;
use crate::flags::{LkbFlags, LockFlags};
use crate::mode::LockMode;
use crate::status::Status;

use super::lkb::{Lkb, LkbState, LkbStatus, LockOwner};
use super::rsb::{Rsb, RsbInner};
use super::waiters::WaitOp;
use super::Lockspace;

/// Arguments of a lock request or conversion.
///
/// # Example
///
/// ```
/// use oxidlm::{Lksb, LockFlags, LockMode, LockRequest};
///
/// let lksb = Lksb::with_lvb(32);
/// let req = LockRequest::new(b"inode-7", LockMode::Pr, lksb)
///     .with_flags(LockFlags::VALBLK | LockFlags::NOQUEUE)
///     .with_completion(|lksb| println!("lock {:x}: {}", lksb.lock_id(), lksb.status()));
/// # let _ = req;
/// ```
#[derive(Clone)]
pub struct LockRequest {
    name: Vec<u8>,
    mode: LockMode,
    flags: LockFlags,
    lksb: Arc<Lksb>,
    on_complete: Option<CompletionFn>,
    on_blocking: Option<BlockingFn>,
    parent_id: u32,
    timeout_cs: u64,
    pid: u32,
}

impl LockRequest {
    /// New lock on resource `name` at `mode`
    pub fn new(name: impl Into<Vec<u8>>, mode: LockMode, lksb: Arc<Lksb>) -> Self {
        Self {
            name: name.into(),
            mode,
            flags: LockFlags::empty(),
            lksb,
            on_complete: None,
            on_blocking: None,
            parent_id: 0,
            timeout_cs: 0,
            pid: std::process::id(),
        }
    }

    /// Conversion of the lock whose id is in `lksb` to `mode`
    pub fn convert(lksb: Arc<Lksb>, mode: LockMode) -> Self {
        let mut req = Self::new(Vec::new(), mode, lksb);
        req.flags = LockFlags::CONVERT;
        req
    }

    /// Add request flags
    pub fn with_flags(mut self, flags: LockFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Completion callback (required)
    pub fn with_completion(mut self, f: impl Fn(&Lksb) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    /// Blocking callback
    pub fn with_blocking(mut self, f: impl Fn(LockMode) + Send + Sync + 'static) -> Self {
        self.on_blocking = Some(Arc::new(f));
        self
    }

    /// Cancel the request if still queued after `timeout_cs` centiseconds
    pub fn with_timeout(mut self, timeout_cs: u64) -> Self {
        self.timeout_cs = timeout_cs;
        self.flags |= LockFlags::TIMEOUT;
        self
    }

    /// Parent lock id; hierarchical locks are not supported, so anything but
    /// zero is rejected
    pub fn with_parent(mut self, parent_id: u32) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Owning process id (defaults to the current process)
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Requested mode
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Request flags
    pub fn flags(&self) -> LockFlags {
        self.flags
    }

    /// Status block
    pub fn lksb(&self) -> &Arc<Lksb> {
        &self.lksb
    }

    fn is_convert(&self) -> bool {
        self.flags.contains(LockFlags::CONVERT)
    }

    /// Check the argument combination on its own, before any lock is found.
    fn check(&self, max_name_len: usize) -> Result<(), Status> {
        let flags = self.flags;
        let conflicting = [
            flags.intersects(LockFlags::CANCEL | LockFlags::FORCEUNLOCK),
            self.mode == LockMode::Iv,
            !self.is_convert() && flags.intersects(LockFlags::QUECVT | LockFlags::CONVDEADLK),
            flags.contains(LockFlags::CONVDEADLK) && flags.contains(LockFlags::NOQUEUE),
            flags.contains(LockFlags::EXPEDITE)
                && (flags.intersects(LockFlags::CONVERT | LockFlags::QUECVT | LockFlags::NOQUEUE)
                    || self.mode != LockMode::Nl),
            self.on_complete.is_none(),
            flags.contains(LockFlags::VALBLK) && !self.lksb.has_lvb(),
            self.is_convert() && self.lksb.lock_id() == 0,
            !self.is_convert() && (self.name.is_empty() || self.name.len() > max_name_len),
            self.parent_id != 0,
        ];
        if conflicting.iter().any(|&bad| bad) {
            return Err(Status::Invalid);
        }
        Ok(())
    }
}

impl std::fmt::Debug for LockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRequest")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("mode", &self.mode)
            .field("flags", &self.flags)
            .field("timeout_cs", &self.timeout_cs)
            .field("pid", &self.pid)
            .finish()
    }
}

impl Lockspace {
    /// Submit a new lock request or a conversion.
    ///
    /// Returns `InProgress` when the operation was accepted; its result
    /// arrives through the completion callback, even when the lock was
    /// granted immediately. `Again` and `Deadlock` report a refused
    /// operation (a completion with the same status is queued as well).
    /// `Invalid`, `Busy`, `NotFound` and `Aborted` come without completion.
    pub fn lock(&self, req: LockRequest) -> Status {
        if self.is_aborted() {
            return Status::Aborted;
        }
        let _barrier = self.barrier.read();
        if let Err(status) = req.check(self.config.max_name_len) {
            debug!(lockspace = %self.name, ?req, "invalid lock arguments");
            return status;
        }

        let convert = req.is_convert();
        let (lkb, rv) = if convert {
            let Some(lkb) = self.lkbs.find(req.lksb.lock_id()) else {
                return Status::NotFound;
            };
            self.stats.record_convert();
            let rv = self.convert_lock(&lkb, &req);
            (lkb, rv)
        } else {
            let lkb = self.lkbs.create();
            self.stats.record_request();
            let rv = self.request_lock(&lkb, &req);
            (lkb, rv)
        };

        // A failed new request drops its creation reference.
        if convert || rv.is_failure() {
            self.put_lkb(&lkb);
        }
        match rv {
            Status::Ok | Status::InProgress => Status::InProgress,
            other => other,
        }
    }

    fn request_lock(&self, lkb: &Arc<Lkb>, req: &LockRequest) -> Status {
        if let Err(status) = self.validate_lock_args(&mut lkb.state(), req) {
            return status;
        }
        let r = match self.find_rsb(&req.name) {
            Ok(r) => r,
            Err(status) => return status,
        };
        let rv = {
            let mut ri = r.lock();
            self.attach_lkb(&r, lkb);
            req.lksb.set_lock_id(lkb.id);
            self.start_request(&r, &mut ri, lkb)
        };
        self.rsbs.put(&r);
        rv
    }

    fn convert_lock(&self, lkb: &Arc<Lkb>, req: &LockRequest) -> Status {
        let Some(r) = lkb.resource() else {
            return Status::Invalid;
        };
        r.hold();
        let rv = {
            let mut ri = r.lock();
            let valid = {
                let mut st = lkb.state();
                self.validate_convert_args(&st, req)
                    .and_then(|()| self.validate_lock_args(&mut st, req))
            };
            match valid {
                Ok(()) => self.start_convert(&r, &mut ri, lkb),
                Err(status) => status,
            }
        };
        self.rsbs.put(&r);
        rv
    }

    fn validate_convert_args(&self, st: &LkbState, req: &LockRequest) -> Result<(), Status> {
        if st.is_master_copy() {
            return Err(Status::Invalid);
        }
        if st.flags.contains(LkbFlags::ENDOFLIFE) {
            return Err(Status::NotFound);
        }
        if req.flags.contains(LockFlags::QUECVT) && !st.grmode.quecvt_allowed(req.mode) {
            return Err(Status::Invalid);
        }
        if st.status != LkbStatus::Granted || st.wait.op().is_some() || st.wait.is_overlap() {
            return Err(Status::Busy);
        }
        Ok(())
    }

    fn validate_lock_args(&self, st: &mut LkbState, req: &LockRequest) -> Result<(), Status> {
        let Some(on_complete) = req.on_complete.clone() else {
            return Err(Status::Invalid);
        };
        st.exflags = req.flags;
        st.sbflags = Default::default();
        st.owner = Some(LockOwner {
            lksb: Arc::clone(&req.lksb),
            on_complete,
            on_blocking: req.on_blocking.clone(),
        });
        st.rqmode = req.mode;
        st.ownpid = req.pid;
        st.timeout_cs = req.timeout_cs;
        st.lvb = self.caller_lvb(&req.lksb);
        Ok(())
    }

    /// Copy of the caller's value block, sized to the lockspace LVB length
    fn caller_lvb(&self, lksb: &Lksb) -> Option<Vec<u8>> {
        lksb.lvb().map(|mut lvb| {
            lvb.resize(self.config.lvblen, 0);
            lvb
        })
    }

    /// Release or cancel lock `lkid`.
    ///
    /// `flags` may hold CANCEL, FORCEUNLOCK, VALBLK and IVVALBLK. The
    /// completion is delivered to `lksb` with the lock's callbacks. Returns
    /// `Ok` when the operation was accepted; `Busy` is reported as `Ok` for
    /// CANCEL and FORCEUNLOCK, whose effect is then deferred.
    pub fn unlock(&self, lkid: u32, flags: LockFlags, lksb: &Arc<Lksb>) -> Status {
        if self.is_aborted() {
            return Status::Aborted;
        }
        let _barrier = self.barrier.read();
        if !LockFlags::UNLOCK_MASK.contains(flags)
            || flags.contains(LockFlags::CANCEL | LockFlags::FORCEUNLOCK)
        {
            return Status::Invalid;
        }
        let Some(lkb) = self.lkbs.find(lkid) else {
            return Status::NotFound;
        };
        let rv = self.unlock_lkb(&lkb, flags, Some(lksb));
        self.put_lkb(&lkb);

        match rv {
            Status::Unlocked | Status::Cancelled => Status::Ok,
            Status::Busy if flags.intersects(LockFlags::CANCEL | LockFlags::FORCEUNLOCK) => {
                Status::Ok
            }
            other => other,
        }
    }

    /// Cancel a queued conversion to break a deadlock found outside the
    /// lockspace. The completion reports `Deadlock`.
    pub fn deadlock_cancel(&self, lkid: u32) -> Status {
        if self.is_aborted() {
            return Status::Aborted;
        }
        let _barrier = self.barrier.read();
        let Some(lkb) = self.lkbs.find(lkid) else {
            return Status::NotFound;
        };
        let rv = match lkb.resource() {
            Some(r) => {
                r.hold();
                let rv = {
                    let mut ri = r.lock();
                    match self.validate_unlock_args(&r, &mut ri, &lkb, LockFlags::CANCEL, None) {
                        Ok(()) => {
                            lkb.state().flags.insert(LkbFlags::DEADLOCK_CANCEL);
                            self.start_cancel(&r, &mut ri, &lkb)
                        }
                        Err(status) => status,
                    }
                };
                self.rsbs.put(&r);
                rv
            }
            None => Status::Invalid,
        };
        self.put_lkb(&lkb);
        debug!(lkid, %rv, "deadlock cancel");
        match rv {
            Status::Cancelled | Status::Busy => Status::Ok,
            other => other,
        }
    }

    /// Unlock or cancel `lkb` under its resource mutex
    pub(crate) fn unlock_lkb(&self, lkb: &Arc<Lkb>, flags: LockFlags, lksb: Option<&Arc<Lksb>>) -> Status {
        let Some(r) = lkb.resource() else {
            return Status::Invalid;
        };
        let cancel = flags.contains(LockFlags::CANCEL);
        if cancel {
            self.stats.record_cancel();
        } else {
            self.stats.record_unlock();
        }

        r.hold();
        let rv = {
            let mut ri = r.lock();
            match self.validate_unlock_args(&r, &mut ri, lkb, flags, lksb) {
                Ok(()) if cancel => self.start_cancel(&r, &mut ri, lkb),
                Ok(()) => self.start_unlock(&r, &mut ri, lkb),
                Err(status) => status,
            }
        };
        self.rsbs.put(&r);
        rv
    }

    /// Decide whether an unlock or cancel can be started now and, if so,
    /// record its flags and the caller's status block.
    ///
    /// Unlocks and cancels that arrive while a lookup or request is in
    /// flight are deferred until its reply and reported as `Busy`.
    fn validate_unlock_args(
        &self,
        r: &Rsb,
        ri: &mut RsbInner,
        lkb: &Arc<Lkb>,
        flags: LockFlags,
        lksb: Option<&Arc<Lksb>>,
    ) -> Result<(), Status> {
        {
            let st = lkb.state();
            if st.is_master_copy() {
                return Err(Status::Invalid);
            }
            if st.flags.contains(LkbFlags::ENDOFLIFE) {
                return Err(Status::NotFound);
            }
        }

        let cancel = flags.contains(LockFlags::CANCEL);
        let force = flags.contains(LockFlags::FORCEUNLOCK);

        // parked behind another lock's master lookup
        if ri.on_lookup(lkb) {
            if cancel || force {
                ri.remove_lookup(lkb);
                debug!(lkid = lkb.id, name = %r.name_lossy(), "dropped from lookup queue");
                self.queue_cast(lkb, if cancel { Status::Cancelled } else { Status::Unlocked });
                // the creation reference
                self.unhold_lkb(lkb);
            }
            return Err(Status::Busy);
        }

        if cancel || force {
            self.del_timeout(lkb);
        }

        let mut st = lkb.state();
        if cancel {
            if st.exflags.contains(LockFlags::CANCEL) || st.wait.is_overlap() {
                return Err(Status::Invalid);
            }
            if st.flags.contains(LkbFlags::RESEND) {
                st.wait.defer(false);
                return Err(Status::Busy);
            }
            match st.wait.op() {
                None if st.status == LkbStatus::Granted => return Err(Status::Busy),
                Some(WaitOp::Lookup | WaitOp::Request) => {
                    st.wait.defer(false);
                    return Err(Status::Busy);
                }
                Some(WaitOp::Unlock | WaitOp::Cancel) => return Err(Status::Busy),
                _ => {}
            }
        } else if force {
            if st.exflags.contains(LockFlags::FORCEUNLOCK) || st.wait.is_overlap_unlock() {
                return Err(Status::Invalid);
            }
            if st.flags.contains(LkbFlags::RESEND) {
                st.wait.defer(true);
                return Err(Status::Busy);
            }
            match st.wait.op() {
                Some(WaitOp::Lookup | WaitOp::Request) => {
                    st.wait.defer(true);
                    return Err(Status::Busy);
                }
                Some(WaitOp::Unlock) => return Err(Status::Busy),
                _ => {}
            }
        } else if st.wait.count() > 0 || st.wait.is_overlap() || st.status != LkbStatus::Granted {
            // queued requests and conversions need CANCEL or FORCEUNLOCK
            return Err(Status::Busy);
        }

        // an overlapping op keeps the flags of the one in flight
        st.exflags |= flags;
        st.sbflags = Default::default();
        if let Some(lksb) = lksb {
            if let Some(owner) = st.owner.as_mut() {
                owner.lksb = Arc::clone(lksb);
            }
            if let Some(lvb) = self.caller_lvb(lksb) {
                st.lvb = Some(lvb);
            }
        }
        Ok(())
    }

    /// Force-unlock every lock owned by process `pid` on node `nodeid`.
    ///
    /// For another node a purge request is sent; returns the number of
    /// locks released here.
    pub fn purge(&self, nodeid: NodeId, pid: u32) -> Result<usize, Status> {
        if self.is_aborted() {
            return Err(Status::Aborted);
        }
        if nodeid != 0 && nodeid != self.our_nodeid {
            return match self.send_purge(nodeid, pid) {
                Status::Ok => Ok(0),
                status => Err(status),
            };
        }
        let _barrier = self.barrier.read();
        Ok(self.do_purge(pid))
    }

    pub(crate) fn do_purge(&self, pid: u32) -> usize {
        let mut purged = 0;
        for lkb in self.lkbs.all() {
            let owned = {
                let st = lkb.state();
                !st.is_master_copy() && st.ownpid == pid && !st.flags.contains(LkbFlags::ENDOFLIFE)
            };
            if !owned {
                continue;
            }
            let Some(lkb) = self.lkbs.find(lkb.id) else {
                continue;
            };
            let rv = self.unlock_lkb(&lkb, LockFlags::FORCEUNLOCK, None);
            if matches!(rv, Status::Unlocked | Status::Ok | Status::Busy) {
                purged += 1;
            }
            self.put_lkb(&lkb);
        }
        info!(lockspace = %self.name, pid, purged, "purged process locks");
        purged
    }
}
