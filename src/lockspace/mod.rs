//! The per-lockspace locking engine.
//!
//! A [`Lockspace`] owns every resource and lock of one cluster-wide
//! namespace on this node. Callers submit requests through [`Lockspace::lock`]
//! and [`Lockspace::unlock`]; peers' messages arrive through
//! [`Lockspace::receive`]; the membership layer calls
//! [`Lockspace::recover`] after a node leaves.
//!
//! Locks taken, outermost first:
//!
//! ```text
//! recovery barrier (rwlock)
//!   resource mutex
//!     waiters mutex
//!       lock table bucket / resource table bucket
//!         lock state mutex
//!           timeouts mutex
//! ```
//!
//! The waiters mutex nests inside the resource mutex: reply handlers match a
//! reply against the waiters list while they already hold the resource, and
//! recovery collects the waiters list into a snapshot before it takes any
//! resource. Nothing takes a resource mutex while holding the waiters mutex.
//!
//! A resource table bucket is never held while the mutex of a referenced
//! resource is taken, and the last reference to a lock is never dropped
//! while its state mutex is held.

mod grant;
mod lkb;
mod lkb_table;
mod master;
mod queues;
mod receive;
mod recovery;
mod request;
mod rsb;
mod rsb_table;
mod scand;
mod send;
mod timeout;
mod waiters;

pub use lkb::LkbStatus;
pub use recovery::{RecoveryReport, StubReply};
pub use request::LockRequest;
pub use scand::{ScanReport, Scand};
pub use waiters::{Overlap, WaitOp, WaitState};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::ast::AstSink;
use crate::cluster::{Directory, Membership, NodeId, NodeRef, Transport};
use crate::config::{ConfigError, LockspaceConfig};
use crate::flags::RsbFlags;
use crate::mode::LockMode;
use crate::stats::{LockspaceStats, StatsSnapshot};
use crate::status::Status;
use crate::wire::{Frame, Message, WireError};

use lkb::Lkb;
use lkb_table::LkbTable;
use rsb::{name_hash, Rsb};
use rsb_table::{Found, RsbTable};
use timeout::TimeoutEntry;

/// External services a lockspace depends on.
#[derive(Clone)]
pub struct Collaborators {
    /// Resource name to master map
    pub directory: Arc<dyn Directory>,
    /// Frame delivery to peers
    pub transport: Arc<dyn Transport>,
    /// Membership view
    pub membership: Arc<dyn Membership>,
    /// Destination of completions and blocking notifications
    pub asts: Arc<dyn AstSink>,
}

#[derive(Default)]
struct RequestQueue {
    stopped: bool,
    queue: VecDeque<Frame>,
}

/// One lockspace on this node.
pub struct Lockspace {
    name: String,
    id: u32,
    our_nodeid: NodeId,
    config: LockspaceConfig,
    rsbs: RsbTable,
    lkbs: LkbTable,
    waiters: Mutex<Vec<Arc<Lkb>>>,
    timeouts: Mutex<Vec<TimeoutEntry>>,
    barrier: RwLock<()>,
    requestqueue: Mutex<RequestQueue>,
    aborted: AtomicBool,
    stats: LockspaceStats,
    directory: Arc<dyn Directory>,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn Membership>,
    asts: Arc<dyn AstSink>,
}

/// Point-in-time view of one lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Lock id
    pub lkid: u32,
    /// The peer's id for the same lock
    pub remid: u32,
    /// Whether this is a master copy of a remote process's lock
    pub master_copy: bool,
    /// Master (process copies) or owning node (master copies); 0 if unknown
    pub nodeid: NodeId,
    /// Queue the lock is on
    pub status: LkbStatus,
    /// Granted mode
    pub grmode: LockMode,
    /// Requested mode
    pub rqmode: LockMode,
    /// Operations in flight
    pub wait: WaitState,
    /// Resource name
    pub resource: Option<Vec<u8>>,
}

/// Point-in-time view of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Resource name
    pub name: Vec<u8>,
    /// Cached or authoritative master
    pub master: NodeRef,
    /// Granted locks as (lock id, granted mode), strongest first
    pub granted: Vec<(u32, LockMode)>,
    /// Converting locks as (lock id, requested mode)
    pub converting: Vec<(u32, LockMode)>,
    /// Waiting locks as (lock id, requested mode)
    pub waiting: Vec<(u32, LockMode)>,
    /// Resource value block (masters only)
    pub lvb: Option<Vec<u8>>,
    /// Value block sequence
    pub lvbseq: u32,
    /// Whether the value block was invalidated
    pub valnotvalid: bool,
    /// Whether the resource sits on the toss list
    pub tossed: bool,
}

impl Lockspace {
    /// Create a lockspace named `name` with cluster-wide id `id`.
    pub fn new(
        name: impl Into<String>,
        id: u32,
        config: LockspaceConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = name.into();
        let our_nodeid = collaborators.membership.our_nodeid();
        info!(lockspace = %name, id = format_args!("{id:08x}"), nodeid = our_nodeid, "lockspace created");
        Ok(Self {
            rsbs: RsbTable::new(config.rsbtbl_size),
            lkbs: LkbTable::new(config.lkbtbl_size),
            name,
            id,
            our_nodeid,
            config,
            waiters: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
            barrier: RwLock::new(()),
            requestqueue: Mutex::new(RequestQueue::default()),
            aborted: AtomicBool::new(false),
            stats: LockspaceStats::new(),
            directory: collaborators.directory,
            transport: collaborators.transport,
            membership: collaborators.membership,
            asts: collaborators.asts,
        })
    }

    /// Lockspace name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cluster-wide lockspace id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// This node's id
    pub fn our_nodeid(&self) -> NodeId {
        self.our_nodeid
    }

    /// Configuration in effect
    pub fn config(&self) -> &LockspaceConfig {
        &self.config
    }

    /// Whether an internal invariant violation stopped the lockspace
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Counters plus table sizes
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.locks = self.lkbs.len() as u64;
        snapshot.resources = self.rsbs.live() as u64;
        snapshot.tossed = self.rsbs.tossed() as u64;
        snapshot.waiters = self.waiters.lock().len() as u64;
        snapshot
    }

    /// Number of locks in the lock table (process and master copies)
    pub fn lock_count(&self) -> usize {
        self.lkbs.len()
    }

    /// Number of referenced resources
    pub fn resource_count(&self) -> usize {
        self.rsbs.live()
    }

    /// Number of resources on the toss list
    pub fn tossed_count(&self) -> usize {
        self.rsbs.tossed()
    }

    /// Number of locks with an operation in flight
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Snapshot of lock `lkid`
    pub fn lock_info(&self, lkid: u32) -> Option<LockInfo> {
        let lkb = self.lkbs.find(lkid)?;
        let info = {
            let st = lkb.state();
            LockInfo {
                lkid: lkb.id,
                remid: st.remid,
                master_copy: st.is_master_copy(),
                nodeid: st.nodeid.nodeid(self.our_nodeid),
                status: st.status,
                grmode: st.grmode,
                rqmode: st.rqmode,
                wait: st.wait,
                resource: st.resource.as_ref().map(|r| r.name.to_vec()),
            }
        };
        self.put_lkb(&lkb);
        Some(info)
    }

    /// Snapshot of resource `name`, live or tossed. Does not revive it.
    pub fn resource_info(&self, name: &[u8]) -> Option<ResourceInfo> {
        let (r, tossed) = self.rsbs.peek(name, name_hash(name))?;
        let ri = r.lock();
        let modes = |queue: &[Arc<Lkb>], granted: bool| {
            queue
                .iter()
                .map(|lkb| {
                    let st = lkb.state();
                    (lkb.id, if granted { st.grmode } else { st.rqmode })
                })
                .collect::<Vec<_>>()
        };
        Some(ResourceInfo {
            name: name.to_vec(),
            master: ri.master,
            granted: modes(&ri.grant, true),
            converting: modes(&ri.convert, false),
            waiting: modes(&ri.wait, false),
            lvb: ri.lvb.as_ref().map(|lvb| lvb.to_vec()),
            lvbseq: ri.lvbseq,
            valnotvalid: ri.flags.contains(RsbFlags::VALNOTVALID),
            tossed,
        })
    }

    /// Decode and process one inbound frame.
    ///
    /// Frames for another lockspace, from non-members, or arriving after the
    /// lockspace aborted are dropped. While recovery runs, frames are queued
    /// and processed before recovery releases the lockspace.
    pub fn receive(&self, bytes: &[u8]) -> Result<(), WireError> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(lockspace = %self.name, %err, "dropping undecodable frame");
                self.stats.record_dropped();
                return Err(err);
            }
        };
        self.receive_frame(frame);
        Ok(())
    }

    /// Process an already decoded frame
    pub fn receive_frame(&self, frame: Frame) {
        if self.is_aborted() {
            debug!(lockspace = %self.name, "lockspace aborted, dropping frame");
            self.stats.record_dropped();
            return;
        }
        if frame.lockspace != self.id {
            warn!(
                lockspace = %self.name,
                id = format_args!("{:08x}", frame.lockspace),
                "frame for another lockspace"
            );
            self.stats.record_dropped();
            return;
        }
        if !self.membership.is_member(frame.nodeid) {
            warn!(
                lockspace = %self.name,
                nodeid = frame.nodeid,
                msg = ?frame.message.msg_type(),
                "ignoring message from non-member"
            );
            self.stats.record_dropped();
            return;
        }

        let _barrier = self.barrier.read();
        {
            let mut rq = self.requestqueue.lock();
            if rq.stopped {
                rq.queue.push_back(frame);
                return;
            }
        }
        self.dispatch(frame);
    }

    fn locking_stopped(&self) -> bool {
        self.requestqueue.lock().stopped
    }

    // ============ References ============

    /// Drop a lock reference; the last one frees the lock and releases its
    /// resource. Callers must not hold the lock's state mutex.
    pub(crate) fn put_lkb(&self, lkb: &Arc<Lkb>) {
        if self.lkbs.put(lkb) {
            let resource = {
                let mut st = lkb.state();
                st.owner = None;
                st.lvb = None;
                st.resource.take()
            };
            if let Some(r) = resource {
                self.rsbs.put(&r);
            }
        }
    }

    /// Drop a lock reference that must not be the last one
    pub(crate) fn unhold_lkb(&self, lkb: &Arc<Lkb>) {
        if !lkb.unhold() {
            self.abort("dropped the last lock reference without freeing it", lkb.id);
        }
    }

    /// Attach `lkb` to `r`, taking a resource reference for it
    pub(crate) fn attach_lkb(&self, r: &Arc<Rsb>, lkb: &Arc<Lkb>) {
        r.hold();
        lkb.state().resource = Some(Arc::clone(r));
    }

    /// Stop serving after an internal invariant violation
    pub(crate) fn abort(&self, what: &str, lkid: u32) {
        error!(
            lockspace = %self.name,
            lkid = format_args!("{lkid:08x}"),
            "{what}; aborting lockspace"
        );
        self.aborted.store(true, Ordering::Release);
    }

    // ============ Resources and masters ============

    /// Find (or create) the resource for a local request.
    pub(crate) fn find_rsb(&self, name: &[u8]) -> Result<Arc<Rsb>, Status> {
        if name.is_empty() || name.len() > self.config.max_name_len {
            return Err(Status::Invalid);
        }
        let hash = name_hash(name);
        let master = if self.config.no_directory {
            self.hash_master(hash)
        } else {
            NodeRef::Unknown
        };
        match self
            .rsbs
            .find(name, hash, Some(master), !self.config.no_directory)
        {
            Found::Rsb(r) => Ok(r),
            Found::Missing => Err(Status::BadResource),
        }
    }

    /// Find the resource a peer's request names. Only masterless mode
    /// creates it here; otherwise a missing resource is `BadResource`.
    pub(crate) fn find_master_rsb(&self, name: &[u8]) -> Result<Arc<Rsb>, Status> {
        if name.is_empty() || name.len() > self.config.max_name_len {
            return Err(Status::Invalid);
        }
        let hash = name_hash(name);
        let create = (self.config.no_directory && self.hash_master(hash).is_local())
            .then_some(NodeRef::Local);
        match self
            .rsbs
            .find(name, hash, create, !self.config.no_directory)
        {
            Found::Rsb(r) => Ok(r),
            Found::Missing => Err(Status::BadResource),
        }
    }

    /// Node holding the directory entry (masterless mode: the master)
    pub(crate) fn dir_nodeid(&self, hash: u32) -> NodeId {
        self.directory.dir_nodeid(hash)
    }

    pub(crate) fn hash_master(&self, hash: u32) -> NodeRef {
        NodeRef::from_nodeid(self.dir_nodeid(hash), self.our_nodeid)
    }

    /// Remove the directory entry of a resource this node stopped mastering
    pub(crate) fn dir_remove(&self, r: &Rsb) {
        if self.config.no_directory {
            return;
        }
        let to = self.dir_nodeid(r.hash);
        if to == self.our_nodeid {
            self.directory.remove(&r.name, self.our_nodeid);
        } else {
            self.send_remove(to, r);
        }
    }

    /// Hand `message` to the transport. A failed send is reported as `Again`.
    pub(crate) fn send_message(&self, to: NodeId, message: Message) -> Status {
        let msg = message.msg_type();
        let frame = Frame {
            lockspace: self.id,
            nodeid: self.our_nodeid,
            message,
        };
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(lockspace = %self.name, to, ?msg, %err, "cannot encode message");
                return Status::Invalid;
            }
        };
        match self.transport.send(to, bytes) {
            Ok(()) => {
                self.stats.record_send();
                Status::Ok
            }
            Err(err) => {
                warn!(lockspace = %self.name, to, ?msg, %err, "send failed");
                self.stats.record_send_error();
                Status::Again
            }
        }
    }
}

impl fmt::Debug for Lockspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lockspace")
            .field("name", &self.name)
            .field("id", &format_args!("{:08x}", self.id))
            .field("nodeid", &self.our_nodeid)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
