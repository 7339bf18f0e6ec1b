//! Resources.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::cluster::NodeRef;
use crate::flags::RsbFlags;

use super::lkb::{Lkb, LkbStatus};

/// Hash of a resource name. Selects the table bucket and the directory node.
pub(crate) fn name_hash(name: &[u8]) -> u32 {
    let h = xxhash_rust::xxh3::xxh3_64(name);
    (h ^ (h >> 32)) as u32
}

/// A named resource and its lock queues.
pub(crate) struct Rsb {
    pub(crate) name: Box<[u8]>,
    pub(crate) hash: u32,
    pub(crate) bucket: usize,
    refs: AtomicU32,
    inner: Mutex<RsbInner>,
}

/// State guarded by the resource mutex.
#[derive(Default)]
pub(crate) struct RsbInner {
    pub(crate) master: NodeRef,
    /// Lock whose master lookup is outstanding; others park on `lookup`.
    pub(crate) first_lkid: u32,
    pub(crate) flags: RsbFlags,
    pub(crate) lvb: Option<Box<[u8]>>,
    pub(crate) lvbseq: u32,
    pub(crate) grant: Vec<Arc<Lkb>>,
    pub(crate) convert: Vec<Arc<Lkb>>,
    pub(crate) wait: Vec<Arc<Lkb>>,
    pub(crate) lookup: VecDeque<Arc<Lkb>>,
}

impl Rsb {
    pub(crate) fn new(name: &[u8], hash: u32, bucket: usize, master: NodeRef) -> Self {
        Self {
            name: name.into(),
            hash,
            bucket,
            refs: AtomicU32::new(1),
            inner: Mutex::new(RsbInner {
                master,
                ..RsbInner::default()
            }),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, RsbInner> {
        self.inner.lock()
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

    /// Drop a reference that is known not to be the last one.
    ///
    /// Returns false (and leaves the count alone) if it was the last.
    pub(crate) fn unhold(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 1).then(|| n - 1)
            })
            .is_ok()
    }

    /// Drop a reference; true if it was the last. Only the table calls this,
    /// under the bucket lock.
    pub(super) fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Set the count when the resource is revived from the toss list.
    pub(super) fn revive(&self) {
        self.refs.store(1, Ordering::Release);
    }

    pub(crate) fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

impl fmt::Debug for Rsb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rsb")
            .field("name", &self.name_lossy())
            .field("hash", &format_args!("{:08x}", self.hash))
            .field("refs", &self.refs())
            .finish()
    }
}

impl RsbInner {
    /// True once every queue is empty
    pub(crate) fn is_idle(&self) -> bool {
        self.grant.is_empty()
            && self.convert.is_empty()
            && self.wait.is_empty()
            && self.lookup.is_empty()
    }

    pub(crate) fn queue(&self, status: LkbStatus) -> Option<&Vec<Arc<Lkb>>> {
        match status {
            LkbStatus::Granted => Some(&self.grant),
            LkbStatus::Convert => Some(&self.convert),
            LkbStatus::Waiting => Some(&self.wait),
            LkbStatus::None => None,
        }
    }

    pub(crate) fn queue_mut(&mut self, status: LkbStatus) -> Option<&mut Vec<Arc<Lkb>>> {
        match status {
            LkbStatus::Granted => Some(&mut self.grant),
            LkbStatus::Convert => Some(&mut self.convert),
            LkbStatus::Waiting => Some(&mut self.wait),
            LkbStatus::None => None,
        }
    }

    /// Every lock on the three state queues
    pub(crate) fn all_locks(&self) -> Vec<Arc<Lkb>> {
        self.grant
            .iter()
            .chain(self.convert.iter())
            .chain(self.wait.iter())
            .cloned()
            .collect()
    }

    pub(crate) fn remove_lookup(&mut self, lkb: &Arc<Lkb>) -> bool {
        match self.lookup.iter().position(|l| Arc::ptr_eq(l, lkb)) {
            Some(pos) => {
                self.lookup.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn on_lookup(&self, lkb: &Arc<Lkb>) -> bool {
        self.lookup.iter().any(|l| Arc::ptr_eq(l, lkb))
    }
}
