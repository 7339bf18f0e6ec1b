//! Hash table of resources with a per-bucket toss list.
//!
//! A resource whose last reference is dropped moves to its bucket's toss
//! list, where it keeps its cached master (and, when mastered here, its LVB)
//! until the scanner frees it or a new lookup revives it. Bucket locks are
//! never held while a referenced resource's mutex is taken; a tossed resource
//! has no references, so its mutex is free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::error;

use crate::cluster::NodeRef;
use crate::flags::RsbFlags;

use super::rsb::Rsb;

#[derive(Default)]
struct RsbBucket {
    keep: HashMap<Box<[u8]>, Arc<Rsb>>,
    toss: HashMap<Box<[u8]>, (Arc<Rsb>, Instant)>,
}

/// Outcome of a table search.
pub(crate) enum Found {
    /// Referenced resource
    Rsb(Arc<Rsb>),
    /// Not present and creation was not requested
    Missing,
}

pub(crate) struct RsbTable {
    buckets: Vec<Mutex<RsbBucket>>,
}

impl RsbTable {
    pub(crate) fn new(size: u32) -> Self {
        let size = size.max(1) as usize;
        Self {
            buckets: (0..size).map(|_| Mutex::new(RsbBucket::default())).collect(),
        }
    }

    #[inline]
    pub(crate) fn bucket_of(&self, hash: u32) -> usize {
        hash as usize % self.buckets.len()
    }

    /// Find `name` and take a reference, reviving it from the toss list if
    /// needed. With `create`, a missing resource is created with `master`.
    ///
    /// `directory` tells whether masters are cached from the directory (and
    /// a revived remote master has to be confirmed).
    pub(crate) fn find(
        &self,
        name: &[u8],
        hash: u32,
        create: Option<NodeRef>,
        directory: bool,
    ) -> Found {
        let b = self.bucket_of(hash);
        if let Some(r) = Self::search(&mut self.buckets[b].lock(), name, directory) {
            return Found::Rsb(r);
        }
        let Some(master) = create else {
            return Found::Missing;
        };

        let fresh = Arc::new(Rsb::new(name, hash, b, master));
        let mut bucket = self.buckets[b].lock();
        // someone may have created it while the bucket was unlocked
        if let Some(r) = Self::search(&mut bucket, name, directory) {
            return Found::Rsb(r);
        }
        bucket.keep.insert(name.into(), Arc::clone(&fresh));
        Found::Rsb(fresh)
    }

    fn search(bucket: &mut RsbBucket, name: &[u8], directory: bool) -> Option<Arc<Rsb>> {
        if let Some(r) = bucket.keep.get(name) {
            r.hold();
            return Some(Arc::clone(r));
        }
        let (r, _) = bucket.toss.remove(name)?;
        r.revive();
        if directory {
            let mut ri = r.lock();
            match ri.master {
                NodeRef::Unknown => {
                    ri.flags.remove(RsbFlags::MASTER_UNCERTAIN);
                    ri.first_lkid = 0;
                }
                NodeRef::Remote(_) => {
                    ri.flags.insert(RsbFlags::MASTER_UNCERTAIN);
                    ri.first_lkid = 0;
                }
                NodeRef::Local => {}
            }
        }
        bucket.keep.insert(r.name.clone(), Arc::clone(&r));
        Some(r)
    }

    /// Drop a reference. The last one moves the resource to the toss list.
    pub(crate) fn put(&self, r: &Arc<Rsb>) {
        let mut bucket = self.buckets[r.bucket].lock();
        if r.release() {
            if bucket.keep.remove(&r.name).is_none() {
                error!(name = %r.name_lossy(), "released resource not in table");
                return;
            }
            bucket
                .toss
                .insert(r.name.clone(), (Arc::clone(r), Instant::now()));
        }
    }

    /// Remove toss entries older than `period`, oldest first, bucket by
    /// bucket until `keep_going` says stop.
    pub(crate) fn shrink(
        &self,
        period: Duration,
        mut keep_going: impl FnMut() -> bool,
    ) -> Vec<Arc<Rsb>> {
        let now = Instant::now();
        let mut freed = Vec::new();
        for bucket in &self.buckets {
            if !keep_going() {
                break;
            }
            let mut bucket = bucket.lock();
            let mut expired: Vec<(Instant, Box<[u8]>)> = bucket
                .toss
                .iter()
                .filter(|(_, (_, since))| now.duration_since(*since) >= period)
                .map(|(name, (_, since))| (*since, name.clone()))
                .collect();
            expired.sort_by_key(|(since, _)| *since);
            for (_, name) in expired {
                if let Some((r, _)) = bucket.toss.remove(&name) {
                    if r.refs() != 0 {
                        error!(name = %r.name_lossy(), refs = r.refs(), "tossed resource in use");
                        continue;
                    }
                    freed.push(r);
                }
            }
        }
        freed
    }

    /// Drop toss entries for which `stale` holds; used by recovery.
    pub(crate) fn purge_toss(&self, mut stale: impl FnMut(&Rsb) -> bool) -> usize {
        let mut dropped = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            let before = bucket.toss.len();
            bucket.toss.retain(|_, (r, _)| !stale(r));
            dropped += before - bucket.toss.len();
        }
        dropped
    }

    /// Every live resource, each with a reference taken for the caller
    pub(crate) fn snapshot(&self) -> Vec<Arc<Rsb>> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            for r in bucket.keep.values() {
                r.hold();
                out.push(Arc::clone(r));
            }
        }
        out
    }

    /// Number of live resources
    pub(crate) fn live(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().keep.len()).sum()
    }

    /// Number of tossed resources
    pub(crate) fn tossed(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().toss.len()).sum()
    }

    /// Resource `name` without taking a reference or reviving it, and
    /// whether it is tossed. For inspection only.
    pub(crate) fn peek(&self, name: &[u8], hash: u32) -> Option<(Arc<Rsb>, bool)> {
        let bucket = self.buckets[self.bucket_of(hash)].lock();
        if let Some(r) = bucket.keep.get(name) {
            return Some((Arc::clone(r), false));
        }
        bucket.toss.get(name).map(|(r, _)| (Arc::clone(r), true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockspace::rsb::name_hash;

    fn find(table: &RsbTable, name: &[u8]) -> Arc<Rsb> {
        match table.find(name, name_hash(name), Some(NodeRef::Unknown), true) {
            Found::Rsb(r) => r,
            Found::Missing => panic!("create failed"),
        }
    }

    #[test]
    fn test_find_creates_once() {
        let table = RsbTable::new(8);
        let a = find(&table, b"alpha");
        let b = find(&table, b"alpha");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refs(), 2);
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn test_missing_without_create() {
        let table = RsbTable::new(8);
        let name = b"nothing";
        assert!(matches!(
            table.find(name, name_hash(name), None, true),
            Found::Missing
        ));
    }

    #[test]
    fn test_last_put_tosses_and_find_revives() {
        let table = RsbTable::new(4);
        let r = find(&table, b"res");
        r.lock().master = NodeRef::Remote(3);
        table.put(&r);
        assert_eq!(table.tossed(), 1);
        assert!(matches!(table.peek(b"res", r.hash), Some((_, true))));

        let again = find(&table, b"res");
        assert!(Arc::ptr_eq(&r, &again));
        assert_eq!(again.refs(), 1);
        assert!(again.lock().flags.contains(RsbFlags::MASTER_UNCERTAIN));
        assert_eq!(table.tossed(), 0);
    }

    #[test]
    fn test_shrink_respects_period() {
        let table = RsbTable::new(2);
        let r = find(&table, b"old");
        table.put(&r);
        assert!(table.shrink(Duration::from_secs(3600), || true).is_empty());
        let freed = table.shrink(Duration::ZERO, || true);
        assert_eq!(freed.len(), 1);
        assert_eq!(table.tossed(), 0);
    }

    #[test]
    fn test_snapshot_holds() {
        let table = RsbTable::new(2);
        let r = find(&table, b"x");
        let snap = table.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(r.refs(), 2);
        for s in &snap {
            table.put(s);
        }
        assert_eq!(r.refs(), 1);
    }
}
