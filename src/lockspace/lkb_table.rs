//! Lock id table.
//!
//! A lock id is `(bucket << 16) | counter`. The bucket is picked at random;
//! each bucket's 16-bit counter wraps, so a candidate id is checked against
//! the bucket before use. Zero is never handed out.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use super::lkb::Lkb;

#[derive(Default)]
struct LkbBucket {
    counter: u16,
    locks: HashMap<u32, Arc<Lkb>>,
}

pub(crate) struct LkbTable {
    buckets: Vec<RwLock<LkbBucket>>,
}

impl LkbTable {
    pub(crate) fn new(size: u32) -> Self {
        let size = size.clamp(1, u32::from(u16::MAX) + 1) as usize;
        Self {
            buckets: (0..size).map(|_| RwLock::new(LkbBucket::default())).collect(),
        }
    }

    /// Allocate a lock with a fresh id and one reference
    pub(crate) fn create(&self) -> Arc<Lkb> {
        let mut b = rand::thread_rng().gen_range(0..self.buckets.len());
        loop {
            let mut bucket = self.buckets[b].write();
            if bucket.locks.len() < usize::from(u16::MAX) {
                let id = loop {
                    let counter = bucket.counter;
                    bucket.counter = bucket.counter.wrapping_add(1);
                    let id = ((b as u32) << 16) | u32::from(counter);
                    if id != 0 && !bucket.locks.contains_key(&id) {
                        break id;
                    }
                };
                let lkb = Arc::new(Lkb::new(id));
                bucket.locks.insert(id, Arc::clone(&lkb));
                return lkb;
            }
            b = (b + 1) % self.buckets.len();
        }
    }

    /// Look up `id` and take a reference
    pub(crate) fn find(&self, id: u32) -> Option<Arc<Lkb>> {
        let bucket = self.buckets.get((id >> 16) as usize)?.read();
        let lkb = bucket.locks.get(&id)?;
        lkb.hold();
        Some(Arc::clone(lkb))
    }

    /// Drop a reference; true if it was the last and the lock left the table
    pub(crate) fn put(&self, lkb: &Arc<Lkb>) -> bool {
        let Some(bucket) = self.buckets.get((lkb.id >> 16) as usize) else {
            return false;
        };
        let mut bucket = bucket.write();
        if lkb.release() {
            bucket.locks.remove(&lkb.id);
            true
        } else {
            false
        }
    }

    /// Every lock in the table, without taking references
    pub(crate) fn all(&self) -> Vec<Arc<Lkb>> {
        self.buckets
            .iter()
            .flat_map(|b| b.read().locks.values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Number of locks
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().locks.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_nonzero() {
        let table = LkbTable::new(2);
        let mut ids: Vec<u32> = (0..500).map(|_| table.create().id).collect();
        assert!(ids.iter().all(|id| *id != 0 && (id >> 16) < 2));
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 500);
        assert_eq!(table.len(), 500);
    }

    #[test]
    fn test_find_and_put() {
        let table = LkbTable::new(16);
        let lkb = table.create();
        let found = table.find(lkb.id).unwrap();
        assert_eq!(found.refs(), 2);
        assert!(!table.put(&found));
        assert!(table.put(&lkb));
        assert!(table.find(lkb.id).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_find_out_of_range_bucket() {
        let table = LkbTable::new(4);
        assert!(table.find(0x0009_0001).is_none());
    }
}
