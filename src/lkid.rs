//! Lock-ID table (spec §4.1), grounded on
//! `original_source/dlm-kernel/src/lkb.c`'s `init_lockidtbl` /
//! `create_lkb` / `find_lock_by_id` / `release_lkb`.
//!
//! A lock id is `(bucket_counter << 16) | bucket_index`. The bucket is
//! chosen uniformly at random on allocation; the composed id is checked
//! for uniqueness within the bucket before being accepted.

use std::sync::RwLock;

use rand::Rng;

use crate::error::{DlmError, DlmResult};
use crate::lkb::LkId;

struct Bucket {
    ids: Vec<LkId>,
    counter: u16,
}

/// Per-lockspace table of lock-id buckets (spec §4.1).
///
/// `find` takes the read side of the lock and is the hot path; `create`
/// and `release` take the write side, matching the reader/writer
/// discipline spec'd in §4.1 and `lkb.c`'s `ls_lockidtbl_lock`.
pub struct LockIdTable {
    buckets: RwLock<Vec<Bucket>>,
    size: usize,
}

impl LockIdTable {
    /// `entries` must be a power of two (spec §4.1).
    pub fn new(entries: usize) -> DlmResult<Self> {
        if entries == 0 || (entries & (entries - 1)) != 0 {
            return Err(DlmError::Inval);
        }
        let buckets = (0..entries).map(|_| Bucket { ids: Vec::new(), counter: 1 }).collect();
        Ok(Self { buckets: RwLock::new(buckets), size: entries })
    }

    fn bucket_index(&self, id: LkId) -> usize {
        (id & 0xFFFF) as usize
    }

    /// Allocate a fresh, table-unique lock id. Retries on collision; the
    /// per-bucket counter may wrap (spec §4.1).
    pub fn allocate(&self) -> DlmResult<LkId> {
        let mut buckets = self.buckets.write().map_err(|_| DlmError::Invariant("lockidtbl poisoned".into()))?;
        let mask = (self.size - 1) as u32;
        let mut rng = rand::rng();

        loop {
            let bucket_idx = (rng.random::<u32>() & mask) as usize;
            let bucket = &mut buckets[bucket_idx];
            let id = (bucket_idx as u32) | ((bucket.counter as u32) << 16);
            bucket.counter = bucket.counter.wrapping_add(1);
            if !bucket.ids.contains(&id) {
                bucket.ids.push(id);
                return Ok(id);
            }
            // Collision within the bucket: retry with the bumped counter.
        }
    }

    /// Look up whether `id` is present. The hot path; read-locked only.
    pub fn contains(&self, id: LkId) -> bool {
        let Ok(buckets) = self.buckets.read() else { return false };
        let idx = self.bucket_index(id);
        idx < buckets.len() && buckets[idx].ids.contains(&id)
    }

    /// Release a previously allocated id.
    pub fn release(&self, id: LkId) -> DlmResult<()> {
        let mut buckets = self.buckets.write().map_err(|_| DlmError::Invariant("lockidtbl poisoned".into()))?;
        let idx = self.bucket_index(id);
        let bucket = buckets.get_mut(idx).ok_or(DlmError::NoEnt)?;
        let before = bucket.ids.len();
        bucket.ids.retain(|&x| x != id);
        if bucket.ids.len() == before {
            return Err(DlmError::NoEnt);
        }
        Ok(())
    }

    /// Fails if any bucket is non-empty (spec §4.1 `free_table`).
    pub fn free(&self) -> DlmResult<()> {
        let buckets = self.buckets.read().map_err(|_| DlmError::Invariant("lockidtbl poisoned".into()))?;
        if buckets.iter().any(|b| !b.ids.is_empty()) {
            return Err(DlmError::Invariant("lock-id table freed while non-empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(LockIdTable::new(3).is_err());
    }

    #[test]
    fn allocate_then_find_then_release() {
        let table = LockIdTable::new(16).unwrap();
        let id = table.allocate().unwrap();
        assert!(table.contains(id));
        table.release(id).unwrap();
        assert!(!table.contains(id));
    }

    #[test]
    fn bucket_index_is_low_16_bits() {
        let table = LockIdTable::new(16).unwrap();
        let id = table.allocate().unwrap();
        assert_eq!((id & 0xFFFF) as usize, table.bucket_index(id));
        assert!(table.bucket_index(id) < 16);
    }

    #[test]
    fn free_fails_when_non_empty() {
        let table = LockIdTable::new(4).unwrap();
        let _id = table.allocate().unwrap();
        assert!(table.free().is_err());
    }

    #[test]
    fn many_allocations_stay_unique() {
        let table = LockIdTable::new(32).unwrap();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..5000 {
            let id = table.allocate().unwrap();
            assert!(ids.insert(id), "duplicate lock id allocated");
        }
    }
}
