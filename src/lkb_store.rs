//! Arena owning all [`Lkb`]s of a lockspace, addressed by [`LkId`] (spec §9
//! "Cyclic references": cross-references are ids, not raw handles).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{DlmError, DlmResult};
use crate::lkb::{LkId, Lkb};

#[derive(Default)]
pub struct LkbStore {
    inner: RwLock<HashMap<LkId, Lkb>>,
}

impl LkbStore {
    pub fn new() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }

    pub fn insert(&self, lkb: Lkb) -> DlmResult<()> {
        let mut map = self.inner.write().map_err(|_| DlmError::Invariant("lkb store poisoned".into()))?;
        map.insert(lkb.id, lkb);
        Ok(())
    }

    /// Removes and returns the LKB. Spec §3: "freeing an LKB with
    /// non-NONE status is a defect" — callers are expected to have
    /// already dequeued it; this only removes from the arena.
    pub fn remove(&self, id: LkId) -> DlmResult<Lkb> {
        let mut map = self.inner.write().map_err(|_| DlmError::Invariant("lkb store poisoned".into()))?;
        map.remove(&id).ok_or(DlmError::NoEnt)
    }

    pub fn with<R>(&self, id: LkId, f: impl FnOnce(&Lkb) -> R) -> DlmResult<R> {
        let map = self.inner.read().map_err(|_| DlmError::Invariant("lkb store poisoned".into()))?;
        let lkb = map.get(&id).ok_or(DlmError::NoEnt)?;
        Ok(f(lkb))
    }

    pub fn with_mut<R>(&self, id: LkId, f: impl FnOnce(&mut Lkb) -> R) -> DlmResult<R> {
        let mut map = self.inner.write().map_err(|_| DlmError::Invariant("lkb store poisoned".into()))?;
        let lkb = map.get_mut(&id).ok_or(DlmError::NoEnt)?;
        Ok(f(lkb))
    }

    pub fn contains(&self, id: LkId) -> bool {
        self.inner.read().map(|m| m.contains_key(&id)).unwrap_or(false)
    }

    pub fn snapshot_ids(&self) -> Vec<LkId> {
        self.inner.read().map(|m| m.keys().copied().collect()).unwrap_or_default()
    }
}
