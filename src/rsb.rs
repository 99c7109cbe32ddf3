//! Resource (RSB) and the per-lockspace resource directory (spec §3, §4.2).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{DlmError, DlmResult};
use crate::lkb::{LkId, RsbId};
use crate::lvb::Lvb;

/// A lockable entity named by opaque bytes, optionally nested under a
/// parent resource (spec §3).
pub struct Rsb {
    pub id: RsbId,
    pub name: Vec<u8>,
    pub parent: Option<RsbId>,
    pub refcount: u32,
    pub granted: Vec<LkId>,
    pub convert: Vec<LkId>,
    pub wait: Vec<LkId>,
    /// 0 = we are master; nonzero = remote master node id.
    pub master_nodeid: u32,
    pub lvb: Lvb,
    /// First grant on this resource since creation has not yet happened;
    /// used to decide whether the LVB should be treated as fresh (spec §3
    /// "first-unlock flag").
    pub first_unlock: bool,
}

impl Rsb {
    pub fn new(id: RsbId, name: Vec<u8>, parent: Option<RsbId>, lvb_len: usize) -> Self {
        Self {
            id,
            name,
            parent,
            refcount: 1,
            granted: Vec::new(),
            convert: Vec::new(),
            wait: Vec::new(),
            master_nodeid: 0,
            lvb: Lvb::new(lvb_len),
            first_unlock: true,
        }
    }

    pub fn is_master(&self) -> bool {
        self.master_nodeid == 0
    }

    /// All three queues empty and refcount zero: the resource may be
    /// destroyed (spec §3 invariant).
    pub fn is_destroyable(&self) -> bool {
        self.refcount == 0 && self.granted.is_empty() && self.convert.is_empty() && self.wait.is_empty()
    }

    /// Remove `lkid` from whichever of the three queues it is on. Spec §3
    /// invariant: an LKB is on exactly one queue while attached, so this
    /// stops at the first match.
    pub fn remove_lkb(&mut self, lkid: LkId) -> bool {
        if let Some(pos) = self.granted.iter().position(|&x| x == lkid) {
            self.granted.remove(pos);
            return true;
        }
        if let Some(pos) = self.convert.iter().position(|&x| x == lkid) {
            self.convert.remove(pos);
            return true;
        }
        if let Some(pos) = self.wait.iter().position(|&x| x == lkid) {
            self.wait.remove(pos);
            return true;
        }
        false
    }
}

/// Key for the resource directory: a resource is identified by its
/// optional parent plus its opaque name (spec §4.2).
type DirKey = (Option<RsbId>, Vec<u8>);

/// Per-lockspace hash table of resource chains keyed by `(parent, name)`
/// (spec §4.2). Arena-owns all [`Rsb`]s; callers address them by
/// [`RsbId`], never by reference, per spec §9's cyclic-reference note.
pub struct ResourceDirectory {
    arena: RwLock<HashMap<RsbId, Rsb>>,
    index: RwLock<HashMap<DirKey, RsbId>>,
    next_id: std::sync::atomic::AtomicU32,
    lvb_len: usize,
}

impl ResourceDirectory {
    pub fn new(lvb_len: usize) -> Self {
        Self {
            arena: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU32::new(1),
            lvb_len,
        }
    }

    /// Look up an existing resource by `(parent, name)` or create one
    /// with refcount 1. The parent (if any) gains a reference too, so it
    /// cannot be destroyed while children exist (spec §4.2).
    pub fn get_or_create(&self, parent: Option<RsbId>, name: &[u8]) -> DlmResult<RsbId> {
        let key: DirKey = (parent, name.to_vec());
        {
            let index = self.index.read().map_err(|_| DlmError::Invariant("directory poisoned".into()))?;
            if let Some(&id) = index.get(&key) {
                let mut arena = self.arena.write().map_err(|_| DlmError::Invariant("arena poisoned".into()))?;
                if let Some(rsb) = arena.get_mut(&id) {
                    rsb.refcount += 1;
                    return Ok(id);
                }
            }
        }

        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let rsb = Rsb::new(id, name.to_vec(), parent, self.lvb_len);

        let mut index = self.index.write().map_err(|_| DlmError::Invariant("directory poisoned".into()))?;
        let mut arena = self.arena.write().map_err(|_| DlmError::Invariant("arena poisoned".into()))?;
        if let Some(&existing) = index.get(&key) {
            // Lost the race to create; bump the winner's refcount instead.
            if let Some(rsb) = arena.get_mut(&existing) {
                rsb.refcount += 1;
            }
            return Ok(existing);
        }
        if let Some(parent_id) = parent {
            if let Some(parent_rsb) = arena.get_mut(&parent_id) {
                parent_rsb.refcount += 1;
            }
        }
        index.insert(key, id);
        arena.insert(id, rsb);
        Ok(id)
    }

    pub fn with<R>(&self, id: RsbId, f: impl FnOnce(&Rsb) -> R) -> DlmResult<R> {
        let arena = self.arena.read().map_err(|_| DlmError::Invariant("arena poisoned".into()))?;
        let rsb = arena.get(&id).ok_or(DlmError::NoEnt)?;
        Ok(f(rsb))
    }

    pub fn with_mut<R>(&self, id: RsbId, f: impl FnOnce(&mut Rsb) -> R) -> DlmResult<R> {
        let mut arena = self.arena.write().map_err(|_| DlmError::Invariant("arena poisoned".into()))?;
        let rsb = arena.get_mut(&id).ok_or(DlmError::NoEnt)?;
        Ok(f(rsb))
    }

    /// Drop a reference; destroy (and recursively drop the parent's
    /// reference) once the resource is empty and unreferenced.
    pub fn unref(&self, id: RsbId) -> DlmResult<()> {
        let mut arena = self.arena.write().map_err(|_| DlmError::Invariant("arena poisoned".into()))?;
        let mut index = self.index.write().map_err(|_| DlmError::Invariant("directory poisoned".into()))?;
        let mut current = Some(id);
        while let Some(cur) = current {
            let Some(rsb) = arena.get_mut(&cur) else { break };
            rsb.refcount = rsb.refcount.saturating_sub(1);
            if !rsb.is_destroyable() {
                break;
            }
            let parent = rsb.parent;
            let key: DirKey = (rsb.parent, rsb.name.clone());
            arena.remove(&cur);
            index.remove(&key);
            current = parent;
        }
        Ok(())
    }

    /// Diagnostic iteration under a read lock. Tolerates concurrent
    /// mutation by taking a point-in-time id snapshot rather than holding
    /// the lock across the whole walk (spec §4.2).
    pub fn snapshot_ids(&self) -> Vec<RsbId> {
        match self.arena.read() {
            Ok(arena) => arena.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent_by_name() {
        let dir = ResourceDirectory::new(32);
        let a = dir.get_or_create(None, b"R").unwrap();
        let b = dir.get_or_create(None, b"R").unwrap();
        assert_eq!(a, b);
        dir.with(a, |rsb| assert_eq!(rsb.refcount, 2)).unwrap();
    }

    #[test]
    fn distinct_names_get_distinct_ids() {
        let dir = ResourceDirectory::new(32);
        let a = dir.get_or_create(None, b"R1").unwrap();
        let b = dir.get_or_create(None, b"R2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn child_holds_parent_reference() {
        let dir = ResourceDirectory::new(32);
        let parent = dir.get_or_create(None, b"P").unwrap();
        let _child = dir.get_or_create(Some(parent), b"C").unwrap();
        dir.with(parent, |rsb| assert_eq!(rsb.refcount, 2)).unwrap();
        dir.unref(parent).unwrap();
        // Parent still referenced by the child's parent-link.
        dir.with(parent, |rsb| assert_eq!(rsb.refcount, 1)).unwrap();
    }

    #[test]
    fn unref_destroys_when_empty() {
        let dir = ResourceDirectory::new(32);
        let id = dir.get_or_create(None, b"R").unwrap();
        dir.unref(id).unwrap();
        assert!(dir.with(id, |_| ()).is_err());
    }
}
