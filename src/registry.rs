//! Lockspace registry (spec §4.7): named map of active lockspaces.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::LockspaceConfig;
use crate::error::{DlmError, DlmResult};
use crate::lockspace::Lockspace;
use crate::transport::Transport;

/// Process-wide (per local node) map of active lockspaces, each with
/// independent state (spec §4.7).
#[derive(Default)]
pub struct Registry {
    by_name: RwLock<HashMap<String, Arc<Lockspace>>>,
    by_local_id: RwLock<HashMap<u32, Arc<Lockspace>>>,
    next_local_id: AtomicU32,
}

impl Registry {
    pub fn new() -> Self {
        Self { by_name: RwLock::new(HashMap::new()), by_local_id: RwLock::new(HashMap::new()), next_local_id: AtomicU32::new(1) }
    }

    /// `join(name)`: create and register a lockspace, as if starting
    /// recovery from an empty member set (spec §4.7).
    pub fn join(&self, config: &LockspaceConfig, local_nodeid: u32, transport: Arc<dyn Transport>) -> DlmResult<Arc<Lockspace>> {
        let mut by_name = self.lock_by_name_mut()?;
        if by_name.contains_key(&config.name) {
            return Err(DlmError::Invariant(format!("lockspace '{}' already joined", config.name)));
        }
        let local_id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        let ls = Arc::new(Lockspace::new(config, local_id, local_nodeid, transport)?);
        by_name.insert(config.name.clone(), ls.clone());
        self.by_local_id.write().map_err(|_| DlmError::Invariant("lockspace registry poisoned".into()))?.insert(local_id, ls.clone());
        Ok(ls)
    }

    /// `leave(name)`: requires no local LKBs outstanding (spec §4.7).
    pub fn leave(&self, name: &str) -> DlmResult<()> {
        let mut by_name = self.lock_by_name_mut()?;
        let ls = by_name.get(name).ok_or(DlmError::NoEnt)?.clone();
        if !ls.has_no_local_locks() {
            return Err(DlmError::Inval);
        }
        by_name.remove(name);
        self.by_local_id.write().map_err(|_| DlmError::Invariant("lockspace registry poisoned".into()))?.remove(&ls.local_id);
        Ok(())
    }

    /// O(k) lookup by name (k = number of joined lockspaces), per spec §4.7.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Lockspace>> {
        self.by_name.read().ok().and_then(|m| m.get(name).cloned())
    }

    /// O(1) lookup by local numeric id, per spec §4.7.
    pub fn find_by_local_id(&self, local_id: u32) -> Option<Arc<Lockspace>> {
        self.by_local_id.read().ok().and_then(|m| m.get(&local_id).cloned())
    }

    pub fn names(&self) -> Vec<String> {
        self.by_name.read().map(|m| m.keys().cloned().collect()).unwrap_or_default()
    }

    fn lock_by_name_mut(&self) -> DlmResult<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Lockspace>>>> {
        self.by_name.write().map_err(|_| DlmError::Invariant("lockspace registry poisoned".into()))
    }
}
