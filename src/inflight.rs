//! Per-lockspace in-flight queue (spec §3 "In-flight record", §4.5).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{DlmError, DlmResult};
use crate::lkb::LkId;

/// What kind of remote operation an in-flight record correlates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Lookup,
    Request,
    Convert,
    Unlock,
    Names,
    Locks,
}

/// Lifecycle state of an in-flight operation (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightState {
    Sent,
    WaitingReply,
    PostProcess,
}

/// One outstanding remote operation, correlating a local [`LkId`] to its
/// destination node (spec §3). At most one per LKB at a time.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub lkid: LkId,
    pub op: OpKind,
    pub dest_nodeid: u32,
    pub state: InFlightState,
    pub retry_epoch: u32,
}

/// Per-lockspace table of in-flight records, keyed by the correlating LKB
/// id (spec §3 invariant: at most one in-flight record per LKB).
#[derive(Default)]
pub struct InFlightQueue {
    inner: RwLock<HashMap<LkId, InFlight>>,
}

impl InFlightQueue {
    pub fn new() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }

    /// Register a new in-flight operation. Fails if one is already
    /// outstanding for `lkid` (spec §3 invariant).
    pub fn start(&self, lkid: LkId, op: OpKind, dest_nodeid: u32) -> DlmResult<()> {
        let mut map = self.lock_mut()?;
        if map.contains_key(&lkid) {
            return Err(DlmError::Invariant(format!("lkid {lkid} already has an in-flight operation")));
        }
        map.insert(lkid, InFlight { lkid, op, dest_nodeid, state: InFlightState::Sent, retry_epoch: 0 });
        Ok(())
    }

    pub fn set_state(&self, lkid: LkId, state: InFlightState) -> DlmResult<()> {
        let mut map = self.lock_mut()?;
        let rec = map.get_mut(&lkid).ok_or(DlmError::NoEnt)?;
        rec.state = state;
        Ok(())
    }

    pub fn bump_retry(&self, lkid: LkId) -> DlmResult<u32> {
        let mut map = self.lock_mut()?;
        let rec = map.get_mut(&lkid).ok_or(DlmError::NoEnt)?;
        rec.retry_epoch += 1;
        Ok(rec.retry_epoch)
    }

    /// Retire (remove) the in-flight record for `lkid`, typically once its
    /// reply has been applied.
    pub fn retire(&self, lkid: LkId) -> DlmResult<InFlight> {
        let mut map = self.lock_mut()?;
        map.remove(&lkid).ok_or(DlmError::NoEnt)
    }

    pub fn get(&self, lkid: LkId) -> Option<InFlight> {
        self.inner.read().ok().and_then(|m| m.get(&lkid).cloned())
    }

    /// All records destined for `nodeid`, e.g. to re-arm after that node
    /// drops out mid-operation (spec §4.6 recovery).
    pub fn for_node(&self, nodeid: u32) -> Vec<InFlight> {
        self.inner.read().map(|m| m.values().filter(|r| r.dest_nodeid == nodeid).cloned().collect()).unwrap_or_default()
    }

    fn lock_mut(&self) -> DlmResult<std::sync::RwLockWriteGuard<'_, HashMap<LkId, InFlight>>> {
        self.inner.write().map_err(|_| DlmError::Invariant("in-flight queue poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_retire() {
        let q = InFlightQueue::new();
        q.start(1, OpKind::Request, 2).unwrap();
        assert!(q.get(1).is_some());
        let rec = q.retire(1).unwrap();
        assert_eq!(rec.dest_nodeid, 2);
        assert!(q.get(1).is_none());
    }

    #[test]
    fn rejects_second_concurrent_operation_for_same_lkid() {
        let q = InFlightQueue::new();
        q.start(1, OpKind::Request, 2).unwrap();
        assert!(q.start(1, OpKind::Convert, 2).is_err());
    }

    #[test]
    fn for_node_filters_by_destination() {
        let q = InFlightQueue::new();
        q.start(1, OpKind::Request, 2).unwrap();
        q.start(2, OpKind::Request, 3).unwrap();
        let for_two = q.for_node(2);
        assert_eq!(for_two.len(), 1);
        assert_eq!(for_two[0].lkid, 1);
    }
}
