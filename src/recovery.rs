//! Membership-change recovery (spec §4.6): `stop` -> `start` -> `finish`,
//! directory purge/rebuild, and the names/locks resend passes that let a
//! newly elected master relearn existing grants.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::info;

use crate::error::{DlmError, DlmResult};
use crate::lkb::LkId;
use crate::lkb_store::LkbStore;
use crate::master::Directory;
use crate::membership::NodeId;
use crate::rsb::ResourceDirectory;

/// Lockspace run state (spec §3 "flags `{JOINING, RUNNING, IN_RECOVERY, STOPPING}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Joining,
    Running,
    Stopping,
    InRecovery,
}

/// Per-peer monotonic message ids for the two resend passes (spec §4.6
/// step 5: "exactly-once application despite retransmission").
#[derive(Debug, Clone, Default)]
struct ChannelIds {
    names_send_msgid: u64,
    names_recv_msgid: u64,
    locks_send_msgid: u64,
    locks_recv_msgid: u64,
}

/// Drives one lockspace's recovery epoch: tracks run state, the current
/// member set, and per-peer resend progress.
pub struct RecoveryState {
    local_nodeid: u32,
    run_state: RwLock<RunState>,
    epoch: std::sync::atomic::AtomicU32,
    members: RwLock<Vec<NodeId>>,
    channels: RwLock<HashMap<u32, ChannelIds>>,
}

impl RecoveryState {
    pub fn new(local_nodeid: u32) -> Self {
        Self {
            local_nodeid,
            run_state: RwLock::new(RunState::Joining),
            epoch: std::sync::atomic::AtomicU32::new(0),
            members: RwLock::new(Vec::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn run_state(&self) -> RunState {
        *self.run_state.read().expect("recovery state poisoned")
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.members.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// `stop`: suspend new requests; in-flight replies keep draining
    /// (spec §4.6 "RUNNING -> STOPPING").
    pub fn stop(&self) -> DlmResult<()> {
        *self.run_state.write().map_err(|_| DlmError::Invariant("recovery state poisoned".into()))? = RunState::Stopping;
        info!("lockspace stopping for recovery");
        Ok(())
    }

    /// `start(new_members)`: begin a new recovery epoch. Purges the
    /// directory and clears per-peer resend progress so both passes
    /// restart from zero for this epoch (spec §4.6 step 6 "each recovery
    /// epoch wipes master copies before rebuilding").
    pub fn start(&self, new_members: Vec<NodeId>, directory: &Directory) -> DlmResult<u32> {
        *self.run_state.write().map_err(|_| DlmError::Invariant("recovery state poisoned".into()))? = RunState::InRecovery;
        *self.members.write().map_err(|_| DlmError::Invariant("recovery state poisoned".into()))? = new_members.clone();
        self.channels.write().map_err(|_| DlmError::Invariant("recovery state poisoned".into()))?.clear();
        directory.purge()?;
        let epoch = self.epoch.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        info!(epoch, members = new_members.len(), "recovery epoch started");
        Ok(epoch)
    }

    /// `finish`: only valid once both resend passes are complete for
    /// every current member (spec §4.6 step 6).
    pub fn finish(&self) -> DlmResult<()> {
        if !self.all_passes_complete() {
            return Err(DlmError::Recovering);
        }
        *self.run_state.write().map_err(|_| DlmError::Invariant("recovery state poisoned".into()))? = RunState::Running;
        info!("recovery finished, lockspace running");
        Ok(())
    }

    fn all_passes_complete(&self) -> bool {
        let channels = self.channels.read().map(|c| c.clone()).unwrap_or_default();
        let members = self.members();
        members.iter().filter(|m| m.0 != self.local_nodeid).all(|m| {
            channels
                .get(&m.0)
                .map(|c| c.names_send_msgid > 0 && c.locks_send_msgid > 0 && c.names_recv_msgid == c.names_send_msgid && c.locks_recv_msgid == c.locks_send_msgid)
                .unwrap_or(false)
        })
    }

    /// Record that the names pass was sent to `peer` (spec §4.6 step 3).
    pub fn record_names_sent(&self, peer: u32) -> DlmResult<u64> {
        let mut channels = self.channels.write().map_err(|_| DlmError::Invariant("recovery state poisoned".into()))?;
        let entry = channels.entry(peer).or_default();
        entry.names_send_msgid += 1;
        Ok(entry.names_send_msgid)
    }

    /// Record that `peer` acknowledged the names pass up to `msgid`.
    pub fn record_names_acked(&self, peer: u32, msgid: u64) -> DlmResult<()> {
        let mut channels = self.channels.write().map_err(|_| DlmError::Invariant("recovery state poisoned".into()))?;
        let entry = channels.entry(peer).or_default();
        entry.names_recv_msgid = entry.names_recv_msgid.max(msgid);
        Ok(())
    }

    /// Record that the locks pass was sent to `peer` (spec §4.6 step 4).
    pub fn record_locks_sent(&self, peer: u32) -> DlmResult<u64> {
        let mut channels = self.channels.write().map_err(|_| DlmError::Invariant("recovery state poisoned".into()))?;
        let entry = channels.entry(peer).or_default();
        entry.locks_send_msgid += 1;
        Ok(entry.locks_send_msgid)
    }

    pub fn record_locks_acked(&self, peer: u32, msgid: u64) -> DlmResult<()> {
        let mut channels = self.channels.write().map_err(|_| DlmError::Invariant("recovery state poisoned".into()))?;
        let entry = channels.entry(peer).or_default();
        entry.locks_recv_msgid = entry.locks_recv_msgid.max(msgid);
        Ok(())
    }
}

/// Purge master-copy LKBs owned by a departed node (spec §4.6 step 1).
/// For each purged LKB, if doing so empties all three queues of a
/// remote-mastered resource, the resource is also freed.
pub fn purge_departed_master_copies(resources: &ResourceDirectory, lkbs: &LkbStore, departed: &[u32]) -> DlmResult<Vec<LkId>> {
    let mut purged = Vec::new();
    for rsb_id in resources.snapshot_ids() {
        let affected: Vec<LkId> = resources.with(rsb_id, |rsb| {
            rsb.granted.iter().chain(rsb.convert.iter()).chain(rsb.wait.iter()).copied().collect::<Vec<_>>()
        })?;

        for lkid in affected {
            let is_departed_mstcpy = lkbs.with(lkid, |l| {
                l.internal_flags.contains(crate::lkb::LkbFlags::MSTCPY) && departed.contains(&l.owner_nodeid)
            }).unwrap_or(false);
            if !is_departed_mstcpy {
                continue;
            }
            resources.with_mut(rsb_id, |rsb| {
                rsb.remove_lkb(lkid);
            })?;
            lkbs.remove(lkid)?;
            purged.push(lkid);
        }

        // MSTCPY LKBs live on the node mastering this resource, so only a
        // mastered resource can be emptied by this purge.
        let destroyable = resources.with(rsb_id, |rsb| rsb.is_destroyable() && rsb.is_master())?;
        if destroyable {
            resources.unref(rsb_id)?;
        }
    }
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lkb::{Lkb, LkbFlags, LockFlags};
    use crate::mode::Mode;

    #[test]
    fn start_then_finish_requires_both_passes_acked() {
        let directory = Directory::new();
        let recovery = RecoveryState::new(99);
        recovery.stop().unwrap();
        let epoch = recovery.start(vec![NodeId(1), NodeId(2)], &directory).unwrap();
        assert_eq!(epoch, 1);
        assert_eq!(recovery.run_state(), RunState::InRecovery);
        assert!(recovery.finish().is_err(), "finish before passes complete should refuse");

        for peer in [1u32, 2u32] {
            let names_id = recovery.record_names_sent(peer).unwrap();
            recovery.record_names_acked(peer, names_id).unwrap();
            let locks_id = recovery.record_locks_sent(peer).unwrap();
            recovery.record_locks_acked(peer, locks_id).unwrap();
        }
        recovery.finish().unwrap();
        assert_eq!(recovery.run_state(), RunState::Running);
    }

    #[test]
    fn purge_departed_master_copies_frees_lkb_and_empties_resource() {
        let resources = ResourceDirectory::new(32);
        let lkbs = LkbStore::new();
        let rsb = resources.get_or_create(None, b"R").unwrap();

        let mut lkb = Lkb::new(1, rsb, Mode::Ex, LockFlags::empty());
        lkb.internal_flags = LkbFlags::MSTCPY;
        lkb.owner_nodeid = 9;
        lkb.grmode = Some(Mode::Ex);
        lkbs.insert(lkb).unwrap();
        resources.with_mut(rsb, |r| r.granted.push(1)).unwrap();
        resources.with_mut(rsb, |r| r.master_nodeid = 0).unwrap();

        let purged = purge_departed_master_copies(&resources, &lkbs, &[9]).unwrap();
        assert_eq!(purged, vec![1]);
        assert!(lkbs.with(1, |_| ()).is_err());
    }
}
