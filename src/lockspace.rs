//! The lockspace: ties the lock-id table, resource directory, LKB arena,
//! in-flight queue, directory/mastering, and recovery state together
//! behind the client lock API (spec §3 "Lockspace", §6 "Client lock API").

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::completion::{Completion, OneshotCompletion, Outcome};
use crate::config::LockspaceConfig;
use crate::dispatch;
use crate::error::{DlmError, DlmResult};
use crate::inflight::{InFlightQueue, OpKind};
use crate::lkb::{LkId, Lkb, LockFlags, RsbId};
use crate::lkb_store::LkbStore;
use crate::lkid::LockIdTable;
use crate::master::Directory;
use crate::membership::{MembershipEvent, NodeId};
use crate::mode::Mode;
use crate::recovery::{purge_departed_master_copies, RecoveryState, RunState};
use crate::rsb::ResourceDirectory;
use crate::state_machine;
use crate::transport::Transport;
use crate::wire::{Frame, Kind};

/// One named, independent domain of resources and locks (spec §3).
pub struct Lockspace {
    pub name: String,
    /// Local numeric id assigned by the registry on join (spec §3).
    pub local_id: u32,
    local_nodeid: u32,
    lockidtbl: LockIdTable,
    resources: ResourceDirectory,
    lkbs: LkbStore,
    inflight: InFlightQueue,
    directory: Directory,
    /// Cached answers to `LOOKUP` queries we are not the directory node
    /// for, so repeated operations against the same resource don't re-pay
    /// the round trip (spec §4.4 "cached lookup"). Entries are wholesale
    /// evicted on every membership `Start`, same as the directory itself.
    master_cache: moka::sync::Cache<Vec<u8>, u32>,
    recovery: RecoveryState,
    transport: Arc<dyn Transport>,
    next_local_id: AtomicU32,
}

impl Lockspace {
    pub fn new(config: &LockspaceConfig, local_id: u32, local_nodeid: u32, transport: Arc<dyn Transport>) -> DlmResult<Self> {
        Ok(Self {
            name: config.name.clone(),
            local_id,
            local_nodeid,
            lockidtbl: LockIdTable::new(config.lockidtbl_buckets)?,
            resources: ResourceDirectory::new(config.lvb_len),
            lkbs: LkbStore::new(),
            inflight: InFlightQueue::new(),
            directory: Directory::new(),
            master_cache: moka::sync::Cache::new(config.rsb_buckets as u64),
            recovery: RecoveryState::new(local_nodeid),
            transport,
            next_local_id: AtomicU32::new(1),
        })
    }

    pub fn run_state(&self) -> RunState {
        self.recovery.run_state()
    }

    fn refuse_if_recovering(&self) -> DlmResult<()> {
        if matches!(self.run_state(), RunState::InRecovery | RunState::Stopping) {
            return Err(DlmError::Recovering);
        }
        Ok(())
    }

    /// Resolve the master for `name`: if we master it (or get elected to),
    /// returns `None` (local); otherwise the remote master's node id (spec
    /// §4.4). When we are not ourselves the directory node, this queries it
    /// with a `LOOKUP`/`LOOKUP_REPLY` round trip; the elected master's node
    /// id rides back in the reply's `remote_lkid` field (unused by `LOOKUP`
    /// otherwise).
    async fn resolve_master(&self, name: &[u8], members: &[NodeId]) -> DlmResult<Option<u32>> {
        if members.is_empty() {
            return Ok(None); // single-node / no membership source configured: always local
        }
        let directory_node = crate::master::directory_node(name, members)?;
        if directory_node.0 == self.local_nodeid {
            let master = self.directory.elect_or_get(name, self.local_nodeid)?;
            return Ok(if master == self.local_nodeid { None } else { Some(master) });
        }
        if let Some(master) = self.master_cache.get(name) {
            return Ok(if master == self.local_nodeid { None } else { Some(master) });
        }
        let lookup = Frame {
            kind: Kind::Lookup,
            flags: 0,
            lockspace: 0,
            sender_nodeid: self.local_nodeid,
            target_nodeid: directory_node.0,
            sender_lkid: 0,
            remote_lkid: 0,
            mode: Mode::Nl,
            rqmode: Mode::Nl,
            status: 0,
            result: crate::wire::WireStatus::Ok,
            range_start: 0,
            range_end: 0,
            name: name.to_vec(),
            lvb: Vec::new(),
        };
        let reply = self.transport.request(directory_node.0, &lookup).await?;
        let master = reply.remote_lkid;
        self.master_cache.insert(name.to_vec(), master);
        Ok(if master == self.local_nodeid { None } else { Some(master) })
    }

    /// Spec §6 `lock(resource_name, parent?, mode, flags, ...) -> lock_id`.
    /// Grants synchronously when locally mastered and immediately
    /// grantable; otherwise the returned `Outcome` arrives via `completion`
    /// once recovery/remote dispatch resolves it.
    #[instrument(skip(self, completion, members), fields(lockspace = %self.name))]
    pub async fn lock(
        &self,
        name: &[u8],
        parent: Option<RsbId>,
        mode: Mode,
        flags: LockFlags,
        range: Option<(u64, u64)>,
        members: &[NodeId],
        completion: Box<dyn Completion>,
    ) -> DlmResult<LkId> {
        self.refuse_if_recovering()?;
        let rsb_id = self.resources.get_or_create(parent, name)?;
        let lkid = self.lockidtbl.allocate()?;

        let mut lkb = Lkb::new(lkid, rsb_id, mode, flags);
        if let Some((start, end)) = range {
            lkb.set_requested_range(start, end);
        }
        lkb.completion = Some(completion);
        self.lkbs.insert(lkb)?;

        match self.resolve_master(name, members).await? {
            None => {
                self.resources.with_mut(rsb_id, |r| r.master_nodeid = 0)?;
                let outcome = state_machine::request_new(&self.resources, &self.lkbs, rsb_id, lkid)?;
                self.fire_if_resolved(lkid, outcome)?;
            }
            Some(master_nodeid) => {
                self.resources.with_mut(rsb_id, |r| r.master_nodeid = master_nodeid)?;
                self.inflight.start(lkid, OpKind::Request, master_nodeid)?;
                let frame = dispatch::build_request_frame(0, self.local_nodeid, master_nodeid, lkid, name, &self.lkbs)?;
                if let Err(err) = self.transport.send(master_nodeid, &frame).await {
                    warn!(lkid, master_nodeid, %err, "request dispatch failed; recovery will re-arm");
                }
            }
        }
        Ok(lkid)
    }

    /// Spec §6 `convert(lock_id, new_mode, flags, lvb?, range?, completion_cb)`.
    /// `lvb` is written into the resource's LVB on a downgrade out of a
    /// writer mode; `range` rewrites the lock's requested byte range for
    /// this conversion.
    pub async fn convert(
        &self,
        lkid: LkId,
        new_mode: Mode,
        flags: LockFlags,
        lvb: Option<&[u8]>,
        range: Option<(u64, u64)>,
        members: &[NodeId],
        completion: Box<dyn Completion>,
    ) -> DlmResult<()> {
        self.refuse_if_recovering()?;
        let rsb_id = self.lkbs.with(lkid, |l| l.resource)?;
        self.lkbs.with_mut(lkid, |l| l.completion = Some(completion))?;

        let name = self.resources.with(rsb_id, |r| r.name.clone())?;
        match self.resolve_master(&name, members).await? {
            None => {
                let outcome = state_machine::request_convert(&self.resources, &self.lkbs, rsb_id, lkid, new_mode, flags, range, lvb)?;
                self.fire_if_resolved(lkid, outcome)?;
            }
            Some(master_nodeid) => {
                let remote_lkid = self.lkbs.with(lkid, |l| l.remote_lkid)?.ok_or_else(|| DlmError::Invariant("convert before master acked request".into()))?;
                self.inflight.start(lkid, OpKind::Convert, master_nodeid)?;
                let frame = dispatch::build_convert_frame(0, self.local_nodeid, master_nodeid, lkid, remote_lkid, new_mode, flags, range, lvb, &self.lkbs)?;
                self.transport.send(master_nodeid, &frame).await?;
            }
        }
        Ok(())
    }

    /// Spec §6 `unlock(lock_id, flags, ...)`.
    pub async fn unlock(&self, lkid: LkId, lvb_write: Option<&[u8]>, members: &[NodeId]) -> DlmResult<()> {
        let rsb_id = self.lkbs.with(lkid, |l| l.resource)?;
        let name = self.resources.with(rsb_id, |r| r.name.clone())?;

        match self.resolve_master(&name, members).await? {
            None => {
                let grants = state_machine::unlock(&self.resources, &self.lkbs, rsb_id, lkid, lvb_write)?;
                self.fire_local_grants(&grants)?;
                self.push_remote_grants(&grants).await?;
                self.lkbs.remove(lkid)?;
                self.lockidtbl.release(lkid)?;
                self.resources.unref(rsb_id)?;
            }
            Some(master_nodeid) => {
                let remote_lkid = self.lkbs.with(lkid, |l| l.remote_lkid)?.unwrap_or(0);
                let frame = dispatch::build_unlock_frame(0, self.local_nodeid, master_nodeid, lkid, remote_lkid, lvb_write);
                self.transport.send(master_nodeid, &frame).await?;
                self.lkbs.remove(lkid)?;
                self.lockidtbl.release(lkid)?;
                self.resources.unref(rsb_id)?;
            }
        }
        Ok(())
    }

    /// Spec §6 `cancel(lock_id)`. Local resources only: a remote cancel
    /// would additionally need a wire `kind`, which §6's message catalogue
    /// does not define, so cancellation of a remotely-mastered pending
    /// lock is resolved by the next recovery pass instead.
    pub fn cancel(&self, lkid: LkId) -> DlmResult<()> {
        let rsb_id = self.lkbs.with(lkid, |l| l.resource)?;
        let (outcome, grants) = state_machine::cancel(&self.resources, &self.lkbs, rsb_id, lkid)?;
        self.fire_local_grants(&grants)?;
        self.fire_if_resolved(lkid, Some(outcome))?;
        self.lkbs.remove(lkid)?;
        self.lockidtbl.release(lkid)?;
        self.resources.unref(rsb_id)?;
        Ok(())
    }

    /// True if no locally-owned LKB remains in this lockspace's arena (spec
    /// §4.7 `leave(name)`: "requires no local LKBs outstanding"). `MSTCPY`
    /// entries held on behalf of remote owners don't count; those belong to
    /// the lockspace's mastering role, not to this node's own client calls.
    pub fn has_no_local_locks(&self) -> bool {
        !self.lkbs.snapshot_ids().into_iter().any(|id| self.lkbs.with(id, |l| l.owner_nodeid == 0).unwrap_or(false))
    }

    /// True if this lockspace holds a granted `MSTCPY` LKB for `name` owned
    /// by `owner` — i.e. it has relearned a peer's lock via the LOCKS
    /// resend pass (or via ordinary remote mastering).
    pub fn has_remote_lock_on(&self, name: &[u8], owner: NodeId) -> bool {
        let Some(rsb_id) = self.resources.snapshot_ids().into_iter().find(|&id| self.resources.with(id, |r| r.name == name).unwrap_or(false)) else {
            return false;
        };
        self.resources.with(rsb_id, |r| r.granted.clone()).unwrap_or_default().into_iter().any(|lkid| {
            self.lkbs.with(lkid, |l| l.internal_flags.contains(crate::lkb::LkbFlags::MSTCPY) && l.owner_nodeid == owner.0).unwrap_or(false)
        })
    }

    /// Dispatch an inbound frame: either a request bound for us as master,
    /// or a reply to one of our outstanding in-flight operations.
    pub fn handle_incoming(&self, frame: Frame) -> DlmResult<Option<Frame>> {
        match frame.kind {
            Kind::Lookup => {
                let master = self.directory.elect_or_get(&frame.name, frame.sender_nodeid)?;
                Ok(Some(Frame {
                    kind: Kind::LookupReply,
                    flags: 0,
                    lockspace: frame.lockspace,
                    sender_nodeid: self.local_nodeid,
                    target_nodeid: frame.sender_nodeid,
                    sender_lkid: 0,
                    remote_lkid: master,
                    mode: Mode::Nl,
                    rqmode: Mode::Nl,
                    status: 0,
                    result: crate::wire::WireStatus::Ok,
                    range_start: 0,
                    range_end: 0,
                    name: frame.name.clone(),
                    lvb: Vec::new(),
                }))
            }
            Kind::Request => {
                let rsb_id = self.resources.get_or_create(None, &frame.name)?;
                self.resources.with_mut(rsb_id, |r| r.master_nodeid = 0)?;
                let local_lkid = self.next_local_id.fetch_add(1, Ordering::Relaxed);
                let reply = dispatch::apply_remote_request(&self.resources, &self.lkbs, rsb_id, local_lkid, &frame)?;
                Ok(Some(reply))
            }
            Kind::Convert => {
                let rsb_id = self.lkbs.with(frame.remote_lkid, |l| l.resource)?;
                let reply = dispatch::apply_remote_convert(&self.resources, &self.lkbs, rsb_id, &frame)?;
                Ok(Some(reply))
            }
            Kind::Unlock => {
                let rsb_id = self.lkbs.with(frame.remote_lkid, |l| l.resource)?;
                let reply = dispatch::apply_remote_unlock(&self.resources, &self.lkbs, rsb_id, &frame)?;
                Ok(Some(reply))
            }
            Kind::RequestReply | Kind::ConvertReply => {
                if let Some(outcome) = dispatch::apply_reply(&self.lkbs, frame.sender_lkid, &frame)? {
                    self.inflight.retire(frame.sender_lkid).ok();
                    self.fire_if_resolved(frame.sender_lkid, Some(outcome))?;
                }
                // `None`: the master only acknowledged queuing; the
                // in-flight record stays armed until a `GRANT` arrives.
                Ok(None)
            }
            Kind::UnlockReply => {
                self.inflight.retire(frame.sender_lkid).ok();
                Ok(None)
            }
            Kind::Grant => {
                self.lkbs.with_mut(frame.sender_lkid, |l| l.grmode = Some(frame.mode))?;
                let lvb = if frame.lvb.is_empty() { None } else { Some(frame.lvb.clone()) };
                self.fire_if_resolved(frame.sender_lkid, Some(Outcome::Granted { lock_id: frame.sender_lkid, mode: frame.mode, lvb }))?;
                Ok(None)
            }
            Kind::Names => {
                // Informational only: the NAMES pass tells us what to
                // expect before LOCKS rebuilds the actual grant state, so
                // it doesn't itself touch the resource directory.
                Ok(Some(dispatch::build_resend_ack(Kind::NamesReply, frame.lockspace, self.local_nodeid, &frame)))
            }
            Kind::Locks => {
                let local_lkid = self.next_local_id.fetch_add(1, Ordering::Relaxed);
                dispatch::apply_incoming_lock_resend(&self.resources, &self.lkbs, local_lkid, &frame)?;
                Ok(Some(dispatch::build_resend_ack(Kind::LocksReply, frame.lockspace, self.local_nodeid, &frame)))
            }
            Kind::NamesReply => {
                self.recovery.record_names_acked(frame.sender_nodeid, frame.range_start)?;
                Ok(None)
            }
            Kind::LocksReply => {
                self.recovery.record_locks_acked(frame.sender_nodeid, frame.range_start)?;
                Ok(None)
            }
            other => Err(DlmError::Invariant(format!("unexpected inbound frame kind {other:?}"))),
        }
    }

    /// Apply a membership event (spec §4.6). `Start` drives the names/locks
    /// resend passes itself (step 3-4) before returning, so `Finish` can
    /// succeed as soon as every peer has acked both.
    #[instrument(skip(self, event), fields(lockspace = %self.name))]
    pub async fn on_membership_event(&self, event: MembershipEvent) -> DlmResult<()> {
        match event {
            MembershipEvent::Stop => self.recovery.stop(),
            MembershipEvent::Start { members } => {
                self.recovery.start(members.clone(), &self.directory)?;
                self.master_cache.invalidate_all();
                // A node is "departed" if we are still holding a master
                // copy on its behalf (`MSTCPY`, owned by it) but it is no
                // longer in the new member set. This needs no prior
                // membership bookkeeping: it falls directly out of state
                // we already have, unlike diffing against a remembered
                // previous member list (which would miss departures on a
                // lockspace's very first `Start`).
                let current: std::collections::HashSet<u32> = members.iter().map(|n| n.0).collect();
                let departed: Vec<u32> = self
                    .lkbs
                    .snapshot_ids()
                    .into_iter()
                    .filter_map(|id| self.lkbs.with(id, |l| (l.internal_flags.contains(crate::lkb::LkbFlags::MSTCPY), l.owner_nodeid)).ok())
                    .filter(|(is_mstcpy, owner)| *is_mstcpy && *owner != 0 && !current.contains(owner))
                    .map(|(_, owner)| owner)
                    .collect::<std::collections::HashSet<u32>>()
                    .into_iter()
                    .collect();
                purge_departed_master_copies(&self.resources, &self.lkbs, &departed)?;
                info!(departed = departed.len(), "membership start: master-copy purge complete");

                self.resend_local_state(&members).await?;
                Ok(())
            }
            MembershipEvent::Finish => self.recovery.finish(),
        }
    }

    /// Names/locks resend passes (spec §4.6 steps 3-4): tell every other
    /// member what resources this node holds locks on (`NAMES`), then the
    /// locks themselves (`LOCKS`), so a newly elected master can rebuild
    /// its grant state without this node having to resubmit each lock.
    async fn resend_local_state(&self, members: &[NodeId]) -> DlmResult<()> {
        let local_locks: Vec<(RsbId, Vec<u8>, LkId, Mode)> = self
            .resources
            .snapshot_ids()
            .into_iter()
            .filter_map(|rsb_id| {
                let name = self.resources.with(rsb_id, |r| r.name.clone()).ok()?;
                let lkids = self
                    .resources
                    .with(rsb_id, |r| r.granted.iter().chain(r.convert.iter()).chain(r.wait.iter()).copied().collect::<Vec<_>>())
                    .ok()?;
                Some(lkids.into_iter().filter_map(move |lkid| {
                    let (owner, mode) = self.lkbs.with(lkid, |l| (l.owner_nodeid, l.grmode.unwrap_or(l.rqmode))).ok()?;
                    (owner == 0).then(|| (rsb_id, name.clone(), lkid, mode))
                }))
            })
            .flatten()
            .collect();

        let mut names: Vec<(RsbId, Vec<u8>)> = local_locks.iter().map(|(rsb_id, name, ..)| (*rsb_id, name.clone())).collect();
        names.sort_by_key(|(rsb_id, _)| *rsb_id);
        names.dedup_by_key(|(rsb_id, _)| *rsb_id);

        for peer in members.iter().filter(|m| m.0 != self.local_nodeid) {
            if names.is_empty() {
                let msgid = self.recovery.record_names_sent(peer.0)?;
                self.recovery.record_names_acked(peer.0, msgid)?;
            } else {
                for (_, name) in &names {
                    let msgid = self.recovery.record_names_sent(peer.0)?;
                    let frame = dispatch::build_names_frame(0, self.local_nodeid, peer.0, name, msgid);
                    self.transport.send(peer.0, &frame).await?;
                }
            }

            if local_locks.is_empty() {
                let msgid = self.recovery.record_locks_sent(peer.0)?;
                self.recovery.record_locks_acked(peer.0, msgid)?;
            } else {
                for (_, name, lkid, mode) in &local_locks {
                    let msgid = self.recovery.record_locks_sent(peer.0)?;
                    let frame = dispatch::build_locks_frame(0, self.local_nodeid, peer.0, name, *lkid, *mode, msgid);
                    self.transport.send(peer.0, &frame).await?;
                }
            }
        }
        Ok(())
    }

    fn fire_if_resolved(&self, lkid: LkId, outcome: Option<Outcome>) -> DlmResult<()> {
        let Some(outcome) = outcome else { return Ok(()) };
        let completion = self.lkbs.with_mut(lkid, |l| l.completion.take())?;
        if let Some(completion) = completion {
            completion.keep(outcome);
        }
        Ok(())
    }

    /// Fire completions for grants belonging to locally-owned LKBs. Grants
    /// belonging to remote-owned (`MSTCPY`) LKBs are skipped here; see
    /// [`Self::push_remote_grants`].
    fn fire_local_grants(&self, grants: &[state_machine::Grant]) -> DlmResult<()> {
        for grant in grants {
            let lkid = Self::grant_lkid(grant);
            if self.lkbs.with(lkid, |l| l.owner_nodeid)? != 0 {
                continue;
            }
            let outcome = self.grant_outcome(grant)?;
            self.fire_if_resolved(lkid, Some(outcome))?;
        }
        Ok(())
    }

    /// Push server-initiated `GRANT` frames (spec §6 `GRANT`) to the owning
    /// node for any grant belonging to a remote-owned `MSTCPY` LKB.
    async fn push_remote_grants(&self, grants: &[state_machine::Grant]) -> DlmResult<()> {
        for grant in grants {
            let Some(frame) = dispatch::build_grant_frame(0, self.local_nodeid, &self.resources, &self.lkbs, grant)? else { continue };
            let owner = frame.target_nodeid;
            self.transport.send(owner, &frame).await?;
        }
        Ok(())
    }

    fn grant_lkid(grant: &state_machine::Grant) -> LkId {
        match grant {
            state_machine::Grant::Granted { lkid, .. } => *lkid,
            state_machine::Grant::DemotedForDeadlock { lkid } => *lkid,
            state_machine::Grant::SignalledDeadlock { lkid } => *lkid,
        }
    }

    /// Turn a committed [`state_machine::Grant`] into the `Outcome` its
    /// completion fires with, filling `lvb` from the resource when the
    /// grantee's LKB asked for `VALBLK` (spec §4.3 "LVB semantics").
    fn grant_outcome(&self, grant: &state_machine::Grant) -> DlmResult<Outcome> {
        let lkid = Self::grant_lkid(grant);
        let (rsb_id, want_lvb) = self.lkbs.with(lkid, |l| (l.resource, l.flags.contains(LockFlags::VALBLK)))?;
        let lvb = if want_lvb { Some(self.resources.with(rsb_id, |r| r.lvb.bytes().to_vec())?) } else { None };
        Ok(match grant {
            state_machine::Grant::Granted { lkid, mode } => Outcome::Granted { lock_id: *lkid, mode: *mode, lvb },
            state_machine::Grant::DemotedForDeadlock { lkid } => Outcome::Granted { lock_id: *lkid, mode: Mode::Nl, lvb },
            state_machine::Grant::SignalledDeadlock { .. } => Outcome::Failed(DlmError::Deadlock),
        })
    }
}

/// Convenience for callers that want a oneshot-backed completion and the
/// receiving end to await (matches the teacher's promise/keep contract,
/// adapted to a plain channel rather than a trait object per call site).
pub fn oneshot_completion() -> (Box<dyn Completion>, tokio::sync::oneshot::Receiver<Outcome>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    (Box::new(OneshotCompletion(tx)), rx)
}
