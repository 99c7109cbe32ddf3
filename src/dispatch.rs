//! Remote dispatch (spec §4.5): encode lock operations bound for a remote
//! master as [`Frame`]s, apply them on the master side against a
//! `MSTCPY`-flagged LKB, and apply replies back on the requester side.

use tracing::debug;

use crate::completion::Outcome;
use crate::error::{DlmError, DlmResult};
use crate::lkb::{LkId, Lkb, LkbFlags, LockFlags};
use crate::lkb_store::LkbStore;
use crate::mode::Mode;
use crate::range::Range;
use crate::rsb::{ResourceDirectory, RsbId};
use crate::state_machine::{self, Grant};
use crate::wire::{Frame, Kind, WireStatus};

/// Build the `REQUEST` frame for a brand-new remotely-mastered lock
/// (spec §4.5 "the operation is encoded as a message ...").
pub fn build_request_frame(lockspace: u32, sender_nodeid: u32, target_nodeid: u32, lkid: LkId, name: &[u8], lkbs: &LkbStore) -> DlmResult<Frame> {
    let (rqmode, range, flags) = lkbs.with(lkid, |l| (l.rqmode, l.requested_range, l.flags))?;
    let range = range.unwrap_or(Range::FULL);
    Ok(Frame {
        kind: Kind::Request,
        flags: flags.bits() as u8,
        lockspace,
        sender_nodeid,
        target_nodeid,
        sender_lkid: lkid,
        remote_lkid: 0,
        mode: Mode::Nl,
        rqmode,
        status: 0,
        result: WireStatus::Ok,
        range_start: range.start,
        range_end: range.end,
        name: name.to_vec(),
        lvb: Vec::new(),
    })
}

/// Build the `CONVERT` frame for a conversion against a remote master.
/// `flags`/`range` are this conversion call's own (spec §6 `convert(lock_id,
/// new_mode, flags, lvb?, range?, completion_cb)`); `lvb_write` carries
/// bytes to copy into the resource LVB on a downgrade, same as the local
/// path in `state_machine::request_convert`.
#[allow(clippy::too_many_arguments)]
pub fn build_convert_frame(
    lockspace: u32,
    sender_nodeid: u32,
    target_nodeid: u32,
    lkid: LkId,
    remote_lkid: LkId,
    new_mode: Mode,
    flags: LockFlags,
    range: Option<(u64, u64)>,
    lvb_write: Option<&[u8]>,
    lkbs: &LkbStore,
) -> DlmResult<Frame> {
    let grmode = lkbs.with(lkid, |l| l.grmode.unwrap_or(Mode::Nl))?;
    let range = range.map(|(start, end)| Range { start, end }).unwrap_or(Range::FULL);
    Ok(Frame {
        kind: Kind::Convert,
        flags: flags.bits() as u8,
        lockspace,
        sender_nodeid,
        target_nodeid,
        sender_lkid: lkid,
        remote_lkid,
        mode: grmode,
        rqmode: new_mode,
        status: 0,
        result: WireStatus::Ok,
        range_start: range.start,
        range_end: range.end,
        name: Vec::new(),
        lvb: lvb_write.map(|b| b.to_vec()).unwrap_or_default(),
    })
}

/// Build the `UNLOCK` frame releasing a remotely-mastered lock.
pub fn build_unlock_frame(lockspace: u32, sender_nodeid: u32, target_nodeid: u32, lkid: LkId, remote_lkid: LkId, lvb: Option<&[u8]>) -> Frame {
    Frame {
        kind: Kind::Unlock,
        flags: 0,
        lockspace,
        sender_nodeid,
        target_nodeid,
        sender_lkid: lkid,
        remote_lkid,
        mode: Mode::Nl,
        rqmode: Mode::Nl,
        status: 0,
        result: WireStatus::Ok,
        range_start: 0,
        range_end: u64::MAX,
        name: Vec::new(),
        lvb: lvb.map(|b| b.to_vec()).unwrap_or_default(),
    }
}

/// Build one `NAMES` frame for the recovery resend pass (spec §4.6 step
/// 3): tells `target_nodeid` that this node holds a lock on `name`, so a
/// newly elected master knows to expect it before the `LOCKS` pass rebuilds
/// the actual grant. `msgid` rides in `range_start`, the same repurposing
/// `LOOKUP`'s reply already does with `remote_lkid`, since this frame kind
/// has no lock-specific range of its own to carry.
pub fn build_names_frame(lockspace: u32, sender_nodeid: u32, target_nodeid: u32, name: &[u8], msgid: u64) -> Frame {
    Frame {
        kind: Kind::Names,
        flags: 0,
        lockspace,
        sender_nodeid,
        target_nodeid,
        sender_lkid: 0,
        remote_lkid: 0,
        mode: Mode::Nl,
        rqmode: Mode::Nl,
        status: 0,
        result: WireStatus::Ok,
        range_start: msgid,
        range_end: 0,
        name: name.to_vec(),
        lvb: Vec::new(),
    }
}

/// Build one `LOCKS` frame for the recovery resend pass (spec §4.6 step 4):
/// conveys one of this node's own locally-owned locks on `name`, so the
/// receiving node can rebuild a `MSTCPY` LKB for it if it is now mastering
/// the resource.
#[allow(clippy::too_many_arguments)]
pub fn build_locks_frame(lockspace: u32, sender_nodeid: u32, target_nodeid: u32, name: &[u8], lkid: LkId, mode: Mode, msgid: u64) -> Frame {
    Frame {
        kind: Kind::Locks,
        flags: 0,
        lockspace,
        sender_nodeid,
        target_nodeid,
        sender_lkid: lkid,
        remote_lkid: 0,
        mode,
        rqmode: mode,
        status: 0,
        result: WireStatus::Ok,
        range_start: msgid,
        range_end: 0,
        name: name.to_vec(),
        lvb: Vec::new(),
    }
}

/// Ack a `NAMES`/`LOCKS` frame, echoing its msgid straight back (spec §4.6
/// step 5 "exactly-once application").
pub fn build_resend_ack(kind: Kind, lockspace: u32, sender_nodeid: u32, frame: &Frame) -> Frame {
    Frame {
        kind,
        flags: 0,
        lockspace,
        sender_nodeid,
        target_nodeid: frame.sender_nodeid,
        sender_lkid: 0,
        remote_lkid: 0,
        mode: Mode::Nl,
        rqmode: Mode::Nl,
        status: 0,
        result: WireStatus::Ok,
        range_start: frame.range_start,
        range_end: 0,
        name: Vec::new(),
        lvb: Vec::new(),
    }
}

/// Receiving side: install a replayed lock from a `LOCKS` frame as a fresh
/// `MSTCPY` LKB, directly onto `granted` (this is restoring already-
/// consistent state from before the membership change, not a fresh grant
/// negotiation, so it bypasses `state_machine::request_new`'s conflict
/// evaluation).
pub fn apply_incoming_lock_resend(resources: &ResourceDirectory, lkbs: &LkbStore, local_lkid: LkId, frame: &Frame) -> DlmResult<()> {
    let rsb_id = resources.get_or_create(None, &frame.name)?;
    resources.with_mut(rsb_id, |r| r.master_nodeid = 0)?;
    let mut lkb = Lkb::new(local_lkid, rsb_id, frame.mode, LockFlags::empty());
    lkb.internal_flags = LkbFlags::MSTCPY;
    lkb.owner_nodeid = frame.sender_nodeid;
    lkb.remote_lkid = Some(frame.sender_lkid);
    lkb.grmode = Some(frame.mode);
    lkb.status = crate::lkb::LkbStatus::Granted;
    lkbs.insert(lkb)?;
    resources.with_mut(rsb_id, |r| r.granted.push(local_lkid))?;
    Ok(())
}

/// Master side: apply an incoming `REQUEST` against a fresh `MSTCPY` LKB
/// on `rsb_id`, returning the reply frame to send back to the requester.
pub fn apply_remote_request(resources: &ResourceDirectory, lkbs: &LkbStore, rsb_id: RsbId, local_lkid: LkId, frame: &Frame) -> DlmResult<Frame> {
    let mut lkb = Lkb::new(local_lkid, rsb_id, frame.rqmode, LockFlags::from_bits_truncate(frame.flags as u32));
    lkb.internal_flags = LkbFlags::MSTCPY;
    lkb.owner_nodeid = frame.sender_nodeid;
    lkb.remote_lkid = Some(frame.sender_lkid);
    if !(frame.range_start == 0 && frame.range_end == u64::MAX) {
        lkb.set_requested_range(frame.range_start, frame.range_end);
    }
    lkbs.insert(lkb)?;

    let outcome = state_machine::request_new(resources, lkbs, rsb_id, local_lkid)?;
    let (result, grmode, lvb) = match outcome {
        Some(Outcome::Granted { mode, lvb, .. }) => (WireStatus::Ok, mode, lvb),
        Some(Outcome::Failed(err)) => (WireStatus::from_error(&err), Mode::Nl, None),
        None => (WireStatus::Queued, Mode::Nl, None),
    };
    debug!(local_lkid, sender_lkid = frame.sender_lkid, ?result, "master applied remote request");

    Ok(Frame {
        kind: Kind::RequestReply,
        flags: 0,
        lockspace: frame.lockspace,
        sender_nodeid: frame.target_nodeid,
        target_nodeid: frame.sender_nodeid,
        sender_lkid: frame.sender_lkid,
        remote_lkid: local_lkid,
        mode: grmode,
        rqmode: frame.rqmode,
        status: 0,
        result,
        range_start: frame.range_start,
        range_end: frame.range_end,
        name: Vec::new(),
        lvb: lvb.unwrap_or_default(),
    })
}

/// Master side: apply an incoming `CONVERT` against the existing `MSTCPY`
/// LKB identified by `frame.remote_lkid` (the master's local id for it).
pub fn apply_remote_convert(resources: &ResourceDirectory, lkbs: &LkbStore, rsb_id: RsbId, frame: &Frame) -> DlmResult<Frame> {
    let local_lkid = frame.remote_lkid;
    let flags = LockFlags::from_bits_truncate(frame.flags as u32);
    let range = if frame.range_start == 0 && frame.range_end == u64::MAX { None } else { Some((frame.range_start, frame.range_end)) };
    let lvb_write = if frame.lvb.is_empty() { None } else { Some(frame.lvb.as_slice()) };
    let outcome = state_machine::request_convert(resources, lkbs, rsb_id, local_lkid, frame.rqmode, flags, range, lvb_write)?;
    let (result, grmode, lvb) = match outcome {
        Some(Outcome::Granted { mode, lvb, .. }) => (WireStatus::Ok, mode, lvb),
        Some(Outcome::Failed(err)) => (WireStatus::from_error(&err), Mode::Nl, None),
        None => (WireStatus::Queued, Mode::Nl, None),
    };
    Ok(Frame {
        kind: Kind::ConvertReply,
        flags: 0,
        lockspace: frame.lockspace,
        sender_nodeid: frame.target_nodeid,
        target_nodeid: frame.sender_nodeid,
        sender_lkid: frame.sender_lkid,
        remote_lkid: local_lkid,
        mode: grmode,
        rqmode: frame.rqmode,
        status: 0,
        result,
        range_start: 0,
        range_end: u64::MAX,
        name: Vec::new(),
        lvb: lvb.unwrap_or_default(),
    })
}

/// Master side: apply an incoming `UNLOCK`, freeing the `MSTCPY` LKB.
pub fn apply_remote_unlock(resources: &ResourceDirectory, lkbs: &LkbStore, rsb_id: RsbId, frame: &Frame) -> DlmResult<Frame> {
    let local_lkid = frame.remote_lkid;
    let lvb = if frame.lvb.is_empty() { None } else { Some(frame.lvb.as_slice()) };
    state_machine::unlock(resources, lkbs, rsb_id, local_lkid, lvb)?;
    lkbs.remove(local_lkid)?;
    resources.unref(rsb_id)?;
    Ok(Frame {
        kind: Kind::UnlockReply,
        flags: 0,
        lockspace: frame.lockspace,
        sender_nodeid: frame.target_nodeid,
        target_nodeid: frame.sender_nodeid,
        sender_lkid: frame.sender_lkid,
        remote_lkid: local_lkid,
        mode: Mode::Nl,
        rqmode: Mode::Nl,
        status: 0,
        result: WireStatus::Ok,
        range_start: 0,
        range_end: u64::MAX,
        name: Vec::new(),
        lvb: Vec::new(),
    })
}

/// Requester side: apply a reply frame. Returns `None` when the master
/// only acknowledged queuing the request; no completion fires yet, and
/// the later `GRANT` message (or a deadlock resolution) is what resolves
/// it (spec §4.5 "On receipt the in-flight record is retired ... the
/// caller's completion fired" — true only for a terminal outcome here).
pub fn apply_reply(lkbs: &LkbStore, local_lkid: LkId, frame: &Frame) -> DlmResult<Option<Outcome>> {
    match frame.result {
        WireStatus::Ok => {
            lkbs.with_mut(local_lkid, |l| {
                l.grmode = Some(frame.mode);
                l.remote_lkid = Some(frame.remote_lkid);
            })?;
            let lvb = if frame.lvb.is_empty() { None } else { Some(frame.lvb.clone()) };
            Ok(Some(Outcome::Granted { lock_id: local_lkid, mode: frame.mode, lvb }))
        }
        WireStatus::Queued => {
            lkbs.with_mut(local_lkid, |l| l.remote_lkid = Some(frame.remote_lkid))?;
            Ok(None)
        }
        other => Ok(Some(Outcome::Failed(other.into_result().unwrap_err()))),
    }
}

/// Convert a committed local [`Grant`] from re-evaluation on a
/// remotely-served resource into a server-initiated `GRANT` frame to push
/// to the LKB's owning node (spec §6 `GRANT` "server-initiated"). Carries
/// the resource's current LVB bytes when the grantee's LKB asked for
/// `VALBLK`, same as an `OK` reply does on the direct request/convert path.
pub fn build_grant_frame(lockspace: u32, sender_nodeid: u32, resources: &ResourceDirectory, lkbs: &LkbStore, grant: &Grant) -> DlmResult<Option<Frame>> {
    let Grant::Granted { lkid, mode } = grant else { return Ok(None) };
    let (owner_nodeid, owner_lkid, rsb_id, want_lvb) =
        lkbs.with(*lkid, |l| (l.owner_nodeid, l.remote_lkid, l.resource, l.flags.contains(LockFlags::VALBLK)))?;
    if owner_nodeid == 0 {
        return Ok(None); // locally owned; completion fires in-process, no wire hop needed
    }
    let Some(owner_lkid) = owner_lkid else { return Ok(None) };
    let lvb = if want_lvb { resources.with(rsb_id, |r| r.lvb.bytes().to_vec())? } else { Vec::new() };
    Ok(Some(Frame {
        kind: Kind::Grant,
        flags: 0,
        lockspace,
        sender_nodeid,
        target_nodeid: owner_nodeid,
        // `sender_lkid` is, by the convention every other reply follows,
        // the id meaningful to whichever node receives this frame: here
        // that's the owner's own id for its lock, not the master's.
        sender_lkid: owner_lkid,
        remote_lkid: *lkid,
        mode: *mode,
        rqmode: *mode,
        status: 0,
        result: WireStatus::Ok,
        range_start: 0,
        range_end: u64::MAX,
        name: Vec::new(),
        lvb,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lkb_store::LkbStore;
    use crate::rsb::ResourceDirectory;

    #[test]
    fn master_grants_remote_request_and_builds_ok_reply() {
        let resources = ResourceDirectory::new(32);
        let lkbs = LkbStore::new();
        let rsb = resources.get_or_create(None, b"R").unwrap();

        let frame = Frame {
            kind: Kind::Request,
            flags: 0,
            lockspace: 1,
            sender_nodeid: 7,
            target_nodeid: 0,
            sender_lkid: 99,
            remote_lkid: 0,
            mode: Mode::Nl,
            rqmode: Mode::Ex,
            status: 0,
            result: WireStatus::Ok,
            range_start: 0,
            range_end: u64::MAX,
            name: b"R".to_vec(),
            lvb: Vec::new(),
        };

        let reply = apply_remote_request(&resources, &lkbs, rsb, 1, &frame).unwrap();
        assert_eq!(reply.result, WireStatus::Ok);
        assert_eq!(reply.mode, Mode::Ex);
        assert_eq!(reply.remote_lkid, 1);
    }

    #[test]
    fn requester_applies_ok_reply_as_granted_outcome() {
        let lkbs = LkbStore::new();
        lkbs.insert(Lkb::new(1, 7, Mode::Ex, LockFlags::empty())).unwrap();

        let frame = Frame {
            kind: Kind::RequestReply,
            flags: 0,
            lockspace: 1,
            sender_nodeid: 0,
            target_nodeid: 7,
            sender_lkid: 1,
            remote_lkid: 5,
            mode: Mode::Ex,
            rqmode: Mode::Ex,
            status: 0,
            result: WireStatus::Ok,
            range_start: 0,
            range_end: u64::MAX,
            name: Vec::new(),
            lvb: Vec::new(),
        };

        let outcome = apply_reply(&lkbs, 1, &frame).unwrap();
        assert_eq!(outcome, Some(Outcome::Granted { lock_id: 1, mode: Mode::Ex, lvb: None }));
        lkbs.with(1, |l| assert_eq!(l.remote_lkid, Some(5))).unwrap();
    }

    #[test]
    fn queued_reply_does_not_resolve_the_completion() {
        let lkbs = LkbStore::new();
        lkbs.insert(Lkb::new(1, 7, Mode::Ex, LockFlags::empty())).unwrap();

        let frame = Frame {
            kind: Kind::RequestReply,
            flags: 0,
            lockspace: 1,
            sender_nodeid: 0,
            target_nodeid: 7,
            sender_lkid: 1,
            remote_lkid: 5,
            mode: Mode::Nl,
            rqmode: Mode::Ex,
            status: 0,
            result: WireStatus::Queued,
            range_start: 0,
            range_end: u64::MAX,
            name: Vec::new(),
            lvb: Vec::new(),
        };

        let outcome = apply_reply(&lkbs, 1, &frame).unwrap();
        assert_eq!(outcome, None);
        lkbs.with(1, |l| assert_eq!(l.remote_lkid, Some(5))).unwrap();
    }
}
