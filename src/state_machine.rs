//! The grant state machine (spec §4.3): granted/convert/wait queues, the
//! compatibility matrix, range refinement, and conversion-deadlock
//! handling. Pure, synchronous, and lock-scoped — the only blocking here
//! is the resource-directory/LKB-store rwlock acquisition (spec §5).

use tracing::{debug, warn};

use crate::completion::Outcome;
use crate::error::{DlmError, DlmResult};
use crate::lkb::{LkId, LkbStatus, LockFlags};
use crate::lkb_store::LkbStore;
use crate::mode::Mode;
use crate::range::Range;
use crate::rsb::{ResourceDirectory, Rsb, RsbId};

/// Two LKBs (compared by requested mode vs. a blocker's mode) are
/// compatible if their modes are compatible *or*, for range locks, their
/// ranges are disjoint (spec §4.3 rule 3).
fn locks_compatible(req_mode: Mode, req_range: Option<Range>, held_mode: Mode, held_range: Option<Range>) -> bool {
    if req_mode.compatible_with(held_mode) {
        return true;
    }
    match (req_range, held_range) {
        (Some(a), Some(b)) => a.disjoint(&b),
        _ => false,
    }
}

/// True if `new` is a safe downgrade from `old`: no stricter than `old`
/// and compatible with everything `old` was compatible with (spec §4.3
/// "Conversion" downgrade clause).
pub fn is_downgrade(new: Mode, old: Mode) -> bool {
    if new > old {
        return false;
    }
    Mode::ALL.iter().all(|&x| !old.compatible_with(x) || new.compatible_with(x))
}

/// Blockers for a brand-new (or freshly enqueued) wait-queue request:
/// every currently granted LKB. Per spec §4.3 rule 1, if `convert` is
/// non-empty a new request is blocked outright regardless of mode, to
/// preserve convert-queue priority (testable property 4).
fn new_request_grantable(rsb: &Rsb, lkbs: &LkbStore, req_mode: Mode, req_range: Option<Range>) -> DlmResult<bool> {
    if !rsb.convert.is_empty() {
        return Ok(false);
    }
    for &gid in &rsb.granted {
        let (gmode, grange) = lkbs.with(gid, |l| (l.grmode.unwrap_or(Mode::Nl), l.granted_range))?;
        if !locks_compatible(req_mode, req_range, gmode, grange) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Blockers for the LKB at `convert[idx]`: every granted LKB (other than
/// itself) and every convert-queue entry strictly ahead of it, using
/// their *requested* mode/range since FIFO-ahead converts have priority
/// (spec §4.3 rule 2, generalized from "join of granted and first convert").
/// Takes plain id slices (snapshotted by the caller) rather than `&Rsb`
/// so the resource-directory lock need not be held across the
/// per-LKB lookups this performs.
fn convert_entry_grantable(granted: &[LkId], convert: &[LkId], lkbs: &LkbStore, idx: usize) -> DlmResult<bool> {
    let lkid = convert[idx];
    let (req_mode, req_range) = lkbs.with(lkid, |l| (l.rqmode, l.requested_range.or(l.granted_range)))?;

    for &gid in granted {
        if gid == lkid {
            continue;
        }
        let (gmode, grange) = lkbs.with(gid, |l| (l.grmode.unwrap_or(Mode::Nl), l.granted_range))?;
        if !locks_compatible(req_mode, req_range, gmode, grange) {
            return Ok(false);
        }
    }
    for &ahead in &convert[..idx] {
        let (amode, arange) = lkbs.with(ahead, |l| (l.rqmode, l.requested_range.or(l.granted_range)))?;
        if !locks_compatible(req_mode, req_range, amode, arange) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Outcome of a re-evaluation pass, consumed by the lockspace layer to
/// fire completions and update in-flight bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    /// `lkid` is now granted at `mode`.
    Granted { lkid: LkId, mode: Mode },
    /// `lkid` was demoted to NL to break a conversion deadlock (spec §4.3).
    DemotedForDeadlock { lkid: LkId },
    /// `lkid`'s conversion was signalled DEADLOCK per its `CONVDEADLK` flag.
    SignalledDeadlock { lkid: LkId },
}

/// Re-evaluate a resource's convert then wait queues, granting everything
/// grantable in FIFO order and handling conversion-deadlock demotion
/// (spec §4.3 "Unlock/Cancel"). Call after any queue-changing operation:
/// new request, conversion request, unlock, cancel, or demotion.
pub fn reevaluate(resources: &ResourceDirectory, lkbs: &LkbStore, rsb_id: RsbId) -> DlmResult<Vec<Grant>> {
    let mut grants = Vec::new();

    // Convert queue: only ever consider the head. Granting it may unblock
    // the new head on the next loop iteration; a non-grantable head stops
    // the walk entirely to preserve FIFO order (spec §4.3), after one
    // attempt to break a conversion deadlock at the head.
    loop {
        let (granted, convert) = resources.with(rsb_id, |r| (r.granted.clone(), r.convert.clone()))?;
        if convert.is_empty() {
            break;
        }

        if convert_entry_grantable(&granted, &convert, lkbs, 0)? {
            grant_convert_entry(resources, lkbs, rsb_id, 0, &mut grants)?;
            continue;
        }

        if let Some(demoted) = try_break_conversion_deadlock(resources, lkbs, rsb_id)? {
            grants.push(demoted);
            continue;
        }

        break;
    }

    // Wait queue: strictly FIFO, only consulted once convert is empty
    // (spec §4.3 rule 1 / testable property 4).
    if resources.with(rsb_id, |r| r.convert.is_empty())? {
        loop {
            let wait_len = resources.with(rsb_id, |r| r.wait.len())?;
            if wait_len == 0 {
                break;
            }
            let head = resources.with(rsb_id, |r| r.wait[0])?;
            let (mode, range) = lkbs.with(head, |l| (l.rqmode, l.requested_range))?;
            let grantable = resources.with(rsb_id, |r| new_request_grantable(r, lkbs, mode, range))??;
            if !grantable {
                break;
            }
            grant_wait_entry(resources, lkbs, rsb_id, head, mode, &mut grants)?;
        }
    }

    Ok(grants)
}

fn grant_convert_entry(
    resources: &ResourceDirectory,
    lkbs: &LkbStore,
    rsb_id: RsbId,
    idx: usize,
    grants: &mut Vec<Grant>,
) -> DlmResult<()> {
    let lkid = resources.with(rsb_id, |r| r.convert[idx])?;
    let new_mode = lkbs.with(lkid, |l| l.rqmode)?;
    let new_range = lkbs.with(lkid, |l| l.requested_range)?;

    resources.with_mut(rsb_id, |r| {
        r.convert.remove(idx);
        r.granted.push(lkid);
    })?;
    lkbs.with_mut(lkid, |l| {
        l.grmode = Some(new_mode);
        if new_range.is_some() {
            l.granted_range = new_range;
        }
        l.status = LkbStatus::Granted;
    })?;
    debug!(lkid, %new_mode, "conversion granted");
    grants.push(Grant::Granted { lkid, mode: new_mode });
    Ok(())
}

fn grant_wait_entry(
    resources: &ResourceDirectory,
    lkbs: &LkbStore,
    rsb_id: RsbId,
    lkid: LkId,
    mode: Mode,
    grants: &mut Vec<Grant>,
) -> DlmResult<()> {
    resources.with_mut(rsb_id, |r| {
        r.wait.retain(|&x| x != lkid);
        r.granted.push(lkid);
    })?;
    lkbs.with_mut(lkid, |l| {
        l.grmode = Some(mode);
        if let Some(range) = l.requested_range {
            l.granted_range = Some(range);
        }
        l.status = LkbStatus::Granted;
    })?;
    debug!(lkid, %mode, "new lock granted");
    grants.push(Grant::Granted { lkid, mode });
    Ok(())
}

/// Detect and break a conversion deadlock on `rsb_id` (spec §4.3): the
/// head of `convert` is blocked by a granted-mode holder that is itself
/// present on the `convert` queue. The most recently enqueued such
/// offending converter is demoted (grmode -> NL) unless it requested
/// `CONVDEADLK`, in which case it is signalled instead.
fn try_break_conversion_deadlock(
    resources: &ResourceDirectory,
    lkbs: &LkbStore,
    rsb_id: RsbId,
) -> DlmResult<Option<Grant>> {
    let (head, convert, granted) = resources.with(rsb_id, |r| (r.convert.first().copied(), r.convert.clone(), r.granted.clone()))?;
    let Some(head) = head else { return Ok(None) };
    let (head_mode, head_range) = lkbs.with(head, |l| (l.rqmode, l.requested_range.or(l.granted_range)))?;

    // Offenders: granted holders blocking the head that are themselves
    // converting on this resource (i.e. also appear in `convert`).
    let mut offenders = Vec::new();
    for &gid in &granted {
        if gid == head {
            continue;
        }
        let (gmode, grange) = lkbs.with(gid, |l| (l.grmode.unwrap_or(Mode::Nl), l.granted_range))?;
        if !locks_compatible(head_mode, head_range, gmode, grange) && convert.contains(&gid) {
            offenders.push(gid);
        }
    }
    if offenders.is_empty() {
        return Ok(None);
    }

    // "Most recently enqueued": the one with the highest index in `convert`.
    let offender = *offenders
        .iter()
        .max_by_key(|id| convert.iter().position(|x| x == *id).unwrap_or(0))
        .expect("offenders is non-empty");

    let signal_only = lkbs.with(offender, |l| l.flags.contains(LockFlags::CONVDEADLK))?;
    if signal_only {
        warn!(lkid = offender, rsb = rsb_id, "conversion deadlock: signalling requester");
        // The offending LKB stays granted at its old mode; its pending
        // conversion is withdrawn back to the original grant and the
        // caller is told DEADLOCK instead of being demoted.
        resources.with_mut(rsb_id, |r| r.convert.retain(|&x| x != offender))?;
        lkbs.with_mut(offender, |l| l.status = LkbStatus::Granted)?;
        Ok(Some(Grant::SignalledDeadlock { lkid: offender }))
    } else {
        warn!(lkid = offender, rsb = rsb_id, "conversion deadlock: demoting requester to NL");
        resources.with_mut(rsb_id, |r| {
            r.convert.retain(|&x| x != offender);
            r.granted.retain(|&x| x != offender);
        })?;
        lkbs.with_mut(offender, |l| {
            l.grmode = Some(Mode::Nl);
            l.granted_range = None;
            l.status = LkbStatus::None;
        })?;
        Ok(Some(Grant::DemotedForDeadlock { lkid: offender }))
    }
}

/// Attempt to grant a brand-new lock request immediately; if not
/// grantable, enqueue on `wait` unless `NOQUEUE` is set (spec §4.3 "New
/// lock", spec §6 `NOQUEUE`).
pub fn request_new(
    resources: &ResourceDirectory,
    lkbs: &LkbStore,
    rsb_id: RsbId,
    lkid: LkId,
) -> DlmResult<Option<Outcome>> {
    lkbs.with_mut(lkid, |l| l.status = LkbStatus::Waiting)?;
    let (mode, range, noqueue, want_lvb) = lkbs.with(lkid, |l| {
        (l.rqmode, l.requested_range, l.flags.contains(LockFlags::NOQUEUE), l.flags.contains(LockFlags::VALBLK))
    })?;

    let grantable = resources.with(rsb_id, |r| new_request_grantable(r, lkbs, mode, range))??;
    if grantable {
        resources.with_mut(rsb_id, |r| r.granted.push(lkid))?;
        lkbs.with_mut(lkid, |l| {
            l.grmode = Some(mode);
            l.granted_range = range;
            l.status = LkbStatus::Granted;
        })?;
        let lvb = want_lvb.then(|| resources.with(rsb_id, |r| r.lvb.bytes().to_vec())).transpose()?;
        return Ok(Some(Outcome::Granted { lock_id: lkid, mode, lvb }));
    }

    if noqueue {
        lkbs.with_mut(lkid, |l| l.status = LkbStatus::None)?;
        return Ok(Some(Outcome::Failed(DlmError::NotQueued)));
    }

    resources.with_mut(rsb_id, |r| r.wait.push(lkid))?;
    Ok(None)
}

/// Move a granted LKB to the convert queue and evaluate it (spec §4.3
/// "Conversion"). `flags`/`range` are this conversion call's own (spec §6
/// `convert(lock_id, new_mode, flags, lvb?, range?, completion_cb)`, not
/// necessarily the flags/range the original lock request carried);
/// `lvb_write` is copied into the resource LVB first if the conversion is
/// a downgrade out of a writer mode (spec §4.3 "LVB semantics"). Returns
/// the immediate outcome if resolved synchronously (grant, deadlock
/// signal, or NOQUEUE failure), or `None` if the conversion is left
/// pending on `convert`.
#[allow(clippy::too_many_arguments)]
pub fn request_convert(
    resources: &ResourceDirectory,
    lkbs: &LkbStore,
    rsb_id: RsbId,
    lkid: LkId,
    new_mode: Mode,
    flags: LockFlags,
    range: Option<(u64, u64)>,
    lvb_write: Option<&[u8]>,
) -> DlmResult<Option<Outcome>> {
    let old_mode = lkbs.with(lkid, |l| l.grmode.unwrap_or(Mode::Nl))?;
    lkbs.with_mut(lkid, |l| {
        l.flags = flags;
        if let Some((start, end)) = range {
            l.set_requested_range(start, end);
        }
    })?;
    let noqueue = flags.contains(LockFlags::NOQUEUE);
    let want_lvb = flags.contains(LockFlags::VALBLK);

    if is_downgrade(new_mode, old_mode) {
        if old_mode.is_writer() {
            if let Some(data) = lvb_write {
                resources.with_mut(rsb_id, |r| r.lvb.write(data))?;
            }
        }
        lkbs.with_mut(lkid, |l| {
            l.rqmode = new_mode;
            l.grmode = Some(new_mode);
        })?;
        let lvb = want_lvb.then(|| resources.with(rsb_id, |r| r.lvb.bytes().to_vec())).transpose()?;
        return Ok(Some(Outcome::Granted { lock_id: lkid, mode: new_mode, lvb }));
    }

    resources.with_mut(rsb_id, |r| {
        r.granted.retain(|&x| x != lkid);
        r.convert.push(lkid);
    })?;
    lkbs.with_mut(lkid, |l| {
        l.rqmode = new_mode;
        l.status = LkbStatus::Convert;
    })?;

    let (granted, convert) = resources.with(rsb_id, |r| (r.granted.clone(), r.convert.clone()))?;
    let idx = convert.iter().position(|&x| x == lkid).ok_or_else(|| DlmError::Invariant("convert entry vanished".into()))?;
    let grantable = convert_entry_grantable(&granted, &convert, lkbs, idx)?;
    if grantable && idx == 0 {
        let mut grants = Vec::new();
        grant_convert_entry(resources, lkbs, rsb_id, idx, &mut grants)?;
        if let Some(Grant::Granted { mode, .. }) = grants.into_iter().next() {
            let lvb = want_lvb.then(|| resources.with(rsb_id, |r| r.lvb.bytes().to_vec())).transpose()?;
            return Ok(Some(Outcome::Granted { lock_id: lkid, mode, lvb }));
        }
    }

    if noqueue {
        // Not immediately grantable, at any queue position: NOQUEUE means
        // fail now rather than wait for a later re-evaluation to promote
        // it (spec §6 `NOQUEUE`).
        resources.with_mut(rsb_id, |r| {
            r.convert.retain(|&x| x != lkid);
            r.granted.push(lkid);
        })?;
        lkbs.with_mut(lkid, |l| {
            l.rqmode = old_mode;
            l.status = LkbStatus::Granted;
        })?;
        return Ok(Some(Outcome::Failed(DlmError::NotQueued)));
    }

    Ok(None)
}

/// Remove an LKB from whatever queue holds it and re-evaluate the
/// resource (spec §4.3 "Unlock/Cancel"). `write_lvb` copies caller data
/// into the resource LVB first if the LKB was holding a writer mode.
pub fn unlock(resources: &ResourceDirectory, lkbs: &LkbStore, rsb_id: RsbId, lkid: LkId, lvb_write: Option<&[u8]>) -> DlmResult<Vec<Grant>> {
    let was_writer = lkbs.with(lkid, |l| l.grmode.map(|m| m.is_writer()).unwrap_or(false))?;
    if was_writer {
        if let Some(data) = lvb_write {
            resources.with_mut(rsb_id, |r| r.lvb.write(data))?;
        }
    }
    resources.with_mut(rsb_id, |r| {
        r.remove_lkb(lkid);
    })?;
    lkbs.with_mut(lkid, |l| {
        l.status = LkbStatus::None;
        l.grmode = None;
    })?;
    reevaluate(resources, lkbs, rsb_id)
}

/// Cancel a pending (waiting or converting) lock. A cancel that lands on
/// an already-granted LKB is equivalent to unlock (spec §5 "Cancellation").
pub fn cancel(resources: &ResourceDirectory, lkbs: &LkbStore, rsb_id: RsbId, lkid: LkId) -> DlmResult<(Outcome, Vec<Grant>)> {
    let status = lkbs.with(lkid, |l| l.status)?;
    if status == LkbStatus::Granted {
        let grants = unlock(resources, lkbs, rsb_id, lkid, None)?;
        return Ok((Outcome::Failed(DlmError::Unlocked), grants));
    }
    resources.with_mut(rsb_id, |r| {
        r.remove_lkb(lkid);
    })?;
    lkbs.with_mut(lkid, |l| l.status = LkbStatus::None)?;
    let grants = reevaluate(resources, lkbs, rsb_id)?;
    Ok((Outcome::Failed(DlmError::Cancelled), grants))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lkb::{Lkb, LockFlags};

    fn setup() -> (ResourceDirectory, LkbStore) {
        (ResourceDirectory::new(32), LkbStore::new())
    }

    fn make_lkb(lkbs: &LkbStore, id: LkId, rsb: RsbId, mode: Mode, flags: LockFlags) {
        lkbs.insert(Lkb::new(id, rsb, mode, flags)).unwrap();
    }

    #[test]
    fn s1_noqueue_conflict_fails_fast() {
        let (resources, lkbs) = setup();
        let rsb = resources.get_or_create(None, b"R").unwrap();

        make_lkb(&lkbs, 1, rsb, Mode::Ex, LockFlags::empty());
        let outcome = request_new(&resources, &lkbs, rsb, 1).unwrap();
        assert_eq!(outcome, Some(Outcome::Granted { lock_id: 1, mode: Mode::Ex, lvb: None }));

        make_lkb(&lkbs, 2, rsb, Mode::Ex, LockFlags::NOQUEUE);
        let outcome = request_new(&resources, &lkbs, rsb, 2).unwrap();
        assert_eq!(outcome, Some(Outcome::Failed(DlmError::NotQueued)));
    }

    #[test]
    fn s2_conversion_grants_after_competing_unlock() {
        let (resources, lkbs) = setup();
        let rsb = resources.get_or_create(None, b"R").unwrap();

        make_lkb(&lkbs, 1, rsb, Mode::Pr, LockFlags::empty());
        request_new(&resources, &lkbs, rsb, 1).unwrap();
        make_lkb(&lkbs, 2, rsb, Mode::Pr, LockFlags::empty());
        request_new(&resources, &lkbs, rsb, 2).unwrap();

        let outcome = request_convert(&resources, &lkbs, rsb, 1, Mode::Ex, LockFlags::empty(), None, None).unwrap();
        assert_eq!(outcome, None, "A's conversion should block behind B's PR grant");

        let grants = unlock(&resources, &lkbs, rsb, 2, None).unwrap();
        assert_eq!(grants, vec![Grant::Granted { lkid: 1, mode: Mode::Ex }]);
    }

    #[test]
    fn s3_disjoint_ranges_grant_immediately() {
        let (resources, lkbs) = setup();
        let rsb = resources.get_or_create(None, b"R").unwrap();

        make_lkb(&lkbs, 1, rsb, Mode::Ex, LockFlags::empty());
        lkbs.with_mut(1, |l| l.set_requested_range(0, 100)).unwrap();
        request_new(&resources, &lkbs, rsb, 1).unwrap();

        make_lkb(&lkbs, 2, rsb, Mode::Ex, LockFlags::empty());
        lkbs.with_mut(2, |l| l.set_requested_range(101, 200)).unwrap();
        let outcome = request_new(&resources, &lkbs, rsb, 2).unwrap();
        assert_eq!(outcome, Some(Outcome::Granted { lock_id: 2, mode: Mode::Ex, lvb: None }));
    }

    #[test]
    fn conversion_deadlock_demotes_most_recent_converter() {
        let (resources, lkbs) = setup();
        let rsb = resources.get_or_create(None, b"R").unwrap();

        make_lkb(&lkbs, 1, rsb, Mode::Pr, LockFlags::empty());
        request_new(&resources, &lkbs, rsb, 1).unwrap();
        make_lkb(&lkbs, 2, rsb, Mode::Pr, LockFlags::empty());
        request_new(&resources, &lkbs, rsb, 2).unwrap();

        // O1 converts PR -> EX: blocked by O2's granted PR.
        let out1 = request_convert(&resources, &lkbs, rsb, 1, Mode::Ex, LockFlags::empty(), None, None).unwrap();
        assert_eq!(out1, None);

        // O2 converts PR -> EX too: now both are mutually blocking.
        let out2 = request_convert(&resources, &lkbs, rsb, 2, Mode::Ex, LockFlags::empty(), None, None).unwrap();
        assert_eq!(out2, None);

        let grants = reevaluate(&resources, &lkbs, rsb).unwrap();
        assert!(grants.contains(&Grant::DemotedForDeadlock { lkid: 2 }), "{grants:?}");
        assert!(grants.iter().any(|g| matches!(g, Grant::Granted { lkid: 1, mode: Mode::Ex })), "{grants:?}");
    }

    #[test]
    fn conversion_deadlock_signals_instead_of_demoting_when_flagged() {
        let (resources, lkbs) = setup();
        let rsb = resources.get_or_create(None, b"R").unwrap();

        make_lkb(&lkbs, 1, rsb, Mode::Pr, LockFlags::empty());
        request_new(&resources, &lkbs, rsb, 1).unwrap();
        make_lkb(&lkbs, 2, rsb, Mode::Pr, LockFlags::CONVDEADLK);
        request_new(&resources, &lkbs, rsb, 2).unwrap();

        request_convert(&resources, &lkbs, rsb, 1, Mode::Ex, LockFlags::empty(), None, None).unwrap();
        request_convert(&resources, &lkbs, rsb, 2, Mode::Ex, LockFlags::CONVDEADLK, None, None).unwrap();

        let grants = reevaluate(&resources, &lkbs, rsb).unwrap();
        assert!(grants.contains(&Grant::SignalledDeadlock { lkid: 2 }), "{grants:?}");
    }

    #[test]
    fn noqueue_convert_conflicting_with_granted_fails_fast_even_as_first_entry() {
        let (resources, lkbs) = setup();
        let rsb = resources.get_or_create(None, b"R").unwrap();

        make_lkb(&lkbs, 1, rsb, Mode::Pr, LockFlags::empty());
        request_new(&resources, &lkbs, rsb, 1).unwrap();
        make_lkb(&lkbs, 2, rsb, Mode::Pr, LockFlags::empty());
        request_new(&resources, &lkbs, rsb, 2).unwrap();

        // O2 tries to convert PR -> EX with NOQUEUE: conflicts with O1's
        // granted PR, and is the sole entry on `convert` (idx == 0), but
        // must still fail fast rather than park forever.
        let outcome = request_convert(&resources, &lkbs, rsb, 2, Mode::Ex, LockFlags::NOQUEUE, None, None).unwrap();
        assert_eq!(outcome, Some(Outcome::Failed(DlmError::NotQueued)));

        let (granted, convert) = resources.with(rsb, |r| (r.granted.clone(), r.convert.clone())).unwrap();
        assert!(convert.is_empty(), "failed NOQUEUE conversion must not stay parked on convert");
        assert!(granted.contains(&2), "failed NOQUEUE conversion must fall back to its prior granted mode");
        assert_eq!(lkbs.with(2, |l| l.grmode).unwrap(), Some(Mode::Pr));
    }
}
