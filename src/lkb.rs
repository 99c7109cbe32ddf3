//! Lock block (LKB): one lock request by one holder on one resource
//! (spec §3).

use bitflags::bitflags;

use crate::completion::Completion;
use crate::mode::Mode;
use crate::range::Range;

/// Stable, arena-relative id for an [`Lkb`]. Cross-references between
/// arena-owned structures (LKB, RSB, in-flight record) are ids, not raw
/// pointers/handles (spec §9 "Cyclic references").
pub type LkId = u32;

/// Stable, arena-relative id for an [`crate::rsb::Rsb`].
pub type RsbId = u32;

bitflags! {
    /// Client-supplied request flags (spec §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockFlags: u32 {
        /// Fail rather than enqueue on `wait`.
        const NOQUEUE     = 1 << 0;
        /// Signal deadlock rather than demote the most recent converter.
        const CONVDEADLK  = 1 << 1;
        /// The LVB is meaningful for this request.
        const VALBLK      = 1 << 2;
        /// Place converts at the head of the `convert` queue. Reserved
        /// for system use (spec §6); not honored for ordinary client calls.
        const EXPEDITE    = 1 << 3;
        /// Survives holder death; valid only on master copies.
        const PERSISTENT  = 1 << 4;
    }

    /// Internal LKB flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LkbFlags: u32 {
        /// This LKB is the master's copy of a remote requester's lock.
        const MSTCPY = 1 << 0;
    }
}

/// Status of an LKB within the state machine (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LkbStatus {
    /// Not attached to any resource queue.
    None,
    /// On the `wait` queue.
    Waiting,
    /// On the `convert` queue.
    Convert,
    /// On the `granted` queue.
    Granted,
}

/// One lock request by one holder on one resource (spec §3).
pub struct Lkb {
    pub id: LkId,
    pub resource: RsbId,
    /// Currently granted mode; `None` until first granted.
    pub grmode: Option<Mode>,
    /// Mode being requested (the target of the current wait/convert).
    pub rqmode: Mode,
    pub status: LkbStatus,
    pub flags: LockFlags,
    pub internal_flags: LkbFlags,
    /// Node id of the holder. 0 means the local node.
    pub owner_nodeid: u32,
    /// If this is a master copy, the requester's own lock id on its node.
    pub remote_lkid: Option<LkId>,
    /// Granted range (meaningful once the lock is a range lock).
    pub granted_range: Option<Range>,
    /// Requested range for the in-progress request/conversion.
    pub requested_range: Option<Range>,
    /// Parent LKB, for hierarchical lock groups (weak: an id, not a ref).
    pub parent: Option<LkId>,
    pub child_count: u32,
    /// Pending completion for the in-progress request, taken when fired.
    pub completion: Option<Box<dyn Completion>>,
}

impl Lkb {
    pub fn new(id: LkId, resource: RsbId, rqmode: Mode, flags: LockFlags) -> Self {
        Self {
            id,
            resource,
            grmode: None,
            rqmode,
            status: LkbStatus::None,
            flags,
            internal_flags: LkbFlags::empty(),
            owner_nodeid: 0,
            remote_lkid: None,
            granted_range: None,
            requested_range: None,
            parent: None,
            child_count: 0,
            completion: None,
        }
    }

    pub fn is_range_lock(&self) -> bool {
        self.granted_range.is_some() || self.requested_range.is_some()
    }

    /// Ensure this LKB has a range, defaulting to the whole resource the
    /// first time it becomes one (`original_source/dlm-kernel/src/lkb.c:
    /// lkb_set_range`).
    pub fn set_requested_range(&mut self, start: u64, end: u64) {
        if self.granted_range.is_none() && self.requested_range.is_none() {
            self.granted_range = Some(Range::FULL);
        }
        self.requested_range = Some(Range::new(start, end));
    }

    pub fn effective_granted_range(&self) -> Range {
        self.granted_range.unwrap_or(Range::FULL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_lkb_starts_in_none_status() {
        let lkb = Lkb::new(1, 7, Mode::Ex, LockFlags::empty());
        assert_eq!(lkb.status, LkbStatus::None);
        assert!(lkb.grmode.is_none());
    }

    #[test]
    fn set_requested_range_defaults_full_on_first_call() {
        let mut lkb = Lkb::new(1, 7, Mode::Ex, LockFlags::empty());
        lkb.set_requested_range(10, 20);
        assert_eq!(lkb.granted_range, Some(Range::FULL));
        assert_eq!(lkb.requested_range, Some(Range::new(10, 20)));
    }
}
