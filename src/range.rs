//! Range-lock extension (spec §4.3 / §9): sub-resource byte-range
//! intersections within a lock mode.

/// A half-open... actually inclusive `[start, end]` byte range, matching
/// `original_source/dlm-kernel/src/lkb.c`'s `lkb_range[GR_RANGE_START/END]`
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    /// The default range assigned the first time an LKB becomes a range
    /// lock (`lkb.c: lkb_set_range`): the whole resource.
    pub const FULL: Range = Range { start: 0, end: u64::MAX };

    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Two ranges are disjoint (spec §4.3 rule 3: compatible if modes
    /// compatible *or* ranges disjoint).
    pub fn disjoint(&self, other: &Range) -> bool {
        self.end < other.start || other.end < self.start
    }
}
