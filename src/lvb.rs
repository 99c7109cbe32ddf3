//! Lock Value Block (spec §3, §4.3): a small opaque payload attached to a
//! resource and propagated on grant.

/// Default LVB length (spec §3: "fixed length, typically 32 bytes").
pub const DEFAULT_LVB_LEN: usize = 32;

/// Opaque payload carried on a resource, plus the sequence number bumped
/// on every writer-mode downgrade/unlock (spec §4.3 "LVB semantics").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lvb {
    bytes: Vec<u8>,
    sequence: u32,
    /// Set when the LVB has never been written by a writer-mode holder,
    /// or when the last writer-mode holder left without a surviving
    /// PW/EX holder to carry its value through recovery (spec §8 S5).
    valid: bool,
}

impl Lvb {
    pub fn new(len: usize) -> Self {
        Self { bytes: vec![0u8; len], sequence: 0, valid: false }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Copy the caller's buffer into the resource LVB, truncating/zero
    /// padding to the resource's fixed length, and bump the sequence.
    pub fn write(&mut self, data: &[u8]) {
        let len = self.bytes.len();
        let n = data.len().min(len);
        self.bytes[..n].copy_from_slice(&data[..n]);
        for b in &mut self.bytes[n..] {
            *b = 0;
        }
        self.sequence = self.sequence.wrapping_add(1);
        self.valid = true;
    }

    /// Mark the LVB invalid for the next requester (spec §8 S5: no
    /// surviving writer-mode holder through recovery).
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Copy the resource LVB + sequence into a caller-supplied buffer,
    /// mirroring on grant (spec §4.3: "On grant, the resource LVB +
    /// sequence are copied back into the caller's LVB area").
    pub fn copy_into(&self, out: &mut [u8]) {
        let n = out.len().min(self.bytes.len());
        out[..n].copy_from_slice(&self.bytes[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lvb_is_invalid() {
        let lvb = Lvb::new(DEFAULT_LVB_LEN);
        assert!(!lvb.is_valid());
        assert_eq!(lvb.sequence(), 0);
    }

    #[test]
    fn write_bumps_sequence_and_marks_valid() {
        let mut lvb = Lvb::new(8);
        lvb.write(&[1, 2, 3]);
        assert!(lvb.is_valid());
        assert_eq!(lvb.sequence(), 1);
        assert_eq!(lvb.bytes(), &[1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn copy_into_respects_out_len() {
        let mut lvb = Lvb::new(8);
        lvb.write(&[9, 9, 9, 9, 9, 9, 9, 9]);
        let mut out = [0u8; 4];
        lvb.copy_into(&mut out);
        assert_eq!(out, [9, 9, 9, 9]);
    }

    #[test]
    fn invalidate_clears_validity_not_bytes() {
        let mut lvb = Lvb::new(4);
        lvb.write(&[1, 2, 3, 4]);
        lvb.invalidate();
        assert!(!lvb.is_valid());
        assert_eq!(lvb.bytes(), &[1, 2, 3, 4]);
    }
}
