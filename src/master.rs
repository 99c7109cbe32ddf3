//! Mastering & directory (spec §4.4).
//!
//! Each resource has one master node across the cluster. The directory
//! node for a resource is chosen by a deterministic hash of the resource
//! name modulo the ordered member set; it either masters the resource
//! itself or remembers which node currently does. The directory is
//! purged and rebuilt on every membership change (spec §4.6 step 2).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{DlmError, DlmResult};
use crate::membership::{ordered, NodeId};

/// FNV-1a, chosen for the same reason the teacher's allocator picks a
/// simple non-cryptographic hash for bucket placement: fast, deterministic
/// across nodes given the same bytes.
fn hash_name(name: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in name {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Deterministically picks the directory node for `name` out of `members`
/// (spec §4.4). `members` need not be pre-sorted; this sorts internally so
/// two nodes with the same member set always agree (testable property 7).
pub fn directory_node(name: &[u8], members: &[NodeId]) -> DlmResult<NodeId> {
    if members.is_empty() {
        return Err(DlmError::Invariant("directory_node: empty member set".into()));
    }
    let sorted = ordered(members.to_vec());
    let idx = (hash_name(name) % sorted.len() as u64) as usize;
    Ok(sorted[idx])
}

/// Per-lockspace directory: resource name -> current master node, as
/// recorded by whichever node is this resource's directory node (spec
/// §4.4). `None` means "unset"; the next querier is elected.
#[derive(Default)]
pub struct Directory {
    masters: RwLock<HashMap<Vec<u8>, u32>>,
}

impl Directory {
    pub fn new() -> Self {
        Self { masters: RwLock::new(HashMap::new()) }
    }

    /// Look up the recorded master for `name`. `None` if unset.
    pub fn lookup(&self, name: &[u8]) -> DlmResult<Option<u32>> {
        let map = self.masters.read().map_err(|_| DlmError::Invariant("directory poisoned".into()))?;
        Ok(map.get(name).copied())
    }

    /// Record `nodeid` as master for `name`, electing it if nothing was
    /// recorded yet. Returns the node now recorded (which may be a
    /// different, earlier winner if this call lost a race).
    pub fn elect_or_get(&self, name: &[u8], candidate: u32) -> DlmResult<u32> {
        let mut map = self.masters.write().map_err(|_| DlmError::Invariant("directory poisoned".into()))?;
        Ok(*map.entry(name.to_vec()).or_insert(candidate))
    }

    /// Purge all entries (spec §4.6 step 2: "for resources mastered by a
    /// departed node, clear the master"). The caller re-populates lazily
    /// as operations re-query.
    pub fn purge(&self) -> DlmResult<()> {
        let mut map = self.masters.write().map_err(|_| DlmError::Invariant("directory poisoned".into()))?;
        map.clear();
        Ok(())
    }

    /// Clear only the entries mastered by `nodeid` (narrower than a full
    /// purge; used when just that node departs and other masters remain
    /// valid).
    pub fn clear_node(&self, nodeid: u32) -> DlmResult<()> {
        let mut map = self.masters.write().map_err(|_| DlmError::Invariant("directory poisoned".into()))?;
        map.retain(|_, master| *master != nodeid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_node_is_deterministic_across_equal_member_sets() {
        let a = vec![NodeId(3), NodeId(1), NodeId(2)];
        let b = vec![NodeId(1), NodeId(2), NodeId(3)];
        assert_eq!(directory_node(b"R", &a).unwrap(), directory_node(b"R", &b).unwrap());
    }

    #[test]
    fn elect_or_get_is_first_writer_wins() {
        let dir = Directory::new();
        assert_eq!(dir.elect_or_get(b"R", 1).unwrap(), 1);
        assert_eq!(dir.elect_or_get(b"R", 2).unwrap(), 1);
    }

    #[test]
    fn clear_node_only_removes_that_nodes_entries() {
        let dir = Directory::new();
        dir.elect_or_get(b"R1", 1).unwrap();
        dir.elect_or_get(b"R2", 2).unwrap();
        dir.clear_node(1).unwrap();
        assert_eq!(dir.lookup(b"R1").unwrap(), None);
        assert_eq!(dir.lookup(b"R2").unwrap(), Some(2));
    }

    #[test]
    fn empty_member_set_is_rejected() {
        assert!(directory_node(b"R", &[]).is_err());
    }
}
