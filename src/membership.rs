//! Cluster-membership abstraction the engine consumes (spec §1 "external
//! collaborators", §3 `CSB`, §4.6 recovery). The engine never talks to a
//! concrete membership plugin (`cman_sm`, `gulm`, ...); it consumes this
//! capability set instead (spec §9 "Function-pointer tables for plugin
//! modules").

use async_trait::async_trait;

/// One cluster node as this lockspace currently knows it (spec §3 `CSB`
/// "Membership / node record").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

/// A membership change event, delivered in order (spec §4.6).
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// New requests suspend; in-flight replies continue draining.
    Stop,
    /// The new member set becomes authoritative; recovery begins.
    Start { members: Vec<NodeId> },
    /// Recovery is complete; normal operation resumes.
    Finish,
}

/// Read-only per-node bookkeeping a lockspace keeps for each member (spec
/// §3 `CSB`): last-seen sequence numbers per channel role.
#[derive(Debug, Clone, Default)]
pub struct NodeRecord {
    pub node: u32,
    pub names_recv_msgid: u64,
    pub locks_recv_msgid: u64,
}

/// Event source the lockspace polls or is driven by (spec §1, §4.6).
/// A concrete implementation bridges to whatever membership plugin is
/// configured; the engine only sees this trait.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Block until the next membership event is available.
    async fn next_event(&self) -> MembershipEvent;
}

/// A [`MembershipSource`] fed by a channel, for drivers that receive
/// membership changes from an external cluster manager process rather
/// than computing them in-process (spec §1 "external collaborators").
pub struct ChannelMembershipSource {
    rx: async_channel::Receiver<MembershipEvent>,
}

impl ChannelMembershipSource {
    /// Returns the source and the sender side the cluster-manager bridge
    /// pushes events onto.
    pub fn new() -> (Self, async_channel::Sender<MembershipEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { rx }, tx)
    }
}

#[async_trait]
impl MembershipSource for ChannelMembershipSource {
    async fn next_event(&self) -> MembershipEvent {
        self.rx.recv().await.unwrap_or(MembershipEvent::Stop)
    }
}

/// Deterministic ordering of the member set used by mastering (spec §4.4
/// "deterministic hash of the resource name modulo the current ordered
/// node set"). Node ids determine the order; no tie-break randomness.
pub fn ordered(mut members: Vec<NodeId>) -> Vec<NodeId> {
    members.sort_unstable();
    members.dedup();
    members
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_sorts_and_dedups() {
        let members = vec![NodeId(3), NodeId(1), NodeId(2), NodeId(1)];
        assert_eq!(ordered(members), vec![NodeId(1), NodeId(2), NodeId(3)]);
    }

    #[tokio::test]
    async fn channel_source_delivers_pushed_events_in_order() {
        let (source, tx) = ChannelMembershipSource::new();
        tx.send(MembershipEvent::Stop).await.unwrap();
        tx.send(MembershipEvent::Start { members: vec![NodeId(1)] }).await.unwrap();
        assert!(matches!(source.next_event().await, MembershipEvent::Stop));
        assert!(matches!(source.next_event().await, MembershipEvent::Start { .. }));
    }
}
