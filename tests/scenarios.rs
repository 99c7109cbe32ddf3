//! End-to-end scenarios exercising two cooperating lockspace nodes, wired
//! through an in-process loopback transport that performs the full
//! `LOOKUP` / `REQUEST` / `CONVERT` / `GRANT` round trip (spec §8).

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use dlm_core::completion::Outcome;
use dlm_core::config::LockspaceConfig;
use dlm_core::error::{DlmError, DlmResult};
use dlm_core::lkb::LockFlags;
use dlm_core::lockspace::{oneshot_completion, Lockspace};
use dlm_core::master::directory_node;
use dlm_core::membership::NodeId;
use dlm_core::mode::Mode;
use dlm_core::transport::Transport;
use dlm_core::wire::Frame;

/// A direct link between two lockspaces on the same process: `send`
/// applies the peer's reply back onto the caller synchronously, and
/// `request` hands the reply straight back (used by `LOOKUP`).
struct LinkTransport {
    me: OnceLock<Weak<Lockspace>>,
    peer: OnceLock<Weak<Lockspace>>,
}

impl LinkTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self { me: OnceLock::new(), peer: OnceLock::new() })
    }
}

#[async_trait]
impl Transport for LinkTransport {
    async fn send(&self, _peer_nodeid: u32, frame: &Frame) -> DlmResult<()> {
        let peer = self.peer.get().and_then(Weak::upgrade).expect("peer not wired");
        if let Some(reply) = peer.handle_incoming(frame.clone())? {
            let me = self.me.get().and_then(Weak::upgrade).expect("self not wired");
            me.handle_incoming(reply)?;
        }
        Ok(())
    }

    async fn request(&self, _peer_nodeid: u32, frame: &Frame) -> DlmResult<Frame> {
        let peer = self.peer.get().and_then(Weak::upgrade).expect("peer not wired");
        peer.handle_incoming(frame.clone())?.ok_or_else(|| DlmError::Invariant("peer sent no reply to a request".into()))
    }
}

fn two_nodes(lockspace_name: &str) -> (Arc<Lockspace>, Arc<Lockspace>) {
    let config = LockspaceConfig { name: lockspace_name.into(), lockidtbl_buckets: 16, rsb_buckets: 16, lvb_len: 32, ..Default::default() };
    let link_a = LinkTransport::new();
    let link_b = LinkTransport::new();
    let node_a = Arc::new(Lockspace::new(&config, 1, 1, link_a.clone()).unwrap());
    let node_b = Arc::new(Lockspace::new(&config, 2, 2, link_b.clone()).unwrap());
    link_a.me.set(Arc::downgrade(&node_a)).ok().unwrap();
    link_a.peer.set(Arc::downgrade(&node_b)).ok().unwrap();
    link_b.me.set(Arc::downgrade(&node_b)).ok().unwrap();
    link_b.peer.set(Arc::downgrade(&node_a)).ok().unwrap();
    (node_a, node_b)
}

/// Find a resource name whose directory node (and, since nobody else has
/// claimed mastering yet, whose master) is `node` under this two-node
/// member set. `directory_node` is a pure deterministic hash, so this is
/// reproducible across runs.
fn name_mastered_by(node: u32, members: &[NodeId]) -> Vec<u8> {
    for i in 0u32..1000 {
        let candidate = format!("R{i}").into_bytes();
        if directory_node(&candidate, members).unwrap().0 == node {
            return candidate;
        }
    }
    panic!("no candidate resource name hashes to node {node} in range");
}

#[tokio::test]
async fn remote_noqueue_conflict_fails_fast() {
    let (node_a, node_b) = two_nodes("ls-s1");
    let members = vec![NodeId(1), NodeId(2)];
    let name = name_mastered_by(2, &members);

    // Node B masters the resource and holds it exclusively.
    let (held, held_rx) = oneshot_completion();
    let held_lkid = node_b.lock(&name, None, Mode::Ex, LockFlags::empty(), None, &members, held).await.unwrap();
    assert_eq!(held_rx.await.unwrap(), Outcome::Granted { lock_id: held_lkid, mode: Mode::Ex, lvb: None });

    // Node A asks remotely with NOQUEUE: must fail immediately, not hang
    // waiting for a GRANT that will never come.
    let (asker, asker_rx) = oneshot_completion();
    node_a.lock(&name, None, Mode::Ex, LockFlags::NOQUEUE, None, &members, asker).await.unwrap();
    let outcome = asker_rx.await.unwrap();
    assert_eq!(outcome, Outcome::Failed(DlmError::NotQueued));
}

#[tokio::test]
async fn remote_disjoint_ranges_both_grant_immediately() {
    let (node_a, node_b) = two_nodes("ls-s3");
    let members = vec![NodeId(1), NodeId(2)];
    let name = name_mastered_by(2, &members);

    let (first, first_rx) = oneshot_completion();
    node_b.lock(&name, None, Mode::Ex, LockFlags::empty(), Some((0, 99)), &members, first).await.unwrap();
    assert!(matches!(first_rx.await.unwrap(), Outcome::Granted { .. }));

    let (second, second_rx) = oneshot_completion();
    node_a.lock(&name, None, Mode::Ex, LockFlags::empty(), Some((100, 199)), &members, second).await.unwrap();
    assert!(matches!(second_rx.await.unwrap(), Outcome::Granted { .. }));
}

#[tokio::test]
async fn remote_convert_queues_then_grants_via_pushed_grant_frame() {
    let (node_a, node_b) = two_nodes("ls-convert");
    let members = vec![NodeId(1), NodeId(2)];
    let name = name_mastered_by(2, &members);

    // Node B holds CR locally (it is the master).
    let (b_completion, b_rx) = oneshot_completion();
    let b_lkid = node_b.lock(&name, None, Mode::Cr, LockFlags::empty(), None, &members, b_completion).await.unwrap();
    assert!(matches!(b_rx.await.unwrap(), Outcome::Granted { mode: Mode::Cr, .. }));

    // Node A takes CR remotely; compatible, grants immediately.
    let (a_completion, a_rx) = oneshot_completion();
    let a_lkid = node_a.lock(&name, None, Mode::Cr, LockFlags::empty(), None, &members, a_completion).await.unwrap();
    assert!(matches!(a_rx.await.unwrap(), Outcome::Granted { mode: Mode::Cr, .. }));

    // Node A converts to EX: conflicts with B's own CR, so it must queue
    // rather than resolve immediately with a bogus NL grant.
    let (convert_completion, mut convert_rx) = oneshot_completion();
    node_a.convert(a_lkid, Mode::Ex, LockFlags::empty(), None, None, &members, convert_completion).await.unwrap();
    assert!(convert_rx.try_recv().is_err(), "conversion resolved before the conflicting holder released");

    // Node B releases its CR; B's re-evaluation promotes A's queued
    // conversion and pushes a GRANT frame back to node A.
    node_b.unlock(b_lkid, None, &members).await.unwrap();
    let outcome = convert_rx.await.unwrap();
    assert_eq!(outcome, Outcome::Granted { lock_id: a_lkid, mode: Mode::Ex, lvb: None });
}

#[tokio::test]
async fn membership_start_purges_master_copies_of_departed_nodes() {
    let (node_a, node_b) = two_nodes("ls-recovery");
    let members = vec![NodeId(1), NodeId(2)];
    let name = name_mastered_by(2, &members);

    let (completion, rx) = oneshot_completion();
    node_a.lock(&name, None, Mode::Ex, LockFlags::empty(), None, &members, completion).await.unwrap();
    assert!(matches!(rx.await.unwrap(), Outcome::Granted { .. }));

    // Node A departs; node B (the master) must purge the MSTCPY it holds
    // on A's behalf without needing A to unlock first.
    node_b.on_membership_event(dlm_core::membership::MembershipEvent::Stop).await.unwrap();
    node_b
        .on_membership_event(dlm_core::membership::MembershipEvent::Start { members: vec![NodeId(2)] })
        .await
        .unwrap();
    node_b.on_membership_event(dlm_core::membership::MembershipEvent::Finish).await.unwrap();

    // The resource should now be immediately re-lockable by node B alone.
    let (completion2, rx2) = oneshot_completion();
    node_b.lock(&name, None, Mode::Ex, LockFlags::empty(), None, &[NodeId(2)], completion2).await.unwrap();
    assert!(matches!(rx2.await.unwrap(), Outcome::Granted { .. }));
}

#[tokio::test]
async fn membership_start_resends_local_locks_so_peer_relearns_them() {
    let (node_a, node_b) = two_nodes("ls-resend");
    let members = vec![NodeId(1), NodeId(2)];
    let name = name_mastered_by(1, &members);

    // Node A masters and holds this lock itself.
    let (completion, rx) = oneshot_completion();
    node_a.lock(&name, None, Mode::Ex, LockFlags::empty(), None, &members, completion).await.unwrap();
    assert!(matches!(rx.await.unwrap(), Outcome::Granted { .. }));

    // A full membership rebuild with no departures: node A's own NAMES/LOCKS
    // passes must run and get acked before `finish` can succeed, and node B
    // must come out of it knowing about A's lock.
    node_a.on_membership_event(dlm_core::membership::MembershipEvent::Stop).await.unwrap();
    node_a.on_membership_event(dlm_core::membership::MembershipEvent::Start { members: members.clone() }).await.unwrap();
    node_a.on_membership_event(dlm_core::membership::MembershipEvent::Finish).await.unwrap();

    let learned = node_b.has_remote_lock_on(&name, NodeId(1));
    assert!(learned, "node B should have learned A's lock via the LOCKS resend pass");
}
