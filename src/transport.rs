//! Transport capability the engine dispatches frames through (spec §9
//! "Blocking connect retries with random reserved-port binding": modelled
//! as a capability, not an inline sleep loop in the engine).

use async_trait::async_trait;

use crate::error::{DlmError, DlmResult};
use crate::wire::Frame;

/// Retry policy for connecting to a peer (spec §9).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: std::time::Duration,
    pub jitter: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: std::time::Duration::from_millis(100), jitter: std::time::Duration::from_millis(50) }
    }
}

/// A framed sink to a named peer (spec §1 "a `transport` sink accepting
/// framed messages to a named peer"). Per-peer ordering is FIFO (spec
/// §4.5 "Ordering").
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame to `peer_nodeid`. Returns `Recovering` if the peer is
    /// momentarily unreachable and the caller should rely on recovery to
    /// re-arm the operation rather than retry itself.
    async fn send(&self, peer_nodeid: u32, frame: &Frame) -> DlmResult<()>;

    /// Send a frame and block for its reply. Used only by `LOOKUP`, whose
    /// caller cannot proceed without an answer (spec §4.4 "the querying
    /// node queries the directory node"). Transports that do not model a
    /// synchronous round trip (e.g. production fire-and-forget framing)
    /// may leave this unimplemented; it returns `Inval` by default.
    async fn request(&self, _peer_nodeid: u32, _frame: &Frame) -> DlmResult<Frame> {
        Err(DlmError::Inval)
    }
}

/// In-process transport used by tests and single-process deployments: a
/// direct call into a peer's dispatch handler, honoring the same
/// `Transport` contract a networked implementation would. `deliver` returns
/// the peer's reply frame, if any, which `send` applies back onto the
/// caller's own dispatch handler via `apply_reply` (modelling the wire
/// round trip synchronously); `request` returns it straight to the caller
/// for flows, like `LOOKUP`, that need the answer before proceeding.
pub struct LoopbackTransport<D, A> {
    deliver: D,
    apply_reply: A,
}

impl<D, A> LoopbackTransport<D, A>
where
    D: Fn(u32, &Frame) -> DlmResult<Option<Frame>> + Send + Sync,
    A: Fn(Frame) -> DlmResult<()> + Send + Sync,
{
    pub fn new(deliver: D, apply_reply: A) -> Self {
        Self { deliver, apply_reply }
    }
}

#[async_trait]
impl<D, A> Transport for LoopbackTransport<D, A>
where
    D: Fn(u32, &Frame) -> DlmResult<Option<Frame>> + Send + Sync,
    A: Fn(Frame) -> DlmResult<()> + Send + Sync,
{
    async fn send(&self, peer_nodeid: u32, frame: &Frame) -> DlmResult<()> {
        if let Some(reply) = (self.deliver)(peer_nodeid, frame)? {
            (self.apply_reply)(reply)?;
        }
        Ok(())
    }

    async fn request(&self, peer_nodeid: u32, frame: &Frame) -> DlmResult<Frame> {
        (self.deliver)(peer_nodeid, frame)?.ok_or(DlmError::Invariant("loopback request: peer returned no reply".into()))
    }
}

/// A transport that always reports the peer unreachable; used by recovery
/// tests to simulate a dead node.
pub struct UnreachableTransport;

#[async_trait]
impl Transport for UnreachableTransport {
    async fn send(&self, _peer_nodeid: u32, _frame: &Frame) -> DlmResult<()> {
        Err(DlmError::Recovering)
    }
}
