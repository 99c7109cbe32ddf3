//! Caller-supplied asynchronous completion contract (spec §5: "the API is
//! asynchronous with a caller-supplied completion").
//!
//! Modeled on the promise-trait pattern the teacher crate uses for its own
//! network lock manager surface (`src/nlm/mod.rs::promise`): a request and
//! its eventual outcome are decoupled, so granting a blocked lock later
//! never blocks the thread that enqueued it.

use crate::error::DlmError;
use crate::lkb::LkId;
use crate::mode::Mode;

/// Outcome delivered to a lock/convert/unlock/cancel completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request was granted at the given mode. `lvb` carries the
    /// resource's current LVB bytes when the request set `VALBLK`
    /// (`None` otherwise) — the async translation of "copied into the
    /// caller's buffer": there is no live caller-owned buffer to write
    /// through once the call has crossed an await point, so the bytes
    /// ride back on the same channel the grant itself does.
    Granted { lock_id: LkId, mode: Mode, lvb: Option<Vec<u8>> },
    /// The request failed or was resolved to one of the client-visible
    /// error codes of spec §6.
    Failed(DlmError),
}

/// A caller-supplied sink for the result of exactly one lock operation.
///
/// Implementations typically wrap a `tokio::sync::oneshot::Sender` (see
/// [`OneshotCompletion`]) but the trait itself has no async-runtime
/// dependency, matching the teacher's `promise::Lock::keep(self, ...)`
/// being a plain synchronous hand-off.
pub trait Completion: Send + 'static {
    fn keep(self: Box<Self>, outcome: Outcome);
}

/// Completion backed by a tokio oneshot channel; the default used by the
/// client API in [`crate::lockspace`] and by the integration tests.
pub struct OneshotCompletion(pub tokio::sync::oneshot::Sender<Outcome>);

impl Completion for OneshotCompletion {
    fn keep(self: Box<Self>, outcome: Outcome) {
        // The receiver may have been dropped (caller stopped waiting);
        // that is not this lock's problem to report.
        let _ = self.0.send(outcome);
    }
}
