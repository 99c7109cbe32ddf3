//! Error taxonomy surfaced by the lock engine (spec §6, §7).

use thiserror::Error;

/// Convenient result alias used by all engine operations.
pub type DlmResult<T> = Result<T, DlmError>;

/// Status codes surfaced to clients, plus internal-only variants for
/// invariant violations that are logged and refused rather than panicked.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DlmError {
    /// `NOQUEUE` was requested and the lock could not be granted immediately.
    #[error("lock request could not be queued (NOQUEUE)")]
    NotQueued,

    /// The operation was cancelled by the caller.
    #[error("lock request was cancelled")]
    Cancelled,

    /// The lock was unlocked before a pending operation completed.
    #[error("lock was unlocked")]
    Unlocked,

    /// A conversion deadlock was detected and this requester was chosen to back off.
    #[error("conversion deadlock detected")]
    Deadlock,

    /// Allocation failure (lock-id table exhausted, LKB/RSB arena exhausted, ...).
    #[error("out of memory")]
    NoMem,

    /// No space for the requested operation (e.g. LVB too large).
    #[error("no space available")]
    NoSpc,

    /// Invalid argument (bad mode, malformed range, zero-length name, ...).
    #[error("invalid argument")]
    Inval,

    /// The lockspace is mid-recovery and refuses new lock operations (§7).
    #[error("lockspace is recovering")]
    Recovering,

    /// Unknown lock id.
    #[error("no such lock")]
    NoEnt,

    /// An internal invariant was violated. Logged by the caller; the
    /// lockspace continues running (§7 "Invariant violation" policy).
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}
