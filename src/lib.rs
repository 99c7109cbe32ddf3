//! Distributed Lock Manager core: the resource/lock data model, the
//! grant state machine, remote mastering and dispatch, the lock-id
//! table, and the membership-change recovery protocol.
//!
//! This crate is the in-memory engine only (§6 "Persisted state: none").
//! External collaborators own durability, fencing, and the on-disk
//! filesystem that sits above a lockspace.

pub mod completion;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod inflight;
pub mod lkb;
pub mod lkb_store;
pub mod lkid;
pub mod lockspace;
pub mod master;
pub mod membership;
pub mod mode;
pub mod range;
pub mod recovery;
pub mod registry;
pub mod rsb;
pub mod state_machine;
pub mod transport;
pub mod lvb;
pub mod wire;

/// Installs a `tracing-subscriber` `fmt`/`env-filter` subscriber. Binaries
/// call this; the library itself never installs a global subscriber
/// (SPEC_FULL.md A.1).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
