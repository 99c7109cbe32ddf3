//! Lockspace configuration (SPEC_FULL.md A.3): the tunables `spec.md`
//! leaves as constants, made configurable via `serde` + `toml` the way
//! the rest of the retrieved pack wires up its config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DlmError, DlmResult};
use crate::transport::RetryPolicy;

fn default_lockidtbl_buckets() -> usize {
    1024
}

fn default_rsb_buckets() -> usize {
    1024
}

fn default_lvb_len() -> usize {
    crate::lvb::DEFAULT_LVB_LEN
}

fn default_name() -> String {
    "default".into()
}

/// Backoff policy for transport reconnects, serialized in milliseconds
/// (spec §9 "Blocking connect retries ... `{max_attempts, base_delay, jitter}`").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_jitter_ms() -> u64 {
    50
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self { max_attempts: default_max_attempts(), base_delay_ms: default_base_delay_ms(), jitter_ms: default_jitter_ms() }
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(cfg: &RetryPolicyConfig) -> Self {
        RetryPolicy {
            max_attempts: cfg.max_attempts,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            jitter: Duration::from_millis(cfg.jitter_ms),
        }
    }
}

/// Per-lockspace tunables (spec §3 "Lockspace" attributes plus SPEC_FULL
/// ambient config). Loaded from a TOML file by the `dlm-node` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockspaceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Lock-id table bucket count; must be a power of two (spec §4.1).
    #[serde(default = "default_lockidtbl_buckets")]
    pub lockidtbl_buckets: usize,
    /// Resource directory initial bucket count (spec §4.2).
    #[serde(default = "default_rsb_buckets")]
    pub rsb_buckets: usize,
    /// LVB length in bytes, typically 32 (spec §3).
    #[serde(default = "default_lvb_len")]
    pub lvb_len: usize,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
}

impl Default for LockspaceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            lockidtbl_buckets: default_lockidtbl_buckets(),
            rsb_buckets: default_rsb_buckets(),
            lvb_len: default_lvb_len(),
            retry: RetryPolicyConfig::default(),
        }
    }
}

impl LockspaceConfig {
    pub fn from_toml_str(src: &str) -> DlmResult<Self> {
        toml::from_str(src).map_err(|e| DlmError::Invariant(format!("invalid lockspace config: {e}")))
    }
}
