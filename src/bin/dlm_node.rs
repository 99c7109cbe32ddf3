//! Manual/integration exercising binary for a single lockspace node
//! (SPEC_FULL.md A.3). Reads a TOML config, joins one lockspace, and
//! takes a single lock/unlock round-trip to demonstrate the local path.
//! Carries no on-disk persistence (spec §6 "Persisted state: none").

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dlm_core::config::LockspaceConfig;
use dlm_core::lockspace::oneshot_completion;
use dlm_core::mode::Mode;
use dlm_core::registry::Registry;
use dlm_core::transport::UnreachableTransport;
use dlm_core::{error::DlmResult, lkb::LockFlags};

#[derive(Parser, Debug)]
#[command(name = "dlm-node", about = "Exercise a single DLM lockspace node")]
struct Cli {
    /// Path to a lockspace config TOML file. Defaults built in if absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// This node's numeric cluster id.
    #[arg(long, default_value_t = 1)]
    nodeid: u32,

    /// Resource name to exercise a lock/unlock round-trip against.
    #[arg(long, default_value = "demo-resource")]
    resource: String,
}

#[tokio::main]
async fn main() -> DlmResult<()> {
    dlm_core::init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let src = std::fs::read_to_string(path).expect("reading config file");
            LockspaceConfig::from_toml_str(&src)?
        }
        None => LockspaceConfig::default(),
    };

    let registry = Registry::new();
    let lockspace = registry.join(&config, cli.nodeid, Arc::new(UnreachableTransport))?;

    let (completion, rx) = oneshot_completion();
    let lkid = lockspace.lock(cli.resource.as_bytes(), None, Mode::Ex, LockFlags::empty(), None, &[], completion).await?;
    let outcome = rx.await.expect("completion channel dropped");
    tracing::info!(?outcome, lkid, resource = %cli.resource, "lock round-trip complete");

    lockspace.unlock(lkid, None, &[]).await?;
    Ok(())
}
