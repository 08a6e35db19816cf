//! detection-worker: runs the policy detection engine as a long-lived process.
//!
//! Loads policies from a directory, keeps them in sync with the files through
//! a filesystem watcher, and runs the background reprocessing pipeline until
//! Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use stackwatch_core::config::load_dotenv;
use stackwatch_core::DetectionConfig;
use stackwatch_detection::loader::{PolicyEvent, PolicyLoader};
use stackwatch_detection::{Collaborators, DetectionContext};

// ── CLI ─────────────────────────────────────────────────────────────

/// Policy detection worker.
#[derive(Parser, Debug)]
#[command(name = "detection-worker", version, about)]
struct Cli {
    /// Directory of policy YAML documents.
    #[arg(long, env = "STACKWATCH_POLICY_DIR")]
    policy_dir: Option<PathBuf>,

    /// Do not watch the policy directory for changes.
    #[arg(long)]
    no_watch: bool,

    /// Load and compile the policies, print a JSON summary and exit.
    #[arg(long)]
    check: bool,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = DetectionConfig::from_env();
    if let Some(dir) = cli.policy_dir {
        config.policy_dir = dir;
    }
    config.log_summary();

    let mut loader = PolicyLoader::new(config.policy_dir.clone());
    let results = loader.load_all()?;
    let failed: Vec<String> = results
        .iter()
        .filter(|r| r.is_failed())
        .map(|r| r.path.display().to_string())
        .collect();
    info!(
        loaded = results.iter().filter(|r| r.is_loaded()).count(),
        failed = failed.len(),
        "policy directory scanned"
    );

    let (tx, mut events) = mpsc::channel(64);
    if cli.no_watch || cli.check {
        drop(tx);
    } else {
        loader.watch(tx)?;
    }
    let loader = Arc::new(loader);

    let collaborators = Collaborators::in_memory().with_policy_store(loader.clone());
    let ctx = Arc::new(DetectionContext::new(collaborators, config).await?);

    if cli.check {
        let policies: Vec<_> = ctx
            .policy_set()
            .snapshot()
            .iter()
            .map(|compiled| {
                let policy = compiled.policy();
                json!({
                    "id": policy.id,
                    "name": policy.name,
                    "lifecycleStages": policy.lifecycle_stages,
                    "disabled": policy.disabled,
                    "indexed": !compiled.query().is_empty(),
                })
            })
            .collect();
        let summary = json!({
            "policyDir": loader.policy_dir().display().to_string(),
            "installed": policies.len(),
            "failedFiles": failed,
            "policies": policies,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    ctx.start()?;

    let events_ctx = ctx.clone();
    let event_loop = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let outcome = match &event {
                PolicyEvent::Upserted(policy) => events_ctx.upsert_policy(policy),
                PolicyEvent::Removed(id) => events_ctx.remove_policy(id),
            };
            if let Err(e) = outcome {
                warn!(error = %e, "failed to apply policy file change");
            }
        }
    });

    info!("detection-worker running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    event_loop.abort();
    ctx.shutdown().await;
    info!("detection-worker exited cleanly");
    Ok(())
}
