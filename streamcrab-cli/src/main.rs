use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use streamcrab_checkpoint::config::CheckpointCoordinatorConfig;
use streamcrab_checkpoint::coordinator::{CheckpointCoordinator, RecordingGateway};
use streamcrab_checkpoint::properties::{CheckpointRetentionPolicy, RecoveryClaimMode};
use streamcrab_checkpoint::store::{
    FsCheckpointStorage, FsCompletedCheckpointStore, read_all_metadata,
};
use streamcrab_checkpoint::strategy::RestartStrategy;
use tracing_subscriber::EnvFilter;

mod sim;

#[derive(Parser, Debug)]
#[command(name = "streamcrab")]
#[command(about = "StreamCrab checkpoint coordinator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulated job against a checkpoint directory.
    Simulate {
        #[arg(long, default_value = "./checkpoints")]
        dir: PathBuf,
        /// JSON coordinator configuration; flags below override it.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 4)]
        parallelism: usize,
        /// Stop after this many completed checkpoints.
        #[arg(long, default_value_t = 5)]
        checkpoints: u64,
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        max_concurrent: Option<usize>,
        #[arg(long)]
        retained: Option<usize>,
        #[arg(long)]
        tolerable_failures: Option<u32>,
        #[arg(long)]
        retention_policy: Option<CheckpointRetentionPolicy>,
        #[arg(long)]
        claim_mode: Option<RecoveryClaimMode>,
        /// Subtask 0 fails on its n-th checkpoint trigger.
        #[arg(long)]
        fail_after: Option<u32>,
        /// The last subtask declines its n-th checkpoint trigger.
        #[arg(long)]
        decline_after: Option<u32>,
        #[arg(long, default_value_t = 3)]
        restart_attempts: u32,
        #[arg(long, default_value_t = 100)]
        restart_delay_ms: u64,
        #[arg(long, default_value_t = 10)]
        record_interval_ms: u64,
        #[arg(long, default_value_t = 30000)]
        max_runtime_ms: u64,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List the completed checkpoints recorded in a directory.
    Inspect {
        #[arg(long, default_value = "./checkpoints")]
        dir: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Unregister a savepoint and delete its data.
    DisposeSavepoint {
        #[arg(long, default_value = "./checkpoints")]
        dir: PathBuf,
        #[arg(long)]
        id: u64,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CheckpointCoordinatorConfig> {
    let Some(path) = path else {
        return Ok(CheckpointCoordinatorConfig::default().with_interval(Duration::from_millis(200)));
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {} failed", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse config {} failed", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Simulate {
            dir,
            config,
            parallelism,
            checkpoints,
            interval_ms,
            timeout_ms,
            max_concurrent,
            retained,
            tolerable_failures,
            retention_policy,
            claim_mode,
            fail_after,
            decline_after,
            restart_attempts,
            restart_delay_ms,
            record_interval_ms,
            max_runtime_ms,
            json,
        } => {
            if parallelism == 0 {
                anyhow::bail!("parallelism must be at least 1");
            }
            let mut coordinator = load_config(config.as_deref())?;
            if let Some(ms) = interval_ms {
                coordinator = coordinator.with_interval(Duration::from_millis(ms));
            }
            if let Some(ms) = timeout_ms {
                coordinator = coordinator.with_checkpoint_timeout(Duration::from_millis(ms));
            }
            if let Some(n) = max_concurrent {
                coordinator = coordinator.with_max_concurrent_checkpoints(n);
            }
            if let Some(n) = retained {
                coordinator = coordinator.with_retained_checkpoints(n);
            }
            if let Some(n) = tolerable_failures {
                coordinator = coordinator.with_tolerable_failed_checkpoints(n);
            }
            if let Some(policy) = retention_policy {
                coordinator = coordinator.with_retention_policy(policy);
            }
            if let Some(mode) = claim_mode {
                coordinator = coordinator.with_claim_mode(mode);
            }

            let report = sim::run(sim::SimulationConfig {
                base_path: dir,
                parallelism,
                target_checkpoints: checkpoints,
                record_interval: Duration::from_millis(record_interval_ms.max(1)),
                fail_after,
                decline_after,
                restart: RestartStrategy::fixed_delay(
                    restart_attempts,
                    Duration::from_millis(restart_delay_ms),
                ),
                max_runtime: Duration::from_millis(max_runtime_ms),
                coordinator,
            })
            .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Job finished with status {}", report.job_status);
                if let Some(id) = report.restored_from {
                    println!("  restored from: {}", id);
                }
                println!("  restarts:      {}", report.restarts);
                println!(
                    "  checkpoints:   {} triggered, {} completed, {} aborted",
                    report.stats.triggered, report.stats.completed, report.stats.aborted
                );
                if let Some(reason) = &report.stats.latest_failure {
                    println!("  last failure:  {}", reason);
                }
                for info in &report.completed {
                    println!(
                        "  retained chk-{} ({}, {} tasks)",
                        info.checkpoint_id, info.properties, info.num_tasks
                    );
                }
            }
        }
        Commands::Inspect { dir, json } => {
            let checkpoints = read_all_metadata(&dir)?;
            if json {
                let infos: Vec<_> = checkpoints.iter().map(|c| c.info()).collect();
                println!("{}", serde_json::to_string_pretty(&infos)?);
            } else if checkpoints.is_empty() {
                println!("No completed checkpoints in {}", dir.display());
            } else {
                for checkpoint in &checkpoints {
                    println!(
                        "chk-{}: {} | {} tasks | {} ms{}",
                        checkpoint.checkpoint_id,
                        checkpoint.properties,
                        checkpoint.state_handles.len(),
                        checkpoint.duration_ms(),
                        checkpoint
                            .external_pointer
                            .as_deref()
                            .map(|p| format!(" | {p}"))
                            .unwrap_or_default()
                    );
                }
            }
        }
        Commands::DisposeSavepoint { dir, id } => {
            let storage = Arc::new(FsCheckpointStorage::new(&dir)?);
            let config = CheckpointCoordinatorConfig::default();
            let store =
                FsCompletedCheckpointStore::open(&dir, config.max_retained_checkpoints, storage.clone())?;
            let mut coordinator =
                CheckpointCoordinator::new(config, Box::new(store), storage, RecordingGateway::new());
            let disposed = coordinator.dispose_savepoint(id)?;
            println!(
                "Disposed savepoint {} ({})",
                disposed.checkpoint_id,
                disposed.external_pointer.as_deref().unwrap_or("no external pointer")
            );
        }
    }
    Ok(())
}
