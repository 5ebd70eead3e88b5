//! Operator controls for a recorded run: `hive retry` and `hive stop`.

use anyhow::Result;
use console::style;
use hive::circuit::CircuitBreaker;
use hive::errors::StateError;
use hive::logging::{self, LogSettings};
use hive::merge::{GateRunner, GitVcs, MergeCoordinator};
use hive::retry::TaskRetryManager;
use hive::state::{StopMode, WorkerStatus};
use hive::sync::{JsonFileRegistry, StateSyncService};
use std::path::PathBuf;
use std::sync::Arc;

use super::super::Cli;

pub async fn cmd_retry(
    cli: &Cli,
    project_dir: PathBuf,
    feature: Option<&str>,
    tasks: &[String],
    level: Option<u32>,
    reset_workers: bool,
) -> Result<()> {
    if tasks.is_empty() && level.is_none() && !reset_workers {
        anyhow::bail!("Nothing to retry; pass --task, --level or --reset-workers");
    }
    let config = super::load_config(cli, project_dir)?;
    let _log_guard = logging::init(&LogSettings::from_config(&config).stderr_only())?;
    let feature = super::resolve_feature(&config, feature)?;
    let store = super::open_existing(&config, &feature)?;

    if !tasks.is_empty() {
        let retry = TaskRetryManager::new(
            store.clone(),
            config.toml.retry.to_policy(),
            config.toml.backpressure.to_policy(),
        );
        let registry = Arc::new(JsonFileRegistry::open(&config.registry_file())?);
        let sync = StateSyncService::new(store.clone(), registry);
        for task in tasks {
            retry.force_retry(task)?;
            // The registry wins reconciliation, so it has to hear about the reset.
            sync.publish(task).await?;
            println!("{} {} reset to pending", style("↺").yellow(), task);
        }
    }

    if reset_workers {
        let circuit = CircuitBreaker::new(store.clone(), config.toml.circuit_breaker.to_policy());
        let closed = circuit.reset_all()?;
        let revived = store.transaction(|snap| {
            let mut revived = 0;
            for worker in snap.workers.values_mut() {
                if worker.abandoned {
                    revived += 1;
                }
                worker.abandoned = false;
                worker.restarts = 0;
                worker.consecutive_stalls = 0;
                if worker.status == WorkerStatus::Crashed {
                    worker.status = WorkerStatus::Stopped;
                }
            }
            Ok::<_, StateError>(revived)
        })?;
        println!(
            "{} closed {} circuit(s), revived {} abandoned slot(s)",
            style("↺").yellow(),
            closed,
            revived
        );
    }

    if let Some(level) = level {
        let vcs = GitVcs::open(
            &config.project_dir,
            &feature,
            config.toml.merge.base_branch.clone(),
            config.worktree_dir(&feature),
        )?;
        let registry = Arc::new(JsonFileRegistry::open(&config.registry_file())?);
        let merge = MergeCoordinator::new(
            store.clone(),
            Arc::new(vcs),
            GateRunner::new(config.toml.gates.clone()),
        )
        .with_sync(StateSyncService::new(store.clone(), registry));
        let record = merge.retry_level(level).await?;
        let commit = record.merge_commit.as_deref().unwrap_or("no changes");
        println!(
            "{}",
            style(format!("Level {} merged ({})", level, commit)).green().bold()
        );
    }

    println!("Resume with 'hive run <tasks.json> --feature {}'.", feature);
    Ok(())
}

pub fn cmd_stop(cli: &Cli, project_dir: PathBuf, feature: Option<&str>, force: bool) -> Result<()> {
    let config = super::load_config(cli, project_dir)?;
    let feature = super::resolve_feature(&config, feature)?;
    let store = super::open_existing(&config, &feature)?;
    let mode = if force {
        StopMode::Force
    } else {
        StopMode::Graceful
    };
    store.request_stop(mode)?;

    if force {
        println!("{}", style("Forced stop requested.").red());
        println!("Workers will be killed and in-flight tasks marked failed.");
    } else {
        println!("{}", style("Stop requested.").yellow());
        println!("Workers will checkpoint their tasks before exiting.");
    }
    println!();
    println!("Use 'hive status' to check progress.");
    Ok(())
}
