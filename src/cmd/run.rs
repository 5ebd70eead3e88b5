//! Task graph validation, orchestrated runs and the worker entry point.

use anyhow::{Context, Result};
use console::style;
use hive::config::{HiveConfig, LauncherKind};
use hive::errors::ValidationError;
use hive::graph::{self, TaskGraph};
use hive::logging::{self, LogSettings};
use hive::merge::GitVcs;
use hive::orchestrator::{Orchestrator, OrchestratorSettings, RunEvent};
use hive::state::StateStore;
use hive::sync::{JsonFileRegistry, StateSyncService};
use hive::worker::{ContainerLauncher, Launcher, ProcessLauncher, WorkerRun, WorkerRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::super::Cli;

pub struct RunOptions {
    pub tasks: PathBuf,
    pub feature: Option<String>,
    pub workers: Option<usize>,
    pub launcher: Option<String>,
    pub fresh: bool,
}

fn load_graph(path: &Path) -> Result<(Option<String>, TaskGraph)> {
    match graph::load(path) {
        Ok(loaded) => Ok(loaded),
        Err(e @ ValidationError::Invalid(_)) => {
            let offending = e.offending_tasks();
            if !offending.is_empty() {
                eprintln!(
                    "{} {}",
                    style("Offending tasks:").red().bold(),
                    offending.join(", ")
                );
            }
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

pub fn cmd_validate(tasks: &Path) -> Result<()> {
    let (feature, graph) = load_graph(tasks)?;

    println!();
    println!(
        "{} {} ({} tasks)",
        style("Valid task graph:").green().bold(),
        tasks.display(),
        graph.len()
    );
    if let Some(feature) = feature {
        println!("Feature: {}", feature);
    }
    for level in graph.levels() {
        let ids: Vec<&str> = graph.tasks_at(level).iter().map(|t| t.id.as_str()).collect();
        println!("  Level {}: {}", level, ids.join(", "));
    }
    println!();
    Ok(())
}

fn feature_name(explicit: Option<String>, declared: Option<String>, tasks: &Path) -> Result<String> {
    explicit
        .or(declared)
        .or_else(|| {
            tasks
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .context("Cannot derive a feature name; pass --feature")
}

fn build_launcher(config: &HiveConfig) -> Result<Arc<dyn Launcher>> {
    Ok(match config.launcher() {
        LauncherKind::Process => Arc::new(ProcessLauncher::current_exe()?),
        LauncherKind::Container => Arc::new(ContainerLauncher::connect(
            config.toml.worker.container.clone(),
        )?),
    })
}

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf, opts: RunOptions) -> Result<()> {
    let launcher_kind = opts
        .launcher
        .as_deref()
        .map(str::parse::<LauncherKind>)
        .transpose()?;
    let config = HiveConfig::with_cli_args(project_dir, cli.verbose, opts.workers, launcher_kind)?;
    config.validate()?;
    let _log_guard = logging::init(&LogSettings::from_config(&config))?;

    // Validation runs to completion before anything is launched.
    let (declared, graph) = load_graph(&opts.tasks)?;
    let feature = feature_name(opts.feature, declared, &opts.tasks)?;
    let tasks_file = opts
        .tasks
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", opts.tasks.display()))?;

    if opts.fresh {
        StateStore::open(&config.state_dir(), &feature)?.reset()?;
        tracing::info!(feature = %feature, "Discarded previous state");
    }

    let registry = Arc::new(JsonFileRegistry::open(&config.registry_file())?);
    let vcs = Arc::new(GitVcs::open(
        &config.project_dir,
        &feature,
        config.toml.merge.base_branch.clone(),
        config.worktree_dir(&feature),
    )?);
    let launcher = build_launcher(&config)?;
    let settings = OrchestratorSettings::from_config(&config, &feature, tasks_file);

    println!();
    println!(
        "{} '{}': {} tasks in {} levels, {} workers",
        style("Running feature").cyan().bold(),
        feature,
        graph.len(),
        graph.levels().len(),
        settings.workers
    );

    let (tx, rx) = mpsc::channel(256);
    let printer = tokio::spawn(print_events(rx));
    let mut orchestrator =
        Orchestrator::new(&config, settings, graph, launcher, vcs, registry)?.with_event_channel(tx);
    let result = orchestrator.run().await;
    drop(orchestrator);
    let _ = printer.await;
    let report = result?;

    println!();
    print!("{}", report);
    println!();
    if !report.success() {
        anyhow::bail!("Feature '{}' {}", feature, report.outcome);
    }
    Ok(())
}

async fn print_events(mut rx: mpsc::Receiver<RunEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::Resumed { level } => {
                let at = level.map(|l| format!(" at level {}", l)).unwrap_or_default();
                println!("{}", style(format!("Resuming existing run{}", at)).yellow());
            }
            RunEvent::TaskDispatched { task, worker } => {
                println!("  {} {} -> {}", style("▶").cyan(), task, worker);
            }
            RunEvent::TaskCompleted { task } => {
                println!("  {} {}", style("✓").green(), task);
            }
            RunEvent::TaskFailed {
                task,
                error,
                blocked,
            } => {
                let label = if blocked { "blocked" } else { "failed" };
                println!("  {} {} {}: {}", style("✗").red(), task, label, error);
            }
            RunEvent::TaskPaused { task } => {
                println!("  {} {} checkpointed", style("⏸").yellow(), task);
            }
            RunEvent::TaskReassigned { task, reason } => {
                println!("  {} {} reassigned ({})", style("↺").yellow(), task, reason);
            }
            RunEvent::WorkerAbandoned { worker } => {
                println!("  {} {} abandoned", style("!").red().bold(), worker);
            }
            RunEvent::LevelMerged { level, commit } => {
                let short = commit
                    .as_deref()
                    .map(|c| &c[..c.len().min(10)])
                    .unwrap_or("no changes");
                println!(
                    "{}",
                    style(format!("Level {} merged ({})", level, short)).green().bold()
                );
            }
            RunEvent::LevelFailed { level, reason } => {
                println!(
                    "{}",
                    style(format!("Level {} failed: {}", level, reason)).red().bold()
                );
            }
            RunEvent::Stopping { mode } => {
                println!("{}", style(format!("Stopping ({:?})...", mode)).yellow());
            }
        }
    }
}

/// Entry point of a worker process. Returns the process exit code.
pub async fn cmd_worker(
    cli: &Cli,
    project_dir: PathBuf,
    tasks: &Path,
    feature: &str,
    task_id: &str,
    worker_id: &str,
    worktree: &Path,
) -> Result<i32> {
    let config = super::load_config(cli, project_dir)?;
    let _log_guard = logging::init(&LogSettings::from_config(&config).stderr_only())?;

    let (_, graph) = graph::load(tasks)?;
    let task = graph
        .get(task_id)
        .cloned()
        .with_context(|| format!("Task '{}' is not in {}", task_id, tasks.display()))?;
    let store = super::open_existing(&config, feature)?;
    let registry = Arc::new(JsonFileRegistry::open(&config.registry_file())?);
    let sync = StateSyncService::new(store.clone(), registry);

    let run = WorkerRun {
        worker_id: worker_id.to_string(),
        task,
        worktree: worktree.to_path_buf(),
        command: config.toml.worker.command.clone(),
        heartbeat_interval: config.toml.worker.heartbeat_interval(),
        task_timeout: config.toml.worker.task_timeout(),
    };
    Ok(WorkerRunner::new(store, sync, run).run().await)
}
