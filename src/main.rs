use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "hive")]
#[command(version, about = "Parallel worker orchestrator for level-ordered task graphs")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory (a git repository). Defaults to the current directory.
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a task graph without running it
    Validate {
        /// Path to the task graph JSON
        tasks: PathBuf,
    },
    /// Run (or resume) a task graph
    Run {
        /// Path to the task graph JSON
        tasks: PathBuf,

        /// Feature name (defaults to the graph's `feature`, then the file name)
        #[arg(short, long)]
        feature: Option<String>,

        /// Number of worker slots
        #[arg(short, long)]
        workers: Option<usize>,

        /// Worker launcher: process, container
        #[arg(long)]
        launcher: Option<String>,

        /// Discard any existing state for the feature and start over
        #[arg(long)]
        fresh: bool,
    },
    /// Execute one assigned task (launched by the orchestrator)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long)]
        feature: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        worker: String,
        #[arg(long)]
        worktree: PathBuf,
    },
    /// Show the state of a feature run
    Status {
        #[arg(short, long)]
        feature: Option<String>,
    },
    /// Operator recovery: retry blocked tasks, a failed level merge, or
    /// reset worker slots
    Retry {
        #[arg(short, long)]
        feature: Option<String>,

        /// Reset a blocked or failed task's attempts (repeatable)
        #[arg(long = "task")]
        tasks: Vec<String>,

        /// Re-run the merge pipeline for a failed level
        #[arg(long)]
        level: Option<u32>,

        /// Close every circuit breaker and revive abandoned slots
        #[arg(long)]
        reset_workers: bool,
    },
    /// Ask a running orchestrator to stop
    Stop {
        #[arg(short, long)]
        feature: Option<String>,

        /// Kill workers instead of letting them checkpoint
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Validate { tasks } => cmd::cmd_validate(tasks)?,
        Commands::Run {
            tasks,
            feature,
            workers,
            launcher,
            fresh,
        } => {
            let opts = cmd::RunOptions {
                tasks: tasks.clone(),
                feature: feature.clone(),
                workers: *workers,
                launcher: launcher.clone(),
                fresh: *fresh,
            };
            cmd::cmd_run(&cli, project_dir, opts).await?;
        }
        Commands::Worker {
            tasks,
            feature,
            task,
            worker,
            worktree,
        } => {
            let code =
                cmd::cmd_worker(&cli, project_dir, tasks, feature, task, worker, worktree).await?;
            std::process::exit(code);
        }
        Commands::Status { feature } => cmd::cmd_status(&cli, project_dir, feature.as_deref())?,
        Commands::Retry {
            feature,
            tasks,
            level,
            reset_workers,
        } => {
            cmd::cmd_retry(
                &cli,
                project_dir,
                feature.as_deref(),
                tasks,
                *level,
                *reset_workers,
            )
            .await?;
        }
        Commands::Stop { feature, force } => {
            cmd::cmd_stop(&cli, project_dir, feature.as_deref(), *force)?
        }
    }

    Ok(())
}
