//! The worker-process side of an assignment (`hive worker`).
//!
//! A worker runs exactly one task in its slot's worktree: it heartbeats
//! into the state store, runs the configured task command and the task's
//! verification, commits the result and publishes it, registry first. A
//! stop request makes it commit partial work as a checkpoint and exit.

use super::{EXIT_CHECKPOINT, EXIT_COMPLETED, EXIT_FAILED, EXIT_INFRA};
use crate::errors::StateError;
use crate::graph::Task;
use crate::merge::vcs::{clean_worktree, commit_all};
use crate::state::{StateStore, TaskStatus};
use crate::sync::StateSyncService;
use crate::util::run_shell;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DETAIL_LIMIT: usize = 2_000;

pub struct WorkerRun {
    pub worker_id: String,
    pub task: Task,
    pub worktree: PathBuf,
    /// Shell command that performs the task before verification
    pub command: Option<String>,
    pub heartbeat_interval: Duration,
    pub task_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Passed,
    Failed(String),
    Stopped,
}

pub struct WorkerRunner {
    store: StateStore,
    sync: StateSyncService,
    run: WorkerRun,
}

impl WorkerRunner {
    pub fn new(store: StateStore, sync: StateSyncService, run: WorkerRun) -> Self {
        Self { store, sync, run }
    }

    /// Run the task and return the process exit code.
    pub async fn run(self) -> i32 {
        let (stop_tx, stop_rx) = watch::channel(false);
        let heartbeat = self.spawn_heartbeat(stop_tx);
        let code = match self.execute(stop_rx).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(task = %self.run.task.id, error = %format!("{:#}", e), "Worker failed");
                self.record_error(&format!("{:#}", e));
                EXIT_INFRA
            }
        };
        heartbeat.abort();
        code
    }

    fn spawn_heartbeat(&self, stop_tx: watch::Sender<bool>) -> JoinHandle<()> {
        let store = self.store.clone();
        let worker_id = self.run.worker_id.clone();
        let period = self.run.heartbeat_interval.max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match store.heartbeat(&worker_id) {
                    Ok(true) => {
                        let _ = stop_tx.send(true);
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(worker = %worker_id, error = %e, "Heartbeat failed"),
                }
            }
        })
    }

    async fn execute(&self, mut stop: watch::Receiver<bool>) -> Result<i32> {
        let task = &self.run.task;
        let checkpoint = self.claimed_checkpoint()?;
        clean_worktree(&self.run.worktree).context("Failed to clean worktree")?;
        let env = self.task_env(checkpoint.as_deref());
        tracing::info!(task = %task.id, worker = %self.run.worker_id, "Starting task");

        if let Some(command) = &self.run.command {
            let step = self
                .step(command, self.run.task_timeout, &env, &mut stop)
                .await?;
            if let Some(code) = self.finish_step(step).await? {
                return Ok(code);
            }
        }

        let verification = self
            .step(
                &task.verification.command,
                task.verification.timeout(),
                &env,
                &mut stop,
            )
            .await?;
        if let Some(code) = self.finish_step(verification).await? {
            return Ok(code);
        }

        let commit = commit_all(
            &self.run.worktree,
            &format!("hive({}): {}", task.id, task.title),
        )?;
        self.sync
            .publish_as(&task.id, TaskStatus::Completed)
            .await?;
        self.store.complete_task(&task.id, &self.run.worker_id)?;
        tracing::info!(task = %task.id, commit = ?commit, "Task completed");
        Ok(EXIT_COMPLETED)
    }

    /// Exit code if the step ends the run.
    async fn finish_step(&self, step: Step) -> Result<Option<i32>> {
        match step {
            Step::Passed => Ok(None),
            Step::Failed(detail) => {
                tracing::warn!(task = %self.run.task.id, detail = %detail, "Task step failed");
                self.record_error(&detail);
                Ok(Some(EXIT_FAILED))
            }
            Step::Stopped => self.checkpoint().await.map(Some),
        }
    }

    async fn step(
        &self,
        command: &str,
        limit: Duration,
        env: &[(String, String)],
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Step> {
        if *stop.borrow() {
            return Ok(Step::Stopped);
        }
        tokio::select! {
            outcome = run_shell(command, &self.run.worktree, env, limit) => {
                let outcome = outcome?;
                Ok(if outcome.success() {
                    Step::Passed
                } else {
                    Step::Failed(outcome.failure_detail(DETAIL_LIMIT))
                })
            }
            _ = stop_requested(stop) => Ok(Step::Stopped),
        }
    }

    async fn checkpoint(&self) -> Result<i32> {
        let task = &self.run.task;
        let commit = commit_all(
            &self.run.worktree,
            &format!("hive({}): checkpoint", task.id),
        )?;
        let note = match &commit {
            Some(sha) => format!("partial work committed at {}", sha),
            None => "stopped before any changes".to_string(),
        };
        self.sync.publish_as(&task.id, TaskStatus::Paused).await?;
        self.store
            .pause_task(&task.id, &self.run.worker_id, Some(&note), commit.as_deref())?;
        tracing::info!(task = %task.id, note = %note, "Checkpointed task");
        Ok(EXIT_CHECKPOINT)
    }

    /// The task must be in progress and owned by this worker. Returns the
    /// checkpoint note left by a previous run.
    fn claimed_checkpoint(&self) -> Result<Option<String>> {
        let task_id = &self.run.task.id;
        let worker_id = &self.run.worker_id;
        self.store
            .read(|snap| {
                let record = snap.task(task_id)?;
                if record.status != TaskStatus::InProgress
                    || record.worker_id.as_deref() != Some(worker_id.as_str())
                {
                    return Err(StateError::Rejected(format!(
                        "Task '{}' is {} and owned by {:?}, not claimed by '{}'",
                        task_id, record.status, record.worker_id, worker_id
                    )));
                }
                Ok(record.checkpoint.clone())
            })?
            .map_err(Into::into)
    }

    fn task_env(&self, checkpoint: Option<&str>) -> Vec<(String, String)> {
        let task = &self.run.task;
        let files: Vec<String> = task.files.owned().into_iter().collect();
        let mut env = vec![
            ("HIVE_TASK_ID".to_string(), task.id.clone()),
            ("HIVE_TASK_TITLE".to_string(), task.title.clone()),
            ("HIVE_TASK_LEVEL".to_string(), task.level.to_string()),
            ("HIVE_TASK_FILES".to_string(), files.join(",")),
            ("HIVE_WORKER_ID".to_string(), self.run.worker_id.clone()),
            ("HIVE_FEATURE".to_string(), self.store.feature().to_string()),
        ];
        if let Some(description) = &task.description {
            env.push(("HIVE_TASK_DESCRIPTION".to_string(), description.clone()));
        }
        if let Some(checkpoint) = checkpoint {
            env.push(("HIVE_CHECKPOINT".to_string(), checkpoint.to_string()));
        }
        env
    }

    fn record_error(&self, detail: &str) {
        let task_id = &self.run.task.id;
        let result = self.store.transaction(|snap| {
            snap.task_mut(task_id)?.error = Some(detail.to_string());
            Ok::<_, StateError>(())
        });
        if let Err(e) = result {
            tracing::warn!(task = %task_id, error = %e, "Failed to record task error");
        }
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LevelResolver;
    use crate::merge::vcs::test_support::init_repo;
    use crate::state::StopMode;
    use crate::sync::{InMemoryRegistry, TaskRegistry};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Fixture {
        store: StateStore,
        sync: StateSyncService,
        registry: Arc<InMemoryRegistry>,
    }

    async fn fixture(state_dir: &Path, task: &Task) -> Fixture {
        let graph = LevelResolver::new(vec![task.clone()]).resolve().unwrap();
        let store = StateStore::open(state_dir, "feat").unwrap();
        store.initialize(&graph).unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        let sync = StateSyncService::new(store.clone(), registry.clone());
        sync.ensure_registered(&graph).await.unwrap();
        store.claim_task(&task.id, "worker-0").unwrap();
        Fixture {
            store,
            sync,
            registry,
        }
    }

    fn run(worktree: &Path, task: Task, command: Option<&str>) -> WorkerRun {
        WorkerRun {
            worker_id: "worker-0".to_string(),
            task,
            worktree: worktree.to_path_buf(),
            command: command.map(str::to_string),
            heartbeat_interval: Duration::from_millis(100),
            task_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_successful_task_commits_and_completes() {
        let repo_dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let task = Task::new("T1", "write hello", 1, vec![])
            .with_files(&["hello.txt"], &[])
            .with_verification("test -f hello.txt", 10);
        let fx = fixture(state_dir.path(), &task).await;

        let runner = WorkerRunner::new(
            fx.store.clone(),
            fx.sync.clone(),
            run(repo_dir.path(), task, Some("echo \"$HIVE_TASK_ID\" > hello.txt")),
        );
        assert_eq!(runner.run().await, EXIT_COMPLETED);

        let snap = fx.store.snapshot().unwrap();
        assert_eq!(snap.tasks["T1"].status, TaskStatus::Completed);
        let id = snap.tasks["T1"].registry_id.clone().unwrap();
        let remote = fx.registry.get(&id).await.unwrap().unwrap();
        assert_eq!(remote.status, TaskStatus::Completed);

        let content = std::fs::read_to_string(repo_dir.path().join("hello.txt")).unwrap();
        assert_eq!(content.trim(), "T1");
        let repo = git2::Repository::open(repo_dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.message(), Some("hive(T1): write hello"));
    }

    #[tokio::test]
    async fn test_failed_verification_records_error() {
        let repo_dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let task = Task::new("T1", "broken", 1, vec![])
            .with_verification("echo 'assertion failed' >&2; exit 1", 10);
        let fx = fixture(state_dir.path(), &task).await;

        let runner = WorkerRunner::new(fx.store.clone(), fx.sync.clone(), run(repo_dir.path(), task, None));
        assert_eq!(runner.run().await, EXIT_FAILED);

        let snap = fx.store.snapshot().unwrap();
        assert_eq!(snap.tasks["T1"].status, TaskStatus::InProgress);
        assert_eq!(
            snap.tasks["T1"].error.as_deref(),
            Some("exit 1: assertion failed")
        );
    }

    #[tokio::test]
    async fn test_stop_request_checkpoints() {
        let repo_dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let task = Task::new("T1", "slow", 1, vec![]).with_files(&["part.txt"], &[]);
        let fx = fixture(state_dir.path(), &task).await;
        fx.store.request_stop(StopMode::Graceful).unwrap();

        let runner = WorkerRunner::new(
            fx.store.clone(),
            fx.sync.clone(),
            run(repo_dir.path(), task, Some("echo partial > part.txt; sleep 20")),
        );
        assert_eq!(runner.run().await, EXIT_CHECKPOINT);

        let snap = fx.store.snapshot().unwrap();
        assert_eq!(snap.tasks["T1"].status, TaskStatus::Paused);
        assert!(snap.tasks["T1"].worker_id.is_none());
        assert!(snap.tasks["T1"].checkpoint.is_some());
    }

    #[tokio::test]
    async fn test_unclaimed_task_is_refused() {
        let repo_dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let task = Task::new("T1", "t", 1, vec![]);
        let fx = fixture(state_dir.path(), &task).await;
        fx.store.release_task("T1", "test").unwrap();

        let runner = WorkerRunner::new(fx.store.clone(), fx.sync.clone(), run(repo_dir.path(), task, None));
        assert_eq!(runner.run().await, EXIT_INFRA);
    }
}
