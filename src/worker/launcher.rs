//! Launching worker processes.
//!
//! A [`Launcher`] starts one `hive worker` invocation per assignment and
//! tracks the running process by worker id. The orchestrator never blocks on
//! a worker: it polls with [`Launcher::wait`] and a zero timeout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Everything a worker process needs to run one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub worker_id: String,
    pub task_id: String,
    pub feature: String,
    pub level: u32,
    pub project_dir: PathBuf,
    pub tasks_file: PathBuf,
    pub worktree: PathBuf,
    pub branch: String,
    pub log_file: PathBuf,
    pub checkpoint: Option<String>,
}

impl Assignment {
    /// Arguments for the `hive worker` subcommand.
    pub fn worker_args(&self) -> Vec<String> {
        vec![
            "--project".to_string(),
            self.project_dir.display().to_string(),
            "worker".to_string(),
            "--tasks".to_string(),
            self.tasks_file.display().to_string(),
            "--feature".to_string(),
            self.feature.clone(),
            "--task".to_string(),
            self.task_id.clone(),
            "--worker".to_string(),
            self.worker_id.clone(),
            "--worktree".to_string(),
            self.worktree.display().to_string(),
        ]
    }

    /// Environment exported to the worker and to the commands it runs.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("HIVE_FEATURE".to_string(), self.feature.clone()),
            ("HIVE_TASK_ID".to_string(), self.task_id.clone()),
            ("HIVE_WORKER_ID".to_string(), self.worker_id.clone()),
            ("HIVE_LEVEL".to_string(), self.level.to_string()),
            ("HIVE_BRANCH".to_string(), self.branch.clone()),
        ];
        if let Some(checkpoint) = &self.checkpoint {
            env.push(("HIVE_CHECKPOINT".to_string(), checkpoint.clone()));
        }
        env
    }
}

/// A launched worker, as returned by [`Launcher::launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchHandle {
    pub worker_id: String,
    pub task_id: String,
    /// Process id or container id
    pub id: String,
    pub launched_at: DateTime<Utc>,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            exit_code: Some(code),
        }
    }

    pub fn signaled() -> Self {
        Self { exit_code: None }
    }
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, assignment: &Assignment) -> Result<LaunchHandle>;

    /// Wait up to `timeout` for the worker to exit. `Ok(None)` means it is
    /// still running.
    async fn wait(&self, handle: &LaunchHandle, timeout: Duration) -> Result<Option<ExitOutcome>>;

    /// Kill the worker immediately.
    async fn terminate(&self, handle: &LaunchHandle) -> Result<()>;

    /// Release anything still held for an exited worker.
    async fn cleanup(&self, handle: &LaunchHandle) -> Result<()>;
}

/// Runs workers as local child processes of the orchestrator.
pub struct ProcessLauncher {
    program: PathBuf,
    running: Arc<Mutex<HashMap<String, Child>>>,
}

impl ProcessLauncher {
    /// Launch workers with `program`, normally the current `hive` binary.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate the hive executable")?;
        Ok(Self::new(program))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, assignment: &Assignment) -> Result<LaunchHandle> {
        if let Some(parent) = assignment.log_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&assignment.log_file)
            .with_context(|| format!("Failed to open {}", assignment.log_file.display()))?;
        let err_log = log.try_clone().context("Failed to clone worker log handle")?;

        let child = Command::new(&self.program)
            .args(assignment.worker_args())
            .envs(assignment.env_vars())
            .current_dir(&assignment.worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;

        let pid = child
            .id()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "exited".to_string());
        tracing::debug!(
            worker = %assignment.worker_id,
            task = %assignment.task_id,
            pid = %pid,
            "Spawned worker process"
        );
        self.running
            .lock()
            .await
            .insert(assignment.worker_id.clone(), child);

        Ok(LaunchHandle {
            worker_id: assignment.worker_id.clone(),
            task_id: assignment.task_id.clone(),
            id: pid,
            launched_at: Utc::now(),
        })
    }

    async fn wait(&self, handle: &LaunchHandle, timeout: Duration) -> Result<Option<ExitOutcome>> {
        let mut running = self.running.lock().await;
        let Some(child) = running.get_mut(&handle.worker_id) else {
            anyhow::bail!("No running process for worker '{}'", handle.worker_id);
        };
        let status = if timeout.is_zero() {
            child.try_wait()?
        } else {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => Some(status?),
                Err(_) => None,
            }
        };
        Ok(status.map(|s| match s.code() {
            Some(code) => ExitOutcome::code(code),
            None => ExitOutcome::signaled(),
        }))
    }

    async fn terminate(&self, handle: &LaunchHandle) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(child) = running.get_mut(&handle.worker_id) {
            child.start_kill().ok();
            let _ = child.wait().await;
        }
        Ok(())
    }

    async fn cleanup(&self, handle: &LaunchHandle) -> Result<()> {
        self.running.lock().await.remove(&handle.worker_id);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn assignment(dir: &std::path::Path) -> Assignment {
        Assignment {
            worker_id: "worker-0".to_string(),
            task_id: "T1".to_string(),
            feature: "auth".to_string(),
            level: 1,
            project_dir: dir.to_path_buf(),
            tasks_file: dir.join("tasks.json"),
            worktree: dir.to_path_buf(),
            branch: "hive/auth/worker-0".to_string(),
            log_file: dir.join("logs").join("worker-0.log"),
            checkpoint: Some("halfway".to_string()),
        }
    }

    #[test]
    fn test_worker_args_and_env() {
        let dir = tempdir().unwrap();
        let a = assignment(dir.path());
        let args = a.worker_args();
        assert_eq!(args[2], "worker");
        assert!(args.windows(2).any(|w| w[0] == "--task" && w[1] == "T1"));
        let env = a.env_vars();
        assert!(env.contains(&("HIVE_TASK_ID".to_string(), "T1".to_string())));
        assert!(env.contains(&("HIVE_CHECKPOINT".to_string(), "halfway".to_string())));
    }

    #[tokio::test]
    async fn test_process_launcher_reports_exit_code() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("fake-hive.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"running $HIVE_TASK_ID\"\nexit 2\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let launcher = ProcessLauncher::new(script);
        let a = assignment(dir.path());
        let handle = launcher.launch(&a).await.unwrap();
        let outcome = launcher
            .wait(&handle, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, Some(ExitOutcome::code(2)));
        launcher.cleanup(&handle).await.unwrap();

        let log = std::fs::read_to_string(&a.log_file).unwrap();
        assert!(log.contains("running T1"));
    }

    #[tokio::test]
    async fn test_process_launcher_terminate() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("slow.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let launcher = ProcessLauncher::new(script);
        let handle = launcher.launch(&assignment(dir.path())).await.unwrap();
        assert_eq!(launcher.wait(&handle, Duration::ZERO).await.unwrap(), None);
        launcher.terminate(&handle).await.unwrap();
        let outcome = launcher.wait(&handle, Duration::ZERO).await.unwrap();
        assert!(outcome.is_some());
    }
}
