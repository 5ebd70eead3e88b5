//! Runs workers inside Docker containers.
//!
//! The project directory is bind-mounted at the same path inside the
//! container so worktree, state and registry paths stay valid on both
//! sides. The image must provide the `hive` binary on its `PATH`.

use super::launcher::{Assignment, ExitOutcome, LaunchHandle, Launcher};
use crate::config::ContainerSection;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, KillContainerOptions,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

const POLL_STEP: Duration = Duration::from_millis(250);

struct RunningContainer {
    id: String,
    log_file: PathBuf,
}

pub struct ContainerLauncher {
    docker: Docker,
    settings: ContainerSection,
    running: Mutex<HashMap<String, RunningContainer>>,
}

impl ContainerLauncher {
    pub fn connect(settings: ContainerSection) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        Ok(Self {
            docker,
            settings,
            running: Mutex::new(HashMap::new()),
        })
    }

    fn container_name(assignment: &Assignment) -> String {
        format!(
            "hive-{}-{}-{}",
            assignment.feature,
            assignment.worker_id,
            Utc::now().timestamp()
        )
    }

    fn body(&self, assignment: &Assignment) -> ContainerCreateBody {
        let project = assignment.project_dir.display().to_string();
        let mut cmd = vec!["hive".to_string()];
        cmd.extend(assignment.worker_args());
        let env = assignment
            .env_vars()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        ContainerCreateBody {
            image: Some(self.settings.image.clone()),
            cmd: Some(cmd),
            env: Some(env),
            working_dir: Some(assignment.worktree.display().to_string()),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", project, project)]),
                memory: self.settings.memory_mb.map(|mb| (mb * 1024 * 1024) as i64),
                nano_cpus: self.settings.cpus.map(|c| (c * 1_000_000_000.0) as i64),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn container_id(&self, worker_id: &str) -> Result<String> {
        self.running
            .lock()
            .await
            .get(worker_id)
            .map(|c| c.id.clone())
            .ok_or_else(|| anyhow::anyhow!("No running container for worker '{}'", worker_id))
    }

    async fn exit_status(&self, id: &str) -> Result<Option<ExitOutcome>> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("Failed to inspect container {}", id))?;
        let Some(state) = info.state else {
            return Ok(None);
        };
        if state.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(match state.exit_code {
            Some(code) => ExitOutcome::code(code as i32),
            None => ExitOutcome::signaled(),
        }))
    }

    /// Copy the container's output into the worker log file.
    async fn save_logs(&self, container: &RunningContainer) -> Result<()> {
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .build();
        let mut stream = self.docker.logs(&container.id, Some(options));
        if let Some(parent) = container.log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&container.log_file)
            .with_context(|| format!("Failed to open {}", container.log_file.display()))?;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => file.write_all(&output.into_bytes())?,
                Err(e) => {
                    tracing::warn!(container = %container.id, error = %e, "Log stream ended early");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Launcher for ContainerLauncher {
    async fn launch(&self, assignment: &Assignment) -> Result<LaunchHandle> {
        let options = CreateContainerOptionsBuilder::default()
            .name(&Self::container_name(assignment))
            .build();
        let created = self
            .docker
            .create_container(Some(options), self.body(assignment))
            .await
            .with_context(|| format!("Failed to create container from {}", self.settings.image))?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", created.id))?;

        tracing::debug!(
            worker = %assignment.worker_id,
            task = %assignment.task_id,
            container = %created.id,
            "Started worker container"
        );
        self.running.lock().await.insert(
            assignment.worker_id.clone(),
            RunningContainer {
                id: created.id.clone(),
                log_file: assignment.log_file.clone(),
            },
        );
        Ok(LaunchHandle {
            worker_id: assignment.worker_id.clone(),
            task_id: assignment.task_id.clone(),
            id: created.id,
            launched_at: Utc::now(),
        })
    }

    async fn wait(&self, handle: &LaunchHandle, timeout: Duration) -> Result<Option<ExitOutcome>> {
        let id = self.container_id(&handle.worker_id).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.exit_status(&id).await? {
                return Ok(Some(outcome));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    async fn terminate(&self, handle: &LaunchHandle) -> Result<()> {
        let id = self.container_id(&handle.worker_id).await?;
        if let Err(e) = self
            .docker
            .kill_container(&id, None::<KillContainerOptions>)
            .await
        {
            tracing::debug!(container = %id, error = %e, "Kill failed, container likely exited");
        }
        Ok(())
    }

    async fn cleanup(&self, handle: &LaunchHandle) -> Result<()> {
        let Some(container) = self.running.lock().await.remove(&handle.worker_id) else {
            return Ok(());
        };
        if let Err(e) = self.save_logs(&container).await {
            tracing::warn!(container = %container.id, error = %e, "Failed to save container logs");
        }
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker
            .remove_container(&container.id, Some(options))
            .await
            .with_context(|| format!("Failed to remove container {}", container.id))?;
        Ok(())
    }
}
