use super::health::{self, Health, HealthPolicy};
use super::launcher::{Assignment, LaunchHandle, Launcher};
use super::{EXIT_CHECKPOINT, EXIT_COMPLETED};
use crate::circuit::CircuitBreaker;
use crate::config::WorkerSection;
use crate::errors::{StateError, WorkerError};
use crate::state::{EventKind, StateStore, WorkerStatus};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub health: HealthPolicy,
    pub max_restarts: u32,
    /// A failing exit sooner than this after launch counts against the
    /// worker's circuit
    pub immediate_failure: Duration,
    pub task_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(section: &WorkerSection) -> Self {
        Self {
            health: HealthPolicy {
                grace_secs: section.heartbeat_grace_secs,
                max_stalls: section.max_stalls,
            },
            max_restarts: section.max_restarts,
            immediate_failure: Duration::from_secs(section.immediate_failure_secs),
            task_timeout: section.task_timeout(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&WorkerSection::default())
    }
}

/// How a worker's run of a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Checkpointed,
    Failed {
        exit_code: Option<i32>,
        immediate: bool,
    },
    TimedOut {
        after_secs: u64,
    },
    /// Missed heartbeats until declared crashed. `abandoned` is set once the
    /// slot has used up its restarts.
    Crashed {
        reason: String,
        abandoned: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker_id: String,
    pub task_id: String,
    pub outcome: WorkerOutcome,
}

/// Owns the worker slots of one orchestrator: launches workers through a
/// [`Launcher`], reaps them, watches their heartbeats and restarts or
/// abandons slots that keep crashing.
pub struct WorkerManager {
    store: StateStore,
    circuit: CircuitBreaker,
    launcher: Arc<dyn Launcher>,
    settings: WorkerSettings,
    handles: BTreeMap<String, LaunchHandle>,
}

impl WorkerManager {
    pub fn new(
        store: StateStore,
        circuit: CircuitBreaker,
        launcher: Arc<dyn Launcher>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            circuit,
            launcher,
            settings,
            handles: BTreeMap::new(),
        }
    }

    pub fn slot_id(index: usize) -> String {
        format!("worker-{}", index)
    }

    /// Make sure `count` slots exist in the snapshot. Slots left active by a
    /// previous orchestrator have no live process here and are marked
    /// crashed so the sync pass can reassign their tasks.
    pub fn register_slots(&self, count: usize) -> Result<Vec<String>, StateError> {
        let ids: Vec<String> = (0..count).map(Self::slot_id).collect();
        self.store.transaction(|snap| {
            for id in &ids {
                let worker = snap.worker_mut(id);
                if worker.status.is_active() {
                    worker.status = WorkerStatus::Crashed;
                    worker.stop_requested = false;
                    snap.record_event(
                        EventKind::WorkerCrashed,
                        None,
                        Some(id),
                        "orphaned by a previous orchestrator",
                    );
                }
            }
            Ok(())
        })?;
        Ok(ids)
    }

    pub fn is_running(&self, worker_id: &str) -> bool {
        self.handles.contains_key(worker_id)
    }

    pub fn running(&self) -> usize {
        self.handles.len()
    }

    pub fn running_workers(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    /// Launch a worker for `assignment`. The task must already be claimed
    /// for the assignment's worker.
    pub async fn spawn(&mut self, assignment: &Assignment) -> Result<LaunchHandle, WorkerError> {
        let worker_id = assignment.worker_id.as_str();
        if self.handles.contains_key(worker_id) {
            return Err(WorkerError::Busy(worker_id.to_string()));
        }
        let abandoned = self
            .store
            .read(|snap| snap.workers.get(worker_id).is_some_and(|w| w.abandoned))?;
        if abandoned {
            return Err(WorkerError::Abandoned(worker_id.to_string()));
        }
        self.circuit.try_acquire(worker_id)?;

        let handle = match self.launcher.launch(assignment).await {
            Ok(handle) => handle,
            Err(source) => {
                self.circuit.record_failure(worker_id)?;
                return Err(WorkerError::LaunchFailed {
                    worker_id: worker_id.to_string(),
                    source,
                });
            }
        };

        self.store.transaction(|snap| {
            let worker = snap.worker_mut(worker_id);
            worker.status = WorkerStatus::Starting;
            worker.current_task = Some(assignment.task_id.clone());
            worker.launched_at = Some(handle.launched_at);
            worker.heartbeat = None;
            worker.consecutive_stalls = 0;
            worker.stop_requested = false;
            worker.branch = Some(assignment.branch.clone());
            worker.worktree = Some(assignment.worktree.clone());
            snap.record_event(
                EventKind::WorkerLaunched,
                Some(&assignment.task_id),
                Some(worker_id),
                format!("{} ({})", handle.id, assignment.branch),
            );
            Ok::<_, StateError>(())
        })?;
        tracing::info!(
            worker = worker_id,
            task = %assignment.task_id,
            id = %handle.id,
            "Worker launched"
        );
        self.handles.insert(worker_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Heartbeat verdict for one worker. Stalls are persisted on the worker
    /// record.
    pub fn health_check(&self, worker_id: &str) -> Result<Health, WorkerError> {
        let policy = self.settings.health;
        let health = self.store.transaction(|snap| {
            let worker = snap
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| StateError::UnknownWorker(worker_id.to_string()))?;
            let health = health::assess(worker, &policy, Utc::now());
            if let Health::Stalled { stalls, .. } = health {
                worker.status = WorkerStatus::Stalled;
                worker.consecutive_stalls = stalls;
            }
            Ok::<_, StateError>(health)
        })?;
        if let Health::Stalled {
            silent_secs,
            stalls,
        } = &health
        {
            tracing::warn!(worker = worker_id, silent_secs, stalls, "Worker stalled");
        }
        Ok(health)
    }

    /// Reap exited workers and deal with hung or silent ones.
    pub async fn poll(&mut self) -> Result<Vec<WorkerExit>, WorkerError> {
        let mut exits = Vec::new();
        let ids: Vec<String> = self.handles.keys().cloned().collect();
        for worker_id in ids {
            let Some(handle) = self.handles.get(&worker_id).cloned() else {
                continue;
            };
            let elapsed = (Utc::now() - handle.launched_at)
                .to_std()
                .unwrap_or(Duration::ZERO);

            match self.launcher.wait(&handle, Duration::ZERO).await {
                Ok(Some(exit)) => {
                    self.release_handle(&handle).await;
                    let outcome = match exit.exit_code {
                        Some(EXIT_COMPLETED) => WorkerOutcome::Completed,
                        Some(EXIT_CHECKPOINT) => WorkerOutcome::Checkpointed,
                        code => WorkerOutcome::Failed {
                            exit_code: code,
                            immediate: elapsed < self.settings.immediate_failure,
                        },
                    };
                    self.record_exit(&handle, &outcome)?;
                    exits.push(WorkerExit {
                        worker_id: worker_id.clone(),
                        task_id: handle.task_id.clone(),
                        outcome,
                    });
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker = %worker_id, error = %e, "Failed to poll worker");
                }
            }

            if elapsed > self.settings.task_timeout {
                tracing::error!(
                    worker = %worker_id,
                    task = %handle.task_id,
                    timeout_secs = self.settings.task_timeout.as_secs(),
                    "Task timed out; terminating worker"
                );
                self.kill(&handle).await;
                let outcome = WorkerOutcome::TimedOut {
                    after_secs: elapsed.as_secs(),
                };
                self.record_exit(&handle, &outcome)?;
                exits.push(WorkerExit {
                    worker_id,
                    task_id: handle.task_id.clone(),
                    outcome,
                });
                continue;
            }

            if let Health::Crashed { reason } = self.health_check(&worker_id)? {
                self.kill(&handle).await;
                let abandoned = self.record_crash(&worker_id, &reason)?;
                exits.push(WorkerExit {
                    worker_id,
                    task_id: handle.task_id.clone(),
                    outcome: WorkerOutcome::Crashed { reason, abandoned },
                });
            }
        }
        Ok(exits)
    }

    /// Stop one worker. A graceful stop raises the worker's stop flag and
    /// leaves reaping to [`poll`](Self::poll); a forced stop kills it now and
    /// returns the task it was running.
    pub async fn terminate(
        &mut self,
        worker_id: &str,
        graceful: bool,
    ) -> Result<Option<String>, WorkerError> {
        let Some(handle) = self.handles.get(worker_id).cloned() else {
            return Ok(None);
        };
        if graceful {
            self.store.transaction(|snap| {
                snap.worker_mut(worker_id).stop_requested = true;
                Ok::<_, StateError>(())
            })?;
            tracing::info!(worker = worker_id, "Asked worker to checkpoint and stop");
            return Ok(None);
        }

        self.kill(&handle).await;
        self.circuit.abort_trial(worker_id)?;
        self.store.transaction(|snap| {
            let worker = snap.worker_mut(worker_id);
            worker.status = WorkerStatus::Stopped;
            worker.current_task = None;
            worker.stop_requested = false;
            snap.record_event(
                EventKind::WorkerExited,
                Some(&handle.task_id),
                Some(worker_id),
                "terminated",
            );
            Ok::<_, StateError>(())
        })?;
        tracing::warn!(worker = worker_id, task = %handle.task_id, "Worker terminated");
        Ok(Some(handle.task_id))
    }

    /// Forced stop of every running worker. Returns `(worker, task)` pairs
    /// that were interrupted.
    pub async fn terminate_all(&mut self) -> Result<Vec<(String, String)>, WorkerError> {
        let ids: Vec<String> = self.handles.keys().cloned().collect();
        let mut interrupted = Vec::new();
        for id in ids {
            if let Some(task) = self.terminate(&id, false).await? {
                interrupted.push((id, task));
            }
        }
        Ok(interrupted)
    }

    async fn kill(&mut self, handle: &LaunchHandle) {
        if let Err(e) = self.launcher.terminate(handle).await {
            tracing::warn!(worker = %handle.worker_id, error = %e, "Failed to kill worker");
        }
        self.release_handle(handle).await;
    }

    async fn release_handle(&mut self, handle: &LaunchHandle) {
        self.handles.remove(&handle.worker_id);
        if let Err(e) = self.launcher.cleanup(handle).await {
            tracing::warn!(worker = %handle.worker_id, error = %e, "Worker cleanup failed");
        }
    }

    fn record_exit(
        &self,
        handle: &LaunchHandle,
        outcome: &WorkerOutcome,
    ) -> Result<(), WorkerError> {
        let worker_id = handle.worker_id.as_str();
        match outcome {
            WorkerOutcome::Failed {
                immediate: true, ..
            } => {
                let state = self.circuit.record_failure(worker_id)?;
                tracing::warn!(worker = worker_id, circuit = ?state, "Worker failed immediately");
            }
            WorkerOutcome::TimedOut { .. } | WorkerOutcome::Crashed { .. } => {
                let state = self.circuit.record_failure(worker_id)?;
                tracing::warn!(worker = worker_id, circuit = ?state, "Worker did not finish its task");
            }
            WorkerOutcome::Completed
            | WorkerOutcome::Checkpointed
            | WorkerOutcome::Failed { .. } => {
                self.circuit.record_success(worker_id)?;
            }
        }

        self.store.transaction(|snap| {
            let worker = snap.worker_mut(worker_id);
            worker.status = WorkerStatus::Stopped;
            if worker.current_task.as_deref() == Some(handle.task_id.as_str()) {
                worker.current_task = None;
            }
            worker.stop_requested = false;
            worker.consecutive_stalls = 0;
            if *outcome == WorkerOutcome::Completed {
                worker.restarts = 0;
            }
            snap.record_event(
                EventKind::WorkerExited,
                Some(&handle.task_id),
                Some(worker_id),
                format!("{:?}", outcome),
            );
            Ok::<_, StateError>(())
        })?;
        tracing::info!(worker = worker_id, task = %handle.task_id, outcome = ?outcome, "Worker exited");
        Ok(())
    }

    /// Returns whether the slot is now abandoned.
    fn record_crash(&self, worker_id: &str, reason: &str) -> Result<bool, WorkerError> {
        let state = self.circuit.record_failure(worker_id)?;
        tracing::debug!(worker = worker_id, circuit = ?state, "Crash counted against circuit");
        let max_restarts = self.settings.max_restarts;
        let abandoned = self.store.transaction(|snap| {
            let worker = snap.worker_mut(worker_id);
            let task = worker.current_task.take();
            worker.status = WorkerStatus::Crashed;
            worker.restarts += 1;
            worker.abandoned = worker.restarts > max_restarts;
            worker.stop_requested = false;
            let abandoned = worker.abandoned;
            let restarts = worker.restarts;
            snap.record_event(
                EventKind::WorkerCrashed,
                task.as_deref(),
                Some(worker_id),
                format!("{} (restart {})", reason, restarts),
            );
            Ok::<_, StateError>(abandoned)
        })?;
        if abandoned {
            tracing::error!(worker = worker_id, reason, "Worker slot abandoned after repeated crashes");
        } else {
            tracing::warn!(worker = worker_id, reason, "Worker crashed; slot will restart");
        }
        Ok(abandoned)
    }
}
