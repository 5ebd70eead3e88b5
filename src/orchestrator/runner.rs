use super::report::{RunOutcome, RunReport};
use crate::backpressure::BackpressureController;
use crate::circuit::CircuitBreaker;
use crate::config::HiveConfig;
use crate::errors::{ClaimError, MergeError, OrchestratorError, StateError, WorkerError};
use crate::graph::TaskGraph;
use crate::merge::{GateRunner, MergeCoordinator, Vcs};
use crate::retry::{RetryDecision, TaskRetryManager};
use crate::state::{LevelStatus, StateSnapshot, StateStore, StopMode, TaskStatus};
use crate::sync::{StateSyncService, TaskRegistry};
use crate::worker::{
    Assignment, Launcher, WorkerExit, WorkerManager, WorkerOutcome, WorkerSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Progress notifications for a live display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Resumed { level: Option<u32> },
    TaskDispatched { task: String, worker: String },
    TaskCompleted { task: String },
    TaskFailed { task: String, error: String, blocked: bool },
    TaskPaused { task: String },
    TaskReassigned { task: String, reason: String },
    WorkerAbandoned { worker: String },
    LevelMerged { level: u32, commit: Option<String> },
    LevelFailed { level: u32, reason: String },
    Stopping { mode: StopMode },
}

/// Orchestrator knobs not covered by the component policies.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub feature: String,
    pub project_dir: PathBuf,
    pub tasks_file: PathBuf,
    pub workers: usize,
    pub poll_interval: Duration,
    pub sync_interval: Duration,
    /// How long a graceful stop waits for checkpoints before killing
    pub stop_grace: Duration,
    pub worker_log_dir: PathBuf,
    /// Turn Ctrl-C into a stop request
    pub handle_signals: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &HiveConfig, feature: &str, tasks_file: PathBuf) -> Self {
        let heartbeat = config.toml.worker.heartbeat_interval();
        Self {
            feature: feature.to_string(),
            project_dir: config.project_dir.clone(),
            tasks_file,
            workers: config.workers(),
            poll_interval: config.poll_interval(),
            sync_interval: config.sync_interval(),
            stop_grace: heartbeat * 3 + Duration::from_secs(30),
            worker_log_dir: config.worker_log_dir(),
            handle_signals: true,
        }
    }
}

enum Dispatch {
    Started,
    /// The task was not taken; the slot is still free
    Skipped,
    /// The slot could not start a worker
    SlotFailed,
}

/// Composition root and control loop of one feature run.
///
/// The loop is a single cooperative task: promote due retries, dispatch
/// claimable tasks of the current level to idle slots, reap workers,
/// reconcile with the registry and, once the level is complete, merge it
/// and move on. Level `n + 1` is never dispatched before level `n` is
/// merged; the claim transaction enforces this.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    graph: TaskGraph,
    store: StateStore,
    workers: WorkerManager,
    circuit: CircuitBreaker,
    retry: TaskRetryManager,
    backpressure: BackpressureController,
    sync: StateSyncService,
    merge: MergeCoordinator,
    vcs: Arc<dyn Vcs>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
}

impl Orchestrator {
    pub fn new(
        config: &HiveConfig,
        settings: OrchestratorSettings,
        graph: TaskGraph,
        launcher: Arc<dyn Launcher>,
        vcs: Arc<dyn Vcs>,
        registry: Arc<dyn TaskRegistry>,
    ) -> Result<Self, OrchestratorError> {
        let store = StateStore::open(&config.state_dir(), &settings.feature)?;
        let toml = &config.toml;
        let circuit = CircuitBreaker::new(store.clone(), toml.circuit_breaker.to_policy());
        let backpressure_policy = toml.backpressure.to_policy();
        let workers = WorkerManager::new(
            store.clone(),
            circuit.clone(),
            launcher,
            WorkerSettings::from_config(&toml.worker),
        );
        let retry = TaskRetryManager::new(
            store.clone(),
            toml.retry.to_policy(),
            backpressure_policy,
        );
        let backpressure = BackpressureController::new(store.clone(), backpressure_policy);
        let sync = StateSyncService::new(store.clone(), registry);
        let merge = MergeCoordinator::new(
            store.clone(),
            vcs.clone(),
            GateRunner::new(toml.gates.clone()),
        )
        .with_sync(sync.clone());
        Ok(Self {
            settings,
            graph,
            store,
            workers,
            circuit,
            retry,
            backpressure,
            sync,
            merge,
            vcs,
            event_tx: None,
        })
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run (or resume) the feature until every level is merged, a level
    /// halts, or a stop is requested.
    pub async fn run(&mut self) -> Result<RunReport, OrchestratorError> {
        let started = Instant::now();
        self.start().await?;
        let outcome = self.control_loop().await?;
        match &outcome {
            RunOutcome::Completed => tracing::info!(feature = %self.settings.feature, "All levels merged"),
            RunOutcome::Halted { level, reason } => {
                tracing::error!(level, reason = %reason, "Run halted")
            }
            RunOutcome::Stopped(mode) => tracing::warn!(?mode, "Run stopped"),
        }
        let snap = self.store.snapshot()?;
        Ok(RunReport::from_snapshot(&snap, outcome, started.elapsed()))
    }

    async fn start(&mut self) -> Result<(), OrchestratorError> {
        let resumed = self.store.exists();
        let snap = self.store.initialize(&self.graph)?;
        if resumed {
            tracing::info!(
                feature = %self.settings.feature,
                level = ?snap.current_level,
                "Resuming existing run"
            );
            self.emit(RunEvent::Resumed {
                level: snap.current_level,
            })
            .await;
        }
        if snap.stop.is_some() {
            self.store.clear_stop()?;
        }
        self.workers.register_slots(self.settings.workers)?;
        self.sync.ensure_registered(&self.graph).await?;
        if let Some(level) = snap.current_level
            && let Err(e) = self.sync.publish_level(level).await
        {
            tracing::warn!(level, error = %e, "Failed to publish level status");
        }
        let report = self.sync.reconcile().await?;
        for task in report.reassigned {
            self.emit(RunEvent::TaskReassigned {
                task,
                reason: "owner gone".to_string(),
            })
            .await;
        }
        Ok(())
    }

    async fn control_loop(&mut self) -> Result<RunOutcome, OrchestratorError> {
        let mut last_sync = Instant::now();
        loop {
            let snap = self.store.snapshot()?;
            if let Some(mode) = snap.stop {
                return self.shutdown(mode).await;
            }
            if snap.all_merged() {
                return Ok(RunOutcome::Completed);
            }
            let Some(level) = snap.current_level else {
                return Ok(RunOutcome::Completed);
            };

            match snap.level_status(level) {
                LevelStatus::Failed => {
                    let reason = snap
                        .levels
                        .get(&level)
                        .and_then(|l| l.error.clone())
                        .unwrap_or_else(|| "merge failed".to_string());
                    return Ok(RunOutcome::Halted { level, reason });
                }
                LevelStatus::Merging => {
                    if let Some(outcome) = self.merge_level(level).await? {
                        return Ok(outcome);
                    }
                    continue;
                }
                LevelStatus::Running
                    if snap.level_complete(level) && self.workers.running() == 0 =>
                {
                    if let Some(outcome) = self.merge_level(level).await? {
                        return Ok(outcome);
                    }
                    continue;
                }
                _ => {}
            }

            for task in self.retry.promote_due(level)? {
                self.publish(&task).await;
            }
            self.dispatch(level).await?;
            for exit in self.workers.poll().await? {
                self.handle_exit(exit).await?;
            }
            if last_sync.elapsed() >= self.settings.sync_interval {
                let report = self.sync.reconcile().await?;
                for task in report.reassigned {
                    self.emit(RunEvent::TaskReassigned {
                        task,
                        reason: "owner crashed".to_string(),
                    })
                    .await;
                }
                last_sync = Instant::now();
            }

            let snap = self.store.snapshot()?;
            if let Some(halt) = self.halt_reason(&snap, level) {
                return Ok(RunOutcome::Halted {
                    level,
                    reason: halt.to_string(),
                });
            }
            self.idle().await?;
        }
    }

    /// `Some` when the run has to stop at this level.
    async fn merge_level(&mut self, level: u32) -> Result<Option<RunOutcome>, OrchestratorError> {
        match self.merge.merge_level(level).await {
            Ok(record) => {
                tracing::info!(level, commit = ?record.merge_commit, "Level merged");
                self.emit(RunEvent::LevelMerged {
                    level,
                    commit: record.merge_commit,
                })
                .await;
                Ok(None)
            }
            Err(MergeError::State(e)) => Err(e.into()),
            Err(e) => {
                let reason = e.to_string();
                self.emit(RunEvent::LevelFailed {
                    level,
                    reason: reason.clone(),
                })
                .await;
                Ok(Some(RunOutcome::Halted { level, reason }))
            }
        }
    }

    fn halt_reason(&self, snap: &StateSnapshot, level: u32) -> Option<OrchestratorError> {
        if snap.level_status(level) != LevelStatus::Running || snap.level_complete(level) {
            return None;
        }
        let open = snap
            .tasks_at(level)
            .filter(|(_, t)| !matches!(t.status, TaskStatus::Completed | TaskStatus::Blocked))
            .count();
        let blocked = snap.blocked_at(level);
        if open == 0 && !blocked.is_empty() {
            return Some(OrchestratorError::LevelBlocked { level, blocked });
        }
        let usable = (0..self.settings.workers)
            .map(WorkerManager::slot_id)
            .any(|id| snap.workers.get(&id).is_none_or(|w| !w.abandoned));
        if open > 0 && !usable && self.workers.running() == 0 {
            return Some(OrchestratorError::NoWorkers { level });
        }
        None
    }

    async fn dispatch(&mut self, level: u32) -> Result<(), OrchestratorError> {
        let snap = self.store.snapshot()?;
        if snap.stop.is_some() || !snap.level_dispatchable(level) {
            return Ok(());
        }

        let mut budget = usize::MAX;
        if self.backpressure.should_throttle(level)? {
            if self.backpressure.take_probe(level)? {
                budget = 1;
            } else {
                return Ok(());
            }
        }

        let mut idle = Vec::new();
        for index in 0..self.settings.workers {
            let id = WorkerManager::slot_id(index);
            let free = !self.workers.is_running(&id)
                && snap.workers.get(&id).is_none_or(|w| w.is_idle());
            if free && !self.circuit.is_open(&id)? {
                idle.push(id);
            }
        }
        if idle.is_empty() {
            return Ok(());
        }

        let mut candidates: Vec<(String, Option<String>)> = snap
            .tasks_at(level)
            .filter(|(id, t)| {
                t.status.is_claimable()
                    && snap
                        .unmet_dependencies(id)
                        .is_ok_and(|unmet| unmet.is_empty())
            })
            .map(|(id, t)| (id.clone(), t.checkpoint_worker.clone()))
            .collect();
        // Resume checkpoints first, preferably on the slot whose branch
        // holds them; any other slot is seeded from the checkpoint commit.
        candidates.sort_by(|a, b| (a.1.is_none(), &a.0).cmp(&(b.1.is_none(), &b.0)));

        for (task_id, preferred) in candidates {
            if budget == 0 || idle.is_empty() {
                break;
            }
            let index = preferred
                .and_then(|p| idle.iter().position(|s| *s == p))
                .unwrap_or(0);
            let slot = idle.remove(index);
            match self.assign(&task_id, &slot, level).await? {
                Dispatch::Started => budget -= 1,
                Dispatch::Skipped => idle.insert(index.min(idle.len()), slot),
                Dispatch::SlotFailed => {}
            }
        }
        Ok(())
    }

    async fn assign(
        &mut self,
        task_id: &str,
        slot: &str,
        level: u32,
    ) -> Result<Dispatch, OrchestratorError> {
        let record = match self.store.claim_task(task_id, slot) {
            Ok(record) => record,
            Err(ClaimError::Race { reason, .. }) => {
                tracing::debug!(task = task_id, worker = slot, reason = %reason, "Claim lost");
                return Ok(Dispatch::Skipped);
            }
            Err(ClaimError::State(e)) => return Err(e.into()),
        };
        if let Err(e) = self.sync.publish(task_id).await {
            tracing::warn!(task = task_id, error = %e, "Registry rejected claim; releasing");
            self.release(task_id, "registry publish failed").await?;
            return Ok(Dispatch::Skipped);
        }

        let worktree = match self.vcs.prepare_worktree(slot).await {
            Ok(worktree) => worktree,
            Err(e) => {
                tracing::error!(worker = slot, error = %e, "Failed to prepare worktree");
                self.release(task_id, "worktree unavailable").await?;
                return Ok(Dispatch::SlotFailed);
            }
        };
        if let Some(commit) = &record.checkpoint_commit
            && record.checkpoint_worker.as_deref() != Some(slot)
        {
            if let Err(e) = self.vcs.bring_forward(level, &worktree.branch, commit).await {
                tracing::error!(worker = slot, task = task_id, error = %e, "Failed to seed checkpoint");
                self.release(task_id, "checkpoint unavailable on this slot").await?;
                return Ok(Dispatch::SlotFailed);
            }
            tracing::info!(
                worker = slot,
                task = task_id,
                from = ?record.checkpoint_worker,
                commit = %commit,
                "Seeded slot with checkpoint"
            );
        }
        let assignment = Assignment {
            worker_id: slot.to_string(),
            task_id: task_id.to_string(),
            feature: self.settings.feature.clone(),
            level,
            project_dir: self.settings.project_dir.clone(),
            tasks_file: self.settings.tasks_file.clone(),
            worktree: worktree.path,
            branch: worktree.branch,
            log_file: self
                .settings
                .worker_log_dir
                .join(format!("{}-{}.log", slot, task_id)),
            checkpoint: record.checkpoint,
        };

        match self.workers.spawn(&assignment).await {
            Ok(_) => {
                self.emit(RunEvent::TaskDispatched {
                    task: task_id.to_string(),
                    worker: slot.to_string(),
                })
                .await;
                Ok(Dispatch::Started)
            }
            Err(WorkerError::State(e)) => Err(e.into()),
            Err(e) => {
                tracing::warn!(worker = slot, task = task_id, error = %e, "Worker did not start");
                self.release(task_id, &e.to_string()).await?;
                Ok(Dispatch::SlotFailed)
            }
        }
    }

    async fn handle_exit(&mut self, exit: WorkerExit) -> Result<(), OrchestratorError> {
        let task_id = exit.task_id.as_str();
        if exit.outcome != WorkerOutcome::Completed
            && let Err(e) = self.sync.reconcile_task(task_id).await
        {
            tracing::warn!(task = task_id, error = %e, "Could not consult registry");
        }
        let record = self.store.read(|snap| snap.task(task_id).cloned())??;

        match (&exit.outcome, record.status) {
            (_, TaskStatus::Completed) => {
                self.retry.record_success(task_id)?;
                self.emit(RunEvent::TaskCompleted {
                    task: task_id.to_string(),
                })
                .await;
            }
            (WorkerOutcome::Checkpointed, TaskStatus::Paused) => {
                self.emit(RunEvent::TaskPaused {
                    task: task_id.to_string(),
                })
                .await;
            }
            (WorkerOutcome::Crashed { reason, abandoned }, TaskStatus::InProgress) => {
                self.release(task_id, reason).await?;
                if *abandoned {
                    self.emit(RunEvent::WorkerAbandoned {
                        worker: exit.worker_id.clone(),
                    })
                    .await;
                }
            }
            (outcome, TaskStatus::InProgress) => {
                let error = record.error.unwrap_or_else(|| describe(outcome));
                let decision = self.retry.record_failure(task_id, &error)?;
                self.publish(task_id).await;
                self.emit(RunEvent::TaskFailed {
                    task: task_id.to_string(),
                    error,
                    blocked: matches!(decision, RetryDecision::Blocked { .. }),
                })
                .await;
            }
            (outcome, status) => {
                tracing::debug!(task = task_id, ?outcome, %status, "Exit for a task already settled");
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self, mode: StopMode) -> Result<RunOutcome, OrchestratorError> {
        tracing::warn!(?mode, running = self.workers.running(), "Stopping run");
        self.emit(RunEvent::Stopping { mode }).await;

        if mode == StopMode::Graceful {
            for worker in self.workers.running_workers() {
                self.workers.terminate(&worker, true).await?;
            }
            let deadline = Instant::now() + self.settings.stop_grace;
            while self.workers.running() > 0 && Instant::now() < deadline {
                for exit in self.workers.poll().await? {
                    self.handle_exit(exit).await?;
                }
                if self.workers.running() == 0 {
                    break;
                }
                self.idle().await?;
                if self.store.read(|snap| snap.stop)? == Some(StopMode::Force) {
                    break;
                }
            }
            if self.workers.running() > 0 {
                tracing::warn!(
                    running = self.workers.running(),
                    "Workers did not checkpoint in time; terminating"
                );
            }
        }

        for (worker, task) in self.workers.terminate_all().await? {
            let status = self.store.read(|snap| snap.task(&task).map(|t| t.status))??;
            if status == TaskStatus::InProgress {
                tracing::warn!(worker = %worker, task = %task, "Task interrupted by stop");
                self.store.fail_task(&task, "interrupted by stop")?;
                self.publish(&task).await;
            }
        }
        Ok(RunOutcome::Stopped(mode))
    }

    /// Wait one poll interval. Ctrl-C requests a graceful stop; a second one
    /// forces it.
    async fn idle(&self) -> Result<(), OrchestratorError> {
        if !self.settings.handle_signals {
            tokio::time::sleep(self.settings.poll_interval).await;
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_interval) => Ok(()),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                    return Ok(());
                }
                let mode = match self.store.read(|snap| snap.stop)? {
                    Some(_) => StopMode::Force,
                    None => StopMode::Graceful,
                };
                tracing::warn!(?mode, "Interrupt received");
                self.store.request_stop(mode)?;
                Ok(())
            }
        }
    }

    async fn release(&self, task_id: &str, reason: &str) -> Result<(), StateError> {
        self.store.release_task(task_id, reason)?;
        self.emit(RunEvent::TaskReassigned {
            task: task_id.to_string(),
            reason: reason.to_string(),
        })
        .await;
        self.publish(task_id).await;
        Ok(())
    }

    /// Registry publishing is best-effort here; the next reconciliation
    /// sees whatever did not make it.
    async fn publish(&self, task_id: &str) {
        if let Err(e) = self.sync.publish(task_id).await {
            tracing::warn!(task = task_id, error = %e, "Failed to publish task status");
        }
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }
}

fn describe(outcome: &WorkerOutcome) -> String {
    match outcome {
        WorkerOutcome::Completed => "worker exited without recording completion".to_string(),
        WorkerOutcome::Checkpointed => "worker exited without recording its checkpoint".to_string(),
        WorkerOutcome::Failed {
            exit_code: Some(code),
            ..
        } => format!("worker exited with code {}", code),
        WorkerOutcome::Failed { exit_code: None, .. } => "worker killed by signal".to_string(),
        WorkerOutcome::TimedOut { after_secs } => format!("task timed out after {}s", after_secs),
        WorkerOutcome::Crashed { reason, .. } => reason.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HiveToml;
    use crate::graph::{LevelResolver, Task};
    use crate::merge::GitVcs;
    use crate::merge::vcs::commit_all;
    use crate::merge::vcs::test_support::init_repo;
    use crate::state::{EventKind, WorkerStatus};
    use crate::sync::InMemoryRegistry;
    use crate::worker::mock::{MockLauncher, Script};
    use git2::Repository;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        config: HiveConfig,
        launcher: Arc<MockLauncher>,
        registry: Arc<InMemoryRegistry>,
    }

    fn fixture(launcher: MockLauncher, tweak: impl FnOnce(&mut HiveToml)) -> Fixture {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let mut config = HiveConfig::new(dir.path().to_path_buf()).unwrap();
        config.toml.orchestrator.workers = 2;
        config.toml.orchestrator.poll_interval_ms = 10;
        config.toml.orchestrator.sync_interval_ms = 50;
        tweak(&mut config.toml);
        Fixture {
            _dir: dir,
            config,
            launcher: Arc::new(launcher),
            registry: Arc::new(InMemoryRegistry::new()),
        }
    }

    fn graph() -> TaskGraph {
        LevelResolver::new(vec![
            Task::new("A", "first", 1, vec![]).with_files(&["a.txt"], &[]),
            Task::new("B", "second", 1, vec![]).with_files(&["b.txt"], &[]),
            Task::new("C", "third", 2, vec!["A".into(), "B".into()]).with_files(&["c.txt"], &[]),
        ])
        .resolve()
        .unwrap()
    }

    fn orchestrator(fx: &Fixture, graph: TaskGraph) -> Orchestrator {
        let mut settings = OrchestratorSettings::from_config(
            &fx.config,
            "feat",
            fx.config.project_dir.join("tasks.json"),
        );
        settings.handle_signals = false;
        settings.stop_grace = Duration::from_millis(200);
        let vcs = GitVcs::open(
            &fx.config.project_dir,
            "feat",
            None,
            fx.config.worktree_dir("feat"),
        )
        .unwrap();
        Orchestrator::new(
            &fx.config,
            settings,
            graph,
            fx.launcher.clone(),
            Arc::new(vcs),
            fx.registry.clone(),
        )
        .unwrap()
    }

    /// Workers scripted to exit 0 do what a real worker does before exiting:
    /// commit a file, publish completion, then record it locally.
    fn simulate_workers(fx: &Fixture, orch: &Orchestrator) {
        let store = orch.store().clone();
        let sync = StateSyncService::new(store.clone(), fx.registry.clone());
        fx.launcher.on_launch(move |assignment, script| {
            if !matches!(script, Script::Exit(0)) {
                return;
            }
            let file = format!("{}.txt", assignment.task_id.to_lowercase());
            std::fs::write(assignment.worktree.join(&file), &assignment.task_id).unwrap();
            commit_all(&assignment.worktree, &format!("hive({}): done", assignment.task_id))
                .unwrap();
            futures::executor::block_on(sync.publish_as(&assignment.task_id, TaskStatus::Completed))
                .unwrap();
            store
                .complete_task(&assignment.task_id, &assignment.worker_id)
                .unwrap();
        });
    }

    fn base_has_file(dir: &std::path::Path, name: &str) -> bool {
        let repo = Repository::open(dir).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        tree.get_name(name).is_some()
    }

    #[tokio::test]
    async fn test_run_merges_every_level_in_order() {
        let fx = fixture(MockLauncher::new(), |_| {});
        let (tx, mut rx) = mpsc::channel(100);
        let mut orch = orchestrator(&fx, graph()).with_event_channel(tx);
        simulate_workers(&fx, &orch);

        let report = orch.run().await.unwrap();
        assert!(report.success(), "{}", report);
        assert!(report.levels.iter().all(|l| l.status == LevelStatus::Merged));
        assert!(report.levels.iter().all(|l| l.merge_commit.is_some()));
        for file in ["a.txt", "b.txt", "c.txt"] {
            assert!(base_has_file(&fx.config.project_dir, file), "{} missing", file);
        }

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let merged: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::LevelMerged { level, .. } => Some(*level),
                _ => None,
            })
            .collect();
        assert_eq!(merged, vec![1, 2]);
        // C is dispatched only after level 1 merged.
        let c_dispatched = events
            .iter()
            .position(|e| matches!(e, RunEvent::TaskDispatched { task, .. } if task == "C"))
            .unwrap();
        let level_one_merged = events
            .iter()
            .position(|e| matches!(e, RunEvent::LevelMerged { level: 1, .. }))
            .unwrap();
        assert!(level_one_merged < c_dispatched);
    }

    #[tokio::test]
    async fn test_failing_tasks_block_and_halt_the_level() {
        let fx = fixture(MockLauncher::with_default(Script::Exit(1)), |toml| {
            toml.worker.immediate_failure_secs = 0;
            toml.retry.base_delay_secs = 0;
            toml.backpressure.probe_interval_secs = 0;
        });
        let mut orch = orchestrator(&fx, graph());

        let report = orch.run().await.unwrap();
        match &report.outcome {
            RunOutcome::Halted { level, reason } => {
                assert_eq!(*level, 1);
                assert!(reason.contains("blocked"), "{}", reason);
            }
            other => panic!("expected halt, got {:?}", other),
        }
        let level_one = &report.levels[0];
        assert_eq!(level_one.blocked.len(), 2);
        assert!(level_one.blocked.iter().all(|t| t.retries == 3));
        assert_eq!(
            level_one.blocked[0].error.as_deref(),
            Some("worker exited with code 1")
        );
        // Level 2 never started.
        assert_eq!(report.levels[1].status, LevelStatus::Pending);
        assert_eq!(fx.launcher.launch_count(), 6);
    }

    #[tokio::test]
    async fn test_graceful_stop_interrupts_hung_workers() {
        let fx = fixture(MockLauncher::with_default(Script::Hang), |_| {});
        let mut orch = orchestrator(&fx, graph());
        let store = orch.store().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.request_stop(StopMode::Graceful).unwrap();
        });

        let report = orch.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Stopped(StopMode::Graceful));
        let snap = orch.store().snapshot().unwrap();
        for id in ["A", "B"] {
            let task = snap.task(id).unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error.as_deref(), Some("interrupted by stop"));
        }
        assert!(snap.workers.values().all(|w| !w.status.is_active()));
        assert_eq!(fx.launcher.terminated.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resume_reassigns_task_orphaned_by_previous_run() {
        let fx = fixture(MockLauncher::new(), |_| {});
        {
            let store = StateStore::open(&fx.config.state_dir(), "feat").unwrap();
            store.initialize(&graph()).unwrap();
            store.claim_task("A", "worker-0").unwrap();
            store
                .transaction(|snap| {
                    snap.worker_mut("worker-0").status = WorkerStatus::Running;
                    Ok::<_, StateError>(())
                })
                .unwrap();
        }

        let mut orch = orchestrator(&fx, graph());
        simulate_workers(&fx, &orch);
        let report = orch.run().await.unwrap();
        assert!(report.success(), "{}", report);

        let snap = orch.store().snapshot().unwrap();
        assert!(snap.events.iter().any(|e| e.kind == EventKind::WorkerCrashed
            && e.worker.as_deref() == Some("worker-0")));
        assert_eq!(snap.task("A").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_checkpoint_resumes_on_another_slot() {
        let fx = fixture(MockLauncher::new(), |_| {});
        let vcs = GitVcs::open(
            &fx.config.project_dir,
            "feat",
            None,
            fx.config.worktree_dir("feat"),
        )
        .unwrap();
        let checkpoint = {
            let store = StateStore::open(&fx.config.state_dir(), "feat").unwrap();
            store.initialize(&graph()).unwrap();
            store.claim_task("A", "worker-0").unwrap();
            let wt = vcs.prepare_worktree("worker-0").await.unwrap();
            std::fs::write(wt.path.join("a.txt"), "partial").unwrap();
            let commit = commit_all(&wt.path, "hive(A): checkpoint").unwrap().unwrap();
            store
                .pause_task("A", "worker-0", Some("half done"), Some(&commit))
                .unwrap();
            // The slot holding the checkpoint is gone for good.
            store
                .transaction(|snap| {
                    let worker = snap.worker_mut("worker-0");
                    worker.branch = Some(wt.branch.clone());
                    worker.abandoned = true;
                    Ok::<_, StateError>(())
                })
                .unwrap();
            commit
        };

        let mut orch = orchestrator(&fx, graph());
        simulate_workers(&fx, &orch);
        let report = orch.run().await.unwrap();
        assert!(report.success(), "{}", report);

        let resumed = fx
            .launcher
            .launched
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.task_id == "A")
            .cloned()
            .unwrap();
        assert_eq!(resumed.worker_id, "worker-1");
        assert_eq!(resumed.checkpoint.as_deref(), Some("half done"));

        // The merged base descends from the checkpoint the new slot was seeded with.
        let repo = Repository::open(&fx.config.project_dir).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap().id();
        let checkpoint = git2::Oid::from_str(&checkpoint).unwrap();
        assert!(repo.graph_descendant_of(head, checkpoint).unwrap());
        let snap = orch.store().snapshot().unwrap();
        assert!(snap.task("A").unwrap().checkpoint_worker.is_none());
    }
}
