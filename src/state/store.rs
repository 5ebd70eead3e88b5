//! File-backed state store with cross-process transactions.
//!
//! Every mutation runs as load → mutate → persist while holding the
//! feature's lock. Persistence writes a temporary file, fsyncs it and
//! renames it over the snapshot, so readers never observe a torn write.

use super::lock::ProcessLock;
use super::snapshot::{
    EventKind, LevelStatus, StateSnapshot, StopMode, TaskRecord, TaskStatus, WorkerStatus,
};
use crate::errors::{ClaimError, StateError};
use crate::graph::TaskGraph;
use chrono::Utc;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Handle to one feature's persisted state.
///
/// Cheap to clone. Any number of handles, in any number of processes, may
/// point at the same snapshot; the lock serializes them.
#[derive(Clone)]
pub struct StateStore {
    feature: String,
    path: PathBuf,
    lock: ProcessLock,
}

impl StateStore {
    /// Open the store for `feature` under `state_dir`, creating the directory.
    pub fn open(state_dir: &Path, feature: &str) -> Result<Self, StateError> {
        fs::create_dir_all(state_dir).map_err(|source| StateError::Write {
            path: state_dir.to_path_buf(),
            source,
        })?;
        let path = state_dir.join(format!("{}.json", feature));
        let lock = ProcessLock::new(state_dir.join(format!("{}.lock", feature)));
        Ok(Self {
            feature: feature.to_string(),
            path,
            lock,
        })
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create a fresh snapshot for `graph`, or resume the existing one.
    ///
    /// Resuming fails if the snapshot's task set no longer matches the graph.
    pub fn initialize(&self, graph: &TaskGraph) -> Result<StateSnapshot, StateError> {
        let _guard = self.lock.acquire()?;
        if self.path.exists() {
            let snapshot = self.load()?;
            let expected: BTreeSet<&str> = graph.tasks().iter().map(|t| t.id.as_str()).collect();
            let found: BTreeSet<&str> = snapshot.tasks.keys().map(String::as_str).collect();
            if expected != found {
                return Err(StateError::Rejected(format!(
                    "Task graph for '{}' changed since the snapshot was created; start with --fresh",
                    self.feature
                )));
            }
            tracing::info!(feature = %self.feature, "Resuming from existing snapshot");
            return Ok(snapshot);
        }
        let snapshot = StateSnapshot::new(&self.feature, graph);
        self.persist(&snapshot)?;
        tracing::info!(feature = %self.feature, tasks = graph.len(), "Created state snapshot");
        Ok(snapshot)
    }

    /// Delete the snapshot so the next `initialize` starts over.
    pub fn reset(&self) -> Result<(), StateError> {
        let _guard = self.lock.acquire()?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Hold the lock across several transactions.
    ///
    /// Transactions inside `f` reuse the held lock instead of deadlocking.
    pub fn with_lock<T>(&self, f: impl FnOnce() -> T) -> Result<T, StateError> {
        let _guard = self.lock.acquire()?;
        Ok(f())
    }

    /// Run `mutate` against the latest snapshot and persist the result.
    ///
    /// If `mutate` returns an error nothing is written. Starting another
    /// transaction from inside `mutate` fails with `NestedMutation`.
    pub fn transaction<T, E, F>(&self, mutate: F) -> Result<T, E>
    where
        F: FnOnce(&mut StateSnapshot) -> Result<T, E>,
        E: From<StateError>,
    {
        let guard = self.lock.acquire()?;
        let _scope = guard.begin_mutation()?;
        let mut snapshot = self.load()?;
        let value = mutate(&mut snapshot)?;
        snapshot.updated_at = Utc::now();
        self.persist(&snapshot)?;
        Ok(value)
    }

    /// Read-only view of the latest snapshot under the lock.
    pub fn read<T>(&self, f: impl FnOnce(&StateSnapshot) -> T) -> Result<T, StateError> {
        let guard = self.lock.acquire()?;
        if guard.is_mutating() {
            return Err(StateError::NestedMutation);
        }
        let snapshot = self.load()?;
        Ok(f(&snapshot))
    }

    pub fn snapshot(&self) -> Result<StateSnapshot, StateError> {
        self.read(Clone::clone)
    }

    fn load(&self) -> Result<StateSnapshot, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::Missing {
                    feature: self.feature.clone(),
                });
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let snapshot: StateSnapshot =
            serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        if snapshot.feature != self.feature {
            return Err(StateError::FeatureMismatch {
                expected: self.feature.clone(),
                found: snapshot.feature,
            });
        }
        Ok(snapshot)
    }

    fn persist(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| write_err(std::io::Error::other(e)))?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(write_err)?;
        file.write_all(&json).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Convenience transactions
    // ------------------------------------------------------------------

    /// Atomically claim `task_id` for `worker_id`.
    ///
    /// Succeeds only if the task is pending or paused, its level is
    /// dispatchable and every dependency is completed. Any other outcome is
    /// a `ClaimError::Race` and leaves the snapshot untouched.
    pub fn claim_task(&self, task_id: &str, worker_id: &str) -> Result<TaskRecord, ClaimError> {
        self.transaction(|snap| {
            let race = |reason: String| ClaimError::Race {
                task: task_id.to_string(),
                reason,
            };
            let record = snap.task(task_id)?;
            if !record.status.is_claimable() {
                return Err(race(format!("task is {}", record.status)));
            }
            let level = record.level;
            if !snap.level_dispatchable(level) {
                return Err(race(format!(
                    "level {} is {} and not dispatchable",
                    level,
                    snap.level_status(level)
                )));
            }
            let unmet = snap.unmet_dependencies(task_id)?;
            if !unmet.is_empty() {
                return Err(race(format!("dependencies not completed: {:?}", unmet)));
            }
            if snap.stop.is_some() {
                return Err(race("stop requested".to_string()));
            }

            snap.transition(task_id, TaskStatus::InProgress)?;
            let now = Utc::now();
            let record = snap.task_mut(task_id)?;
            record.worker_id = Some(worker_id.to_string());
            record.claimed_at = Some(now);
            record.error = None;
            record.next_retry_at = None;
            let claimed = record.clone();

            let worker = snap.worker_mut(worker_id);
            worker.current_task = Some(task_id.to_string());
            snap.record_event(EventKind::Claimed, Some(task_id), Some(worker_id), "");
            Ok(claimed)
        })
    }

    /// Mark a task completed. Only the owning worker may complete it.
    pub fn complete_task(&self, task_id: &str, worker_id: &str) -> Result<(), StateError> {
        self.transaction(|snap| {
            ensure_owner(snap, task_id, worker_id)?;
            snap.transition(task_id, TaskStatus::Completed)?;
            let record = snap.task_mut(task_id)?;
            record.completed_at = Some(Utc::now());
            record.clear_checkpoint();
            record.error = None;
            let worker = snap.worker_mut(worker_id);
            worker.current_task = None;
            Ok(())
        })
    }

    /// Mark a task failed without consulting the retry policy.
    pub fn fail_task(&self, task_id: &str, error: &str) -> Result<(), StateError> {
        self.transaction(|snap| {
            snap.transition(task_id, TaskStatus::Failed)?;
            let record = snap.task_mut(task_id)?;
            record.error = Some(error.to_string());
            let owner = record.worker_id.take();
            if let Some(owner) = owner {
                snap.worker_mut(&owner).current_task = None;
            }
            Ok(())
        })
    }

    /// Pause an in-progress task, keeping a checkpoint note for the next
    /// worker. `commit` is the partial work left on the worker's branch.
    pub fn pause_task(
        &self,
        task_id: &str,
        worker_id: &str,
        checkpoint: Option<&str>,
        commit: Option<&str>,
    ) -> Result<(), StateError> {
        self.transaction(|snap| {
            ensure_owner(snap, task_id, worker_id)?;
            snap.transition(task_id, TaskStatus::Paused)?;
            let record = snap.task_mut(task_id)?;
            record.worker_id = None;
            if let Some(note) = checkpoint {
                record.checkpoint = Some(note.to_string());
            }
            if let Some(commit) = commit {
                record.checkpoint_worker = Some(worker_id.to_string());
                record.checkpoint_commit = Some(commit.to_string());
            }
            let worker = snap.worker_mut(worker_id);
            worker.current_task = None;
            worker.status = WorkerStatus::Checkpoint;
            Ok(())
        })
    }

    /// Return a task to `pending` and clear its owner. Used to reassign work
    /// after a crash, stall or failed registry publish.
    pub fn release_task(&self, task_id: &str, reason: &str) -> Result<(), StateError> {
        self.transaction(|snap| {
            snap.transition(task_id, TaskStatus::Pending)?;
            let record = snap.task_mut(task_id)?;
            let owner = record.worker_id.take();
            if let Some(owner) = &owner {
                let worker = snap.worker_mut(owner);
                if worker.current_task.as_deref() == Some(task_id) {
                    worker.current_task = None;
                }
            }
            snap.record_event(EventKind::Reassigned, Some(task_id), owner.as_deref(), reason);
            Ok(())
        })
    }

    /// Record a worker heartbeat. Returns the worker's stop flag so the
    /// worker can checkpoint and exit.
    pub fn heartbeat(&self, worker_id: &str) -> Result<bool, StateError> {
        self.transaction(|snap| {
            let stop = snap.stop.is_some();
            let worker = snap.worker_mut(worker_id);
            worker.heartbeat = Some(Utc::now());
            if worker.status == WorkerStatus::Starting || worker.status == WorkerStatus::Stalled {
                worker.status = WorkerStatus::Running;
            }
            worker.consecutive_stalls = 0;
            Ok(worker.stop_requested || stop)
        })
    }

    /// Ask every worker to stop.
    pub fn request_stop(&self, mode: StopMode) -> Result<(), StateError> {
        self.transaction(|snap| {
            snap.stop = Some(mode);
            for worker in snap.workers.values_mut() {
                if worker.status.is_active() {
                    worker.stop_requested = true;
                }
            }
            snap.record_event(EventKind::StopRequested, None, None, format!("{:?}", mode));
            Ok(())
        })
    }

    /// Clear a previous stop request so a resumed run can dispatch again.
    pub fn clear_stop(&self) -> Result<(), StateError> {
        self.transaction(|snap| {
            snap.stop = None;
            for worker in snap.workers.values_mut() {
                worker.stop_requested = false;
            }
            Ok(())
        })
    }

    pub fn set_level_status(&self, level: u32, status: LevelStatus) -> Result<(), StateError> {
        self.transaction(|snap| {
            let record = snap.levels.entry(level).or_default();
            record.status = status;
            let now = Utc::now();
            match status {
                LevelStatus::Running if record.started_at.is_none() => {
                    record.started_at = Some(now)
                }
                LevelStatus::Merged | LevelStatus::Failed => record.finished_at = Some(now),
                _ => {}
            }
            if status == LevelStatus::Running {
                snap.current_level = Some(level);
            }
            Ok(())
        })
    }

    pub fn record_event(
        &self,
        kind: EventKind,
        task: Option<&str>,
        worker: Option<&str>,
        detail: &str,
    ) -> Result<(), StateError> {
        self.transaction(|snap| {
            snap.record_event(kind, task, worker, detail);
            Ok(())
        })
    }
}

fn ensure_owner(snap: &StateSnapshot, task_id: &str, worker_id: &str) -> Result<(), StateError> {
    let record = snap.task(task_id)?;
    match record.worker_id.as_deref() {
        Some(owner) if owner == worker_id => Ok(()),
        other => Err(StateError::Rejected(format!(
            "Task '{}' is owned by {:?}, not '{}'",
            task_id, other, worker_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{LevelResolver, Task};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    fn graph() -> TaskGraph {
        LevelResolver::new(vec![
            Task::new("A", "a", 1, vec![]),
            Task::new("B", "b", 1, vec![]),
            Task::new("C", "c", 2, vec!["A".into(), "B".into()]),
        ])
        .resolve()
        .unwrap()
    }

    fn store(dir: &Path) -> StateStore {
        let store = StateStore::open(dir, "feat").unwrap();
        store.initialize(&graph()).unwrap();
        store
    }

    #[test]
    fn test_initialize_creates_then_resumes() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), "feat").unwrap();
        assert!(!store.exists());
        store.initialize(&graph()).unwrap();
        assert!(store.exists());

        store.claim_task("A", "worker-0").unwrap();
        let resumed = store.initialize(&graph()).unwrap();
        assert_eq!(resumed.tasks["A"].status, TaskStatus::InProgress);
    }

    #[test]
    fn test_initialize_rejects_changed_graph() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let other = LevelResolver::new(vec![Task::new("X", "x", 1, vec![])])
            .resolve()
            .unwrap();
        let err = store.initialize(&other).unwrap_err();
        assert!(matches!(err, StateError::Rejected(_)));
    }

    #[test]
    fn test_missing_snapshot_is_reported() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path(), "feat").unwrap();
        assert!(matches!(
            store.snapshot().unwrap_err(),
            StateError::Missing { .. }
        ));
    }

    #[test]
    fn test_corrupt_snapshot_is_reported() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::write(store.path(), "{ truncated").unwrap();
        assert!(matches!(
            store.snapshot().unwrap_err(),
            StateError::Corrupt { .. }
        ));
    }

    #[test]
    fn test_failed_mutation_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let before = fs::read_to_string(store.path()).unwrap();
        let result: Result<(), StateError> = store.transaction(|snap| {
            snap.task_mut("A")?.status = TaskStatus::Completed;
            Err(StateError::Rejected("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn test_transaction_inside_mutation_is_refused() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let inner_store = store.clone();
        let result: Result<(), StateError> = store.transaction(|_| {
            inner_store.heartbeat("worker-0")?;
            Ok(())
        });
        assert!(matches!(result, Err(StateError::NestedMutation)));
        // The outer scope is released; later transactions work.
        assert!(store.heartbeat("worker-0").is_ok());
    }

    #[test]
    fn test_with_lock_allows_nested_transactions() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let result = store
            .with_lock(|| -> Result<(), ClaimError> {
                store.claim_task("A", "worker-0")?;
                store.claim_task("B", "worker-1")?;
                Ok(())
            })
            .unwrap();
        assert!(result.is_ok());
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.tasks["A"].worker_id.as_deref(), Some("worker-0"));
        assert_eq!(snap.tasks["B"].worker_id.as_deref(), Some("worker-1"));
    }

    #[test]
    fn test_claim_rejects_undispatchable_level() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let err = store.claim_task("C", "worker-0").unwrap_err();
        assert!(err.is_race());
    }

    #[test]
    fn test_claim_requires_previous_level_merged() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        for (task, worker) in [("A", "w0"), ("B", "w1")] {
            store.claim_task(task, worker).unwrap();
            store.complete_task(task, worker).unwrap();
        }
        store.set_level_status(2, LevelStatus::Running).unwrap();
        assert!(store.claim_task("C", "w0").unwrap_err().is_race());

        store.set_level_status(1, LevelStatus::Merged).unwrap();
        let claimed = store.claim_task("C", "w0").unwrap();
        assert_eq!(claimed.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_second_claim_loses() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.claim_task("A", "worker-0").unwrap();
        let err = store.claim_task("A", "worker-1").unwrap_err();
        assert!(err.is_race());
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.tasks["A"].worker_id.as_deref(), Some("worker-0"));
    }

    #[test]
    fn test_concurrent_claims_have_exactly_one_winner() {
        let dir = tempdir().unwrap();
        store(dir.path());
        let claimers = 8;
        let barrier = Arc::new(Barrier::new(claimers));
        let state_dir = dir.path().to_path_buf();

        let handles: Vec<_> = (0..claimers)
            .map(|i| {
                let barrier = Arc::clone(&barrier);
                let state_dir = state_dir.clone();
                thread::spawn(move || {
                    let store = StateStore::open(&state_dir, "feat").unwrap();
                    barrier.wait();
                    store.claim_task("A", &format!("worker-{}", i)).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);

        let snap = StateStore::open(&state_dir, "feat")
            .unwrap()
            .snapshot()
            .unwrap();
        assert_eq!(snap.tasks["A"].status, TaskStatus::InProgress);
        let owners: Vec<_> = snap
            .workers
            .values()
            .filter(|w| w.current_task.as_deref() == Some("A"))
            .collect();
        assert_eq!(owners.len(), 1);
    }

    #[test]
    fn test_complete_requires_owner() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.claim_task("A", "worker-0").unwrap();
        assert!(store.complete_task("A", "worker-1").is_err());
        store.complete_task("A", "worker-0").unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.tasks["A"].status, TaskStatus::Completed);
        assert!(snap.workers["worker-0"].current_task.is_none());
    }

    #[test]
    fn test_pause_keeps_checkpoint_and_allows_reclaim() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.claim_task("A", "worker-0").unwrap();
        store
            .pause_task("A", "worker-0", Some("types done, parser next"), Some("abc123"))
            .unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.tasks["A"].status, TaskStatus::Paused);
        assert_eq!(
            snap.tasks["A"].checkpoint.as_deref(),
            Some("types done, parser next")
        );

        assert_eq!(snap.tasks["A"].checkpoint_worker.as_deref(), Some("worker-0"));
        assert_eq!(snap.tasks["A"].checkpoint_commit.as_deref(), Some("abc123"));

        let claimed = store.claim_task("A", "worker-1").unwrap();
        assert_eq!(claimed.checkpoint.as_deref(), Some("types done, parser next"));
        assert_eq!(claimed.checkpoint_worker.as_deref(), Some("worker-0"));

        store.complete_task("A", "worker-1").unwrap();
        let snap = store.snapshot().unwrap();
        assert!(snap.tasks["A"].checkpoint_worker.is_none());
        assert!(snap.tasks["A"].checkpoint_commit.is_none());
    }

    #[test]
    fn test_release_clears_owner() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.claim_task("A", "worker-0").unwrap();
        store.release_task("A", "worker crashed").unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.tasks["A"].status, TaskStatus::Pending);
        assert!(snap.tasks["A"].worker_id.is_none());
        assert!(snap.workers["worker-0"].current_task.is_none());
        assert_eq!(snap.events.last().unwrap().kind, EventKind::Reassigned);
    }

    #[test]
    fn test_stop_request_reaches_heartbeat_and_blocks_claims() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(!store.heartbeat("worker-0").unwrap());
        store.request_stop(StopMode::Graceful).unwrap();
        assert!(store.heartbeat("worker-0").unwrap());
        assert!(store.claim_task("A", "worker-1").unwrap_err().is_race());

        store.clear_stop().unwrap();
        assert!(!store.heartbeat("worker-0").unwrap());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.heartbeat("worker-0").unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
