//! Persisted snapshot of one feature's run: tasks, workers, levels, circuit
//! breakers and backpressure windows.

use crate::backpressure::BackpressureWindow;
use crate::circuit::CircuitRecord;
use crate::errors::StateError;
use crate::graph::TaskGraph;
use crate::merge::MergeRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Maximum number of events retained in a snapshot.
pub const MAX_EVENTS: usize = 500;

/// Runtime status of a task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Paused,
}

impl TaskStatus {
    /// Terminal absent an explicit external reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Blocked)
    }

    /// Can be taken by an atomic claim.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Paused)
    }

    /// Legal edges of the task state machine.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Paused)
                | (InProgress, Pending)
                | (Failed, Pending)
                | (Failed, Blocked)
                | (Paused, InProgress)
                | (Paused, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            "paused" => Ok(Self::Paused),
            _ => anyhow::bail!("Invalid task status '{}'", s),
        }
    }
}

/// Lifecycle state of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Checkpoint,
    Stalled,
    #[default]
    Stopped,
    Crashed,
}

impl WorkerStatus {
    /// The slot has a live process attached.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Checkpoint | Self::Stalled
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Checkpoint => "checkpoint",
            Self::Stalled => "stalled",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Status of a level. Only `Merged` unlocks the next level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    #[default]
    Pending,
    Running,
    Merging,
    Merged,
    Failed,
}

impl fmt::Display for LevelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Workers checkpoint and pause their tasks.
    Graceful,
    /// Workers are killed; in-flight tasks fail.
    Force,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub level: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub registry_id: Option<String>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checkpoint: Option<String>,
    /// Slot whose branch holds the checkpoint commit.
    #[serde(default)]
    pub checkpoint_worker: Option<String>,
    #[serde(default)]
    pub checkpoint_commit: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(level: u32, dependencies: Vec<String>) -> Self {
        Self {
            status: TaskStatus::Pending,
            level,
            dependencies,
            worker_id: None,
            retries: 0,
            error: None,
            registry_id: None,
            next_retry_at: None,
            checkpoint: None,
            checkpoint_worker: None,
            checkpoint_commit: None,
            claimed_at: None,
            completed_at: None,
        }
    }

    pub fn clear_checkpoint(&mut self) {
        self.checkpoint = None;
        self.checkpoint_worker = None;
        self.checkpoint_commit = None;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub launched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub consecutive_stalls: u32,
    #[serde(default)]
    pub abandoned: bool,
    #[serde(default)]
    pub stop_requested: bool,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub worktree: Option<PathBuf>,
}

impl WorkerRecord {
    /// Idle: no live process, not abandoned, nothing assigned.
    pub fn is_idle(&self) -> bool {
        !self.abandoned && !self.status.is_active() && self.current_task.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelRecord {
    pub status: LevelStatus,
    #[serde(default)]
    pub merge_commit: Option<String>,
    #[serde(default)]
    pub merge: Option<MergeRecord>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub registry_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Claimed,
    Transition,
    Reassigned,
    Reconciled,
    Retried,
    WorkerLaunched,
    WorkerExited,
    WorkerCrashed,
    LevelStarted,
    LevelMerged,
    LevelFailed,
    StopRequested,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// The full persisted state for one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub feature: String,
    #[serde(default)]
    pub current_level: Option<u32>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRecord>,
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerRecord>,
    #[serde(default)]
    pub levels: BTreeMap<u32, LevelRecord>,
    #[serde(default)]
    pub circuits: BTreeMap<String, CircuitRecord>,
    #[serde(default)]
    pub backpressure: BTreeMap<u32, BackpressureWindow>,
    #[serde(default)]
    pub stop: Option<StopMode>,
    #[serde(default)]
    pub events: Vec<StateEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StateSnapshot {
    /// Fresh snapshot: every task pending, first level running.
    pub fn new(feature: &str, graph: &TaskGraph) -> Self {
        let now = Utc::now();
        let tasks = graph
            .tasks()
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    TaskRecord::new(t.level, t.dependencies.clone()),
                )
            })
            .collect();
        let mut levels: BTreeMap<u32, LevelRecord> = graph
            .levels()
            .into_iter()
            .map(|l| (l, LevelRecord::default()))
            .collect();
        let current_level = graph.first_level();
        if let Some(first) = current_level
            && let Some(record) = levels.get_mut(&first)
        {
            record.status = LevelStatus::Running;
            record.started_at = Some(now);
        }
        Self {
            feature: feature.to_string(),
            current_level,
            tasks,
            workers: BTreeMap::new(),
            levels,
            circuits: BTreeMap::new(),
            backpressure: BTreeMap::new(),
            stop: None,
            events: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, id: &str) -> Result<&TaskRecord, StateError> {
        self.tasks
            .get(id)
            .ok_or_else(|| StateError::UnknownTask(id.to_string()))
    }

    pub fn task_mut(&mut self, id: &str) -> Result<&mut TaskRecord, StateError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownTask(id.to_string()))
    }

    pub fn worker_mut(&mut self, id: &str) -> &mut WorkerRecord {
        self.workers.entry(id.to_string()).or_default()
    }

    /// Move a task along a legal edge of the state machine.
    pub fn transition(&mut self, id: &str, to: TaskStatus) -> Result<TaskStatus, StateError> {
        let record = self.task_mut(id)?;
        let from = record.status;
        if from == to {
            return Ok(from);
        }
        if !from.can_transition_to(to) {
            return Err(StateError::IllegalTransition {
                task: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        record.status = to;
        let worker = record.worker_id.clone();
        self.record_event(
            EventKind::Transition,
            Some(id),
            worker.as_deref(),
            format!("{} -> {}", from, to),
        );
        Ok(from)
    }

    pub fn record_event(
        &mut self,
        kind: EventKind,
        task: Option<&str>,
        worker: Option<&str>,
        detail: impl Into<String>,
    ) {
        self.events.push(StateEvent {
            at: Utc::now(),
            kind,
            task: task.map(str::to_string),
            worker: worker.map(str::to_string),
            detail: detail.into(),
        });
        if self.events.len() > MAX_EVENTS {
            let excess = self.events.len() - MAX_EVENTS;
            self.events.drain(..excess);
        }
    }

    pub fn level_status(&self, level: u32) -> LevelStatus {
        self.levels
            .get(&level)
            .map(|l| l.status)
            .unwrap_or_default()
    }

    pub fn previous_level(&self, level: u32) -> Option<u32> {
        self.levels.range(..level).next_back().map(|(l, _)| *l)
    }

    pub fn next_level(&self, level: u32) -> Option<u32> {
        self.levels
            .range(level.saturating_add(1)..)
            .next()
            .map(|(l, _)| *l)
    }

    /// The single authoritative dispatch check: a level accepts work only
    /// while running and only once the level before it is merged.
    pub fn level_dispatchable(&self, level: u32) -> bool {
        if self.level_status(level) != LevelStatus::Running {
            return false;
        }
        match self.previous_level(level) {
            Some(prev) => self.level_status(prev) == LevelStatus::Merged,
            None => true,
        }
    }

    pub fn tasks_at(&self, level: u32) -> impl Iterator<Item = (&String, &TaskRecord)> {
        self.tasks.iter().filter(move |(_, t)| t.level == level)
    }

    /// Every task at the level is completed.
    pub fn level_complete(&self, level: u32) -> bool {
        let mut any = false;
        for (_, task) in self.tasks_at(level) {
            any = true;
            if task.status != TaskStatus::Completed {
                return false;
            }
        }
        any
    }

    pub fn in_flight_at(&self, level: u32) -> usize {
        self.tasks_at(level)
            .filter(|(_, t)| t.status == TaskStatus::InProgress)
            .count()
    }

    pub fn blocked_at(&self, level: u32) -> Vec<String> {
        self.tasks_at(level)
            .filter(|(_, t)| t.status == TaskStatus::Blocked)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Dependencies of `id` that are not yet completed.
    pub fn unmet_dependencies(&self, id: &str) -> Result<Vec<String>, StateError> {
        let task = self.task(id)?;
        Ok(task
            .dependencies
            .iter()
            .filter(|dep| {
                self.tasks
                    .get(dep.as_str())
                    .is_none_or(|d| d.status != TaskStatus::Completed)
            })
            .cloned()
            .collect())
    }

    /// All levels merged.
    pub fn all_merged(&self) -> bool {
        self.levels.values().all(|l| l.status == LevelStatus::Merged)
    }

    /// Counts of tasks by status.
    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }
}
