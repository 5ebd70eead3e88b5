//! End-of-run summary.

use crate::state::{LevelStatus, StateSnapshot, StopMode, TaskStatus};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every level merged
    Completed,
    /// A level cannot complete; the run needs operator action
    Halted { level: u32, reason: String },
    Stopped(StopMode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedTask {
    pub id: String,
    pub retries: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelReport {
    pub level: u32,
    pub status: LevelStatus,
    pub total: usize,
    pub completed: usize,
    pub blocked: Vec<BlockedTask>,
    pub merge_commit: Option<String>,
    /// Name of the required gate that failed the merge
    pub failed_gate: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub feature: String,
    pub outcome: RunOutcome,
    pub levels: Vec<LevelReport>,
    pub abandoned_workers: Vec<String>,
    pub duration: Duration,
}

impl RunReport {
    pub fn from_snapshot(snap: &StateSnapshot, outcome: RunOutcome, duration: Duration) -> Self {
        let levels = snap
            .levels
            .iter()
            .map(|(&level, record)| {
                let tasks: Vec<_> = snap.tasks_at(level).collect();
                let blocked = tasks
                    .iter()
                    .filter(|(_, t)| t.status == TaskStatus::Blocked)
                    .map(|(id, t)| BlockedTask {
                        id: (*id).clone(),
                        retries: t.retries,
                        error: t.error.clone(),
                    })
                    .collect();
                LevelReport {
                    level,
                    status: record.status,
                    total: tasks.len(),
                    completed: tasks
                        .iter()
                        .filter(|(_, t)| t.status == TaskStatus::Completed)
                        .count(),
                    blocked,
                    merge_commit: record.merge_commit.clone(),
                    failed_gate: record
                        .merge
                        .as_ref()
                        .and_then(|m| m.failed_gate())
                        .map(|g| g.name.clone()),
                    error: record.error.clone(),
                }
            })
            .collect();
        let abandoned_workers = snap
            .workers
            .iter()
            .filter(|(_, w)| w.abandoned)
            .map(|(id, _)| id.clone())
            .collect();
        Self {
            feature: snap.feature.clone(),
            outcome,
            levels,
            abandoned_workers,
            duration,
        }
    }

    pub fn success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Halted { level, reason } => write!(f, "halted at level {}: {}", level, reason),
            RunOutcome::Stopped(mode) => write!(f, "stopped ({:?})", mode),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Feature '{}' {} in {}s",
            self.feature,
            self.outcome,
            self.duration.as_secs()
        )?;
        for level in &self.levels {
            write!(
                f,
                "  Level {}: {} ({}/{} tasks completed)",
                level.level, level.status, level.completed, level.total
            )?;
            if let Some(commit) = &level.merge_commit {
                write!(f, " at {}", &commit[..commit.len().min(10)])?;
            }
            writeln!(f)?;
            for task in &level.blocked {
                writeln!(
                    f,
                    "    blocked {} after {} attempts: {}",
                    task.id,
                    task.retries,
                    task.error.as_deref().unwrap_or("no error recorded")
                )?;
            }
            if let Some(gate) = &level.failed_gate {
                writeln!(f, "    gate '{}' failed", gate)?;
            }
            if let Some(error) = &level.error {
                writeln!(f, "    {}", error)?;
            }
        }
        if !self.abandoned_workers.is_empty() {
            writeln!(f, "  Abandoned workers: {}", self.abandoned_workers.join(", "))?;
        }
        Ok(())
    }
}
