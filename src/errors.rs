//! Typed error hierarchy for the hive orchestrator.
//!
//! Each subsystem owns one enum:
//! - `ValidationError`: task graph rejected before any worker is launched
//! - `StateError`: the state snapshot cannot be read, written or trusted
//! - `ClaimError`: an atomic claim was refused
//! - `CircuitOpenError`: a spawn was refused by the circuit breaker
//! - `WorkerError`: launch, wait and cleanup failures
//! - `MergeError`: level merge and quality gate failures
//! - `OrchestratorError`: failures that halt the control loop

use std::path::PathBuf;
use thiserror::Error;

/// A single problem found while validating a task graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphProblem {
    #[error("duplicate task id '{0}'")]
    DuplicateId(String),

    #[error("task has an empty id")]
    EmptyId,

    #[error("task '{task}' has level 0; levels start at 1")]
    ZeroLevel { task: String },

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("cycle detected among tasks {tasks:?}")]
    Cycle { tasks: Vec<String> },

    #[error(
        "task '{task}' is at level {level} but depends on '{dependency}' at level {dependency_level}"
    )]
    LevelOrder {
        task: String,
        level: u32,
        dependency: String,
        dependency_level: u32,
    },

    #[error("level {level}: '{path}' is owned by both '{first}' and '{second}'")]
    OwnershipOverlap {
        level: u32,
        path: String,
        first: String,
        second: String,
    },

    #[error("task '{task}' lists '{path}' in both create and modify")]
    CreateModifyOverlap { task: String, path: String },

    #[error("task '{task}' has a zero verification timeout")]
    ZeroTimeout { task: String },
}

/// Task graph rejected during pre-flight validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Failed to parse task graph: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to read task graph at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task graph is invalid ({} problem(s)): {}", .0.len(), summarize(.0))]
    Invalid(Vec<GraphProblem>),
}

impl ValidationError {
    /// Task ids named by the validation problems, if any.
    pub fn offending_tasks(&self) -> Vec<String> {
        let ValidationError::Invalid(problems) = self else {
            return Vec::new();
        };
        let mut ids: Vec<String> = problems
            .iter()
            .flat_map(|p| match p {
                GraphProblem::DuplicateId(id) => vec![id.clone()],
                GraphProblem::EmptyId => vec![],
                GraphProblem::ZeroLevel { task }
                | GraphProblem::UnknownDependency { task, .. }
                | GraphProblem::CreateModifyOverlap { task, .. }
                | GraphProblem::ZeroTimeout { task } => vec![task.clone()],
                GraphProblem::Cycle { tasks } => tasks.clone(),
                GraphProblem::LevelOrder { task, .. } => vec![task.clone()],
                GraphProblem::OwnershipOverlap { first, second, .. } => {
                    vec![first.clone(), second.clone()]
                }
            })
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

fn summarize(problems: &[GraphProblem]) -> String {
    problems
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The state snapshot could not be used. Always fatal to the current run.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to acquire state lock at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read state snapshot at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist state snapshot at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State snapshot at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No state snapshot for feature '{feature}'")]
    Missing { feature: String },

    #[error("Snapshot belongs to feature '{found}', expected '{expected}'")]
    FeatureMismatch { expected: String, found: String },

    #[error("Transaction started from inside another transaction's mutation")]
    NestedMutation,

    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Unknown worker '{0}'")]
    UnknownWorker(String),

    #[error("Illegal transition for task '{task}': {from} -> {to}")]
    IllegalTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("{0}")]
    Rejected(String),
}

/// Why an atomic claim did not go through.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// Lost the race or the task was not claimable. Expected; try another task.
    #[error("Claim on task '{task}' lost: {reason}")]
    Race { task: String, reason: String },

    #[error(transparent)]
    State(#[from] StateError),
}

impl ClaimError {
    pub fn is_race(&self) -> bool {
        matches!(self, ClaimError::Race { .. })
    }
}

/// A spawn refused by an open circuit. Protective, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit open for worker '{worker_id}' (retry after {retry_after_secs}s)")]
pub struct CircuitOpenError {
    pub worker_id: String,
    pub retry_after_secs: u64,
}

/// Failures of the worker lifecycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Failed to launch worker '{worker_id}': {source}")]
    LaunchFailed {
        worker_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Worker '{worker_id}' crashed: {reason}")]
    Crash { worker_id: String, reason: String },

    #[error("Worker '{worker_id}' missed heartbeats for {silent_secs}s")]
    StallTimeout { worker_id: String, silent_secs: i64 },

    #[error("Worker slot '{0}' is abandoned after exhausting restarts")]
    Abandoned(String),

    #[error("Worker slot '{0}' is busy")]
    Busy(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures of the merge-and-validate pipeline between levels.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Level {level} is not complete: {reason}")]
    LevelIncomplete { level: u32, reason: String },

    #[error(
        "Merge conflict merging '{branch}' at level {level} (ownership violation) in {paths:?}"
    )]
    Conflict {
        level: u32,
        branch: String,
        paths: Vec<String>,
    },

    #[error("Required gate '{gate}' failed at level {level}: {detail}")]
    GateFailure {
        level: u32,
        gate: String,
        detail: String,
    },

    #[error("Version control error: {0}")]
    Vcs(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<git2::Error> for MergeError {
    fn from(err: git2::Error) -> Self {
        MergeError::Vcs(err.message().to_string())
    }
}

/// Failures that halt the orchestrator control loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Level {level} cannot complete: tasks {blocked:?} are blocked")]
    LevelBlocked { level: u32, blocked: Vec<String> },

    #[error("Level {level} has no live worker slots left")]
    NoWorkers { level: u32 },

    #[error("Run stopped by operator")]
    Stopped,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_problem() {
        let err = ValidationError::Invalid(vec![
            GraphProblem::UnknownDependency {
                task: "T2".into(),
                dependency: "T9".into(),
            },
            GraphProblem::OwnershipOverlap {
                level: 1,
                path: "src/a.rs".into(),
                first: "T1".into(),
                second: "T3".into(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("2 problem(s)"));
        assert!(text.contains("T9"));
        assert!(text.contains("src/a.rs"));
        assert_eq!(err.offending_tasks(), vec!["T1", "T2", "T3"]);
    }

    #[test]
    fn claim_race_is_distinguishable_from_state_errors() {
        let race = ClaimError::Race {
            task: "T1".into(),
            reason: "already in_progress".into(),
        };
        assert!(race.is_race());
        let state: ClaimError = StateError::UnknownTask("T1".into()).into();
        assert!(!state.is_race());
    }

    #[test]
    fn circuit_open_converts_into_worker_error() {
        let err: WorkerError = CircuitOpenError {
            worker_id: "worker-0".into(),
            retry_after_secs: 30,
        }
        .into();
        assert!(matches!(err, WorkerError::CircuitOpen(_)));
        assert!(err.to_string().contains("worker-0"));
    }

    #[test]
    fn merge_conflict_names_branch_and_paths() {
        let err = MergeError::Conflict {
            level: 2,
            branch: "hive/feat/worker-1".into(),
            paths: vec!["src/lib.rs".into()],
        };
        let text = err.to_string();
        assert!(text.contains("hive/feat/worker-1"));
        assert!(text.contains("src/lib.rs"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StateError::NestedMutation);
        assert_std_error(&MergeError::Vcs("x".into()));
        assert_std_error(&OrchestratorError::Stopped);
        assert_std_error(&GraphProblem::EmptyId);
    }
}
