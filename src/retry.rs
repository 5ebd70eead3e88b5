//! Task retry policy and failure accounting.

use crate::backpressure::{self, BackpressurePolicy};
use crate::errors::StateError;
use crate::state::{EventKind, StateStore, TaskStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Constant delay
    Fixed,
    /// base × attempt
    Linear,
    /// base × 2^attempt
    #[default]
    Exponential,
}

impl std::fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStrategy::Fixed => write!(f, "fixed"),
            RetryStrategy::Linear => write!(f, "linear"),
            RetryStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failures, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt),
            RetryStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// What happened to a failed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `pending` once `delay` has elapsed.
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted; only `force_retry` brings it back.
    Blocked { attempts: u32 },
}

/// Failure accounting for tasks, persisted through the state store.
#[derive(Clone)]
pub struct TaskRetryManager {
    store: StateStore,
    policy: RetryPolicy,
    backpressure: BackpressurePolicy,
}

impl TaskRetryManager {
    pub fn new(store: StateStore, policy: RetryPolicy, backpressure: BackpressurePolicy) -> Self {
        Self {
            store,
            policy,
            backpressure,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn schedule_retry(&self, _task_id: &str, attempt: u32) -> Duration {
        self.policy.delay_for(attempt)
    }

    /// Mark the task failed, count the attempt, feed backpressure and decide
    /// between a delayed retry and `blocked`. One transaction.
    pub fn record_failure(&self, task_id: &str, error: &str) -> Result<RetryDecision, StateError> {
        let policy = self.policy;
        let bp = self.backpressure;
        self.store.transaction(|snap| {
            if snap.task(task_id)?.status != TaskStatus::Failed {
                snap.transition(task_id, TaskStatus::Failed)?;
            }
            let record = snap.task_mut(task_id)?;
            record.retries += 1;
            record.error = Some(error.to_string());
            let attempt = record.retries;
            let level = record.level;
            let owner = record.worker_id.take();
            if let Some(owner) = &owner {
                let worker = snap.worker_mut(owner);
                if worker.current_task.as_deref() == Some(task_id) {
                    worker.current_task = None;
                }
            }
            backpressure::record_outcome(snap, level, false, &bp);

            if attempt >= policy.max_attempts {
                snap.transition(task_id, TaskStatus::Blocked)?;
                snap.task_mut(task_id)?.next_retry_at = None;
                tracing::error!(
                    task = task_id,
                    attempts = attempt,
                    error,
                    "Task blocked after exhausting retries"
                );
                return Ok(RetryDecision::Blocked { attempts: attempt });
            }

            let delay = policy.delay_for(attempt);
            let at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            snap.task_mut(task_id)?.next_retry_at = Some(at);
            tracing::warn!(
                task = task_id,
                attempt,
                delay_secs = delay.as_secs(),
                error,
                "Task failed; retry scheduled"
            );
            Ok(RetryDecision::Retry { attempt, delay })
        })
    }

    /// Count a completed task as a success in its level's window.
    pub fn record_success(&self, task_id: &str) -> Result<(), StateError> {
        let bp = self.backpressure;
        self.store.transaction(|snap| {
            let level = snap.task(task_id)?.level;
            backpressure::record_outcome(snap, level, true, &bp);
            Ok(())
        })
    }

    /// Move failed tasks at `level` whose delay has elapsed back to
    /// `pending`. Returns their ids.
    pub fn promote_due(&self, level: u32) -> Result<Vec<String>, StateError> {
        let now = Utc::now();
        let max = self.policy.max_attempts;
        self.store.transaction(|snap| {
            let due: Vec<String> = snap
                .tasks_at(level)
                .filter(|(_, t)| {
                    t.status == TaskStatus::Failed
                        && t.retries < max
                        && t.next_retry_at.is_none_or(|at| at <= now)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &due {
                snap.transition(id, TaskStatus::Pending)?;
                snap.task_mut(id)?.next_retry_at = None;
                snap.record_event(EventKind::Retried, Some(id), None, "retry delay elapsed");
            }
            Ok(due)
        })
    }

    /// Operator reset: attempt counter to zero and back to `pending`,
    /// bypassing the ceiling. Circuit breakers are not touched.
    pub fn force_retry(&self, task_id: &str) -> Result<(), StateError> {
        self.store.transaction(|snap| {
            let record = snap.task_mut(task_id)?;
            if matches!(record.status, TaskStatus::InProgress | TaskStatus::Completed) {
                return Err(StateError::Rejected(format!(
                    "Task '{}' is {} and cannot be force-retried",
                    task_id, record.status
                )));
            }
            let from = record.status;
            record.status = TaskStatus::Pending;
            record.retries = 0;
            record.error = None;
            record.next_retry_at = None;
            record.worker_id = None;
            snap.record_event(
                EventKind::Retried,
                Some(task_id),
                None,
                format!("forced retry from {}", from),
            );
            tracing::info!(task = task_id, "Task force-retried by operator");
            Ok(())
        })
    }
}
