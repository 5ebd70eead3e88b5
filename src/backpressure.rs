//! Per-level backpressure.
//!
//! Each level keeps a rolling window of the last `window_size` task
//! outcomes. Once `min_samples` outcomes are in, a failure ratio at or above
//! `failure_threshold` throttles new dispatch at that level. A throttled
//! level with nothing in flight gets one probe dispatch per
//! `probe_interval` so the window can recover.

use crate::errors::StateError;
use crate::state::{StateSnapshot, StateStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressurePolicy {
    pub window_size: usize,
    pub failure_threshold: f64,
    pub min_samples: usize,
    pub probe_interval: Duration,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_threshold: 0.5,
            min_samples: 3,
            probe_interval: Duration::from_secs(30),
        }
    }
}

/// Rolling outcome window for one level. `true` is a success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackpressureWindow {
    #[serde(default)]
    pub outcomes: VecDeque<bool>,
    #[serde(default)]
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl BackpressureWindow {
    pub fn record(&mut self, success: bool, window_size: usize) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > window_size.max(1) {
            self.outcomes.pop_front();
        }
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|ok| !**ok).count()
    }

    pub fn failure_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            None
        } else {
            Some(self.failures() as f64 / self.outcomes.len() as f64)
        }
    }

    pub fn should_throttle(&self, policy: &BackpressurePolicy) -> bool {
        if self.outcomes.len() < policy.min_samples.max(1) {
            return false;
        }
        self.failure_rate()
            .is_some_and(|rate| rate >= policy.failure_threshold)
    }
}

/// Record an outcome inside an open transaction.
pub fn record_outcome(
    snap: &mut StateSnapshot,
    level: u32,
    success: bool,
    policy: &BackpressurePolicy,
) -> bool {
    let window = snap.backpressure.entry(level).or_default();
    let was = window.should_throttle(policy);
    window.record(success, policy.window_size);
    let now = window.should_throttle(policy);
    if now && !was {
        tracing::warn!(
            level,
            failures = window.failures(),
            samples = window.outcomes.len(),
            "Backpressure engaged; pausing dispatch at level"
        );
    } else if was && !now {
        tracing::info!(level, "Backpressure released");
    }
    now
}

/// Store-backed backpressure controller.
#[derive(Clone)]
pub struct BackpressureController {
    store: StateStore,
    policy: BackpressurePolicy,
}

impl BackpressureController {
    pub fn new(store: StateStore, policy: BackpressurePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &BackpressurePolicy {
        &self.policy
    }

    pub fn record_success(&self, level: u32) -> Result<(), StateError> {
        let policy = self.policy;
        self.store.transaction(|snap| {
            record_outcome(snap, level, true, &policy);
            Ok(())
        })
    }

    pub fn record_failure(&self, level: u32) -> Result<(), StateError> {
        let policy = self.policy;
        self.store.transaction(|snap| {
            record_outcome(snap, level, false, &policy);
            Ok(())
        })
    }

    pub fn should_throttle(&self, level: u32) -> Result<bool, StateError> {
        self.store.read(|snap| {
            snap.backpressure
                .get(&level)
                .is_some_and(|w| w.should_throttle(&self.policy))
        })
    }

    /// Grant a probe dispatch for a throttled, idle level. At most one per
    /// probe interval.
    pub fn take_probe(&self, level: u32) -> Result<bool, StateError> {
        self.take_probe_at(level, Utc::now())
    }

    pub fn take_probe_at(&self, level: u32, now: DateTime<Utc>) -> Result<bool, StateError> {
        let policy = self.policy;
        self.store.transaction(|snap| {
            let idle = snap.in_flight_at(level) == 0;
            let Some(window) = snap.backpressure.get_mut(&level) else {
                return Ok(false);
            };
            if !idle || !window.should_throttle(&policy) {
                return Ok(false);
            }
            let interval = chrono::Duration::from_std(policy.probe_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
            let due = window.last_probe_at.is_none_or(|at| now - at >= interval);
            if due {
                window.last_probe_at = Some(now);
                tracing::info!(level, "Dispatching probe task under backpressure");
            }
            Ok(due)
        })
    }

    /// (failures, samples) in the current window.
    pub fn stats(&self, level: u32) -> Result<(usize, usize), StateError> {
        self.store.read(|snap| {
            snap.backpressure
                .get(&level)
                .map(|w| (w.failures(), w.outcomes.len()))
                .unwrap_or((0, 0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{LevelResolver, Task};
    use tempfile::tempdir;

    fn policy() -> BackpressurePolicy {
        BackpressurePolicy {
            window_size: 4,
            failure_threshold: 0.5,
            min_samples: 3,
            probe_interval: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window = BackpressureWindow::default();
        for _ in 0..10 {
            window.record(true, 4);
        }
        assert_eq!(window.outcomes.len(), 4);
    }

    #[test]
    fn test_min_samples_gate() {
        let mut window = BackpressureWindow::default();
        window.record(false, 4);
        window.record(false, 4);
        assert!(!window.should_throttle(&policy()));
        window.record(false, 4);
        assert!(window.should_throttle(&policy()));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut window = BackpressureWindow::default();
        for ok in [true, false, true, false] {
            window.record(ok, 4);
        }
        assert_eq!(window.failure_rate(), Some(0.5));
        assert!(window.should_throttle(&policy()));
    }

    #[test]
    fn test_successes_age_out_failures() {
        let mut window = BackpressureWindow::default();
        for ok in [false, false, false, true, true, true] {
            window.record(ok, 4);
        }
        assert!(!window.should_throttle(&policy()));
    }

    fn controller(dir: &std::path::Path) -> BackpressureController {
        let graph = LevelResolver::new(vec![
            Task::new("A", "a", 1, vec![]),
            Task::new("B", "b", 2, vec!["A".into()]),
        ])
        .resolve()
        .unwrap();
        let store = StateStore::open(dir, "feat").unwrap();
        store.initialize(&graph).unwrap();
        BackpressureController::new(store, policy())
    }

    #[test]
    fn test_levels_are_independent() {
        let dir = tempdir().unwrap();
        let bp = controller(dir.path());
        for _ in 0..3 {
            bp.record_failure(1).unwrap();
        }
        assert!(bp.should_throttle(1).unwrap());
        assert!(!bp.should_throttle(2).unwrap());
        assert_eq!(bp.stats(1).unwrap(), (3, 3));
    }

    #[test]
    fn test_probe_once_per_interval() {
        let dir = tempdir().unwrap();
        let bp = controller(dir.path());
        let now = Utc::now();
        assert!(!bp.take_probe_at(1, now).unwrap());
        for _ in 0..3 {
            bp.record_failure(1).unwrap();
        }
        assert!(bp.take_probe_at(1, now).unwrap());
        assert!(!bp.take_probe_at(1, now + chrono::Duration::seconds(5)).unwrap());
        assert!(bp.take_probe_at(1, now + chrono::Duration::seconds(11)).unwrap());
    }
}
