//! Per-worker circuit breaker.
//!
//! A worker slot that fails immediately after launch `failure_threshold`
//! times inside `window_secs` is opened for a cooldown. When the cooldown
//! elapses exactly one trial launch is let through (half-open). A failed
//! trial reopens the circuit with the cooldown doubled up to
//! `max_cooldown_secs`; a successful one closes it.
//!
//! The transitions are pure functions over [`CircuitRecord`] with an
//! explicit `now`; [`CircuitBreaker`] persists them through the state store.

use crate::errors::{CircuitOpenError, StateError, WorkerError};
use crate::state::StateStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitPolicy {
    pub failure_threshold: u32,
    pub window_secs: u64,
    pub cooldown_secs: u64,
    pub max_cooldown_secs: u64,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window_secs: 300,
            cooldown_secs: 60,
            max_cooldown_secs: 900,
        }
    }
}

/// Persisted breaker state for one worker slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub window_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_transition: Option<DateTime<Utc>>,
    /// Current cooldown; 0 until the circuit first opens.
    #[serde(default)]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub trial_in_flight: bool,
}

impl CircuitRecord {
    fn open(&mut self, cooldown_secs: u64, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.cooldown_secs = cooldown_secs;
        self.last_transition = Some(now);
        self.trial_in_flight = false;
    }

    fn cooldown_remaining(&self, now: DateTime<Utc>) -> u64 {
        let Some(opened) = self.last_transition else {
            return 0;
        };
        let until = opened + Duration::seconds(self.cooldown_secs as i64);
        (until - now).num_seconds().max(0) as u64
    }

    /// Record one immediate failure. Returns true when this failure opened
    /// the circuit.
    pub fn record_failure(&mut self, policy: &CircuitPolicy, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::HalfOpen => {
                let doubled = self
                    .cooldown_secs
                    .max(policy.cooldown_secs)
                    .saturating_mul(2)
                    .min(policy.max_cooldown_secs);
                self.consecutive_failures += 1;
                self.open(doubled, now);
                true
            }
            CircuitState::Open => {
                self.consecutive_failures += 1;
                false
            }
            CircuitState::Closed => {
                let window = Duration::seconds(policy.window_secs as i64);
                let expired = self
                    .window_started_at
                    .is_none_or(|start| now - start > window);
                if expired {
                    self.window_started_at = Some(now);
                    self.consecutive_failures = 0;
                }
                self.consecutive_failures += 1;
                if self.consecutive_failures >= policy.failure_threshold {
                    self.open(policy.cooldown_secs, now);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        if self.state != CircuitState::Closed {
            self.last_transition = Some(now);
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.window_started_at = None;
        self.cooldown_secs = 0;
        self.trial_in_flight = false;
    }

    /// Whether a spawn would currently be refused.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::Open => self.cooldown_remaining(now) > 0,
            CircuitState::HalfOpen => self.trial_in_flight,
        }
    }

    /// Ask permission to spawn. An elapsed cooldown moves the circuit to
    /// half-open and hands out the single trial. `Err` carries the seconds
    /// until another attempt may succeed.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Result<(), u64> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let remaining = self.cooldown_remaining(now);
                if remaining > 0 {
                    return Err(remaining);
                }
                self.state = CircuitState::HalfOpen;
                self.last_transition = Some(now);
                self.trial_in_flight = true;
                Ok(())
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    Err(self.cooldown_secs)
                } else {
                    self.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Hand back an unfinished trial so the next spawn may take it.
    pub fn abort_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn reset(&mut self) {
        *self = CircuitRecord::default();
    }
}

/// Circuit breaker bound to a feature's state store.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: StateStore,
    policy: CircuitPolicy,
}

impl CircuitBreaker {
    pub fn new(store: StateStore, policy: CircuitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &CircuitPolicy {
        &self.policy
    }

    pub fn record_success(&self, worker_id: &str) -> Result<(), StateError> {
        self.record_success_at(worker_id, Utc::now())
    }

    pub fn record_success_at(&self, worker_id: &str, now: DateTime<Utc>) -> Result<(), StateError> {
        self.store.transaction(|snap| {
            if let Some(record) = snap.circuits.get_mut(worker_id) {
                let was = record.state;
                record.record_success(now);
                if was != CircuitState::Closed {
                    tracing::info!(worker = worker_id, "Circuit closed after successful trial");
                }
            }
            Ok(())
        })
    }

    /// Record an immediate failure. Returns the resulting state.
    pub fn record_failure(&self, worker_id: &str) -> Result<CircuitState, StateError> {
        self.record_failure_at(worker_id, Utc::now())
    }

    pub fn record_failure_at(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CircuitState, StateError> {
        let policy = self.policy;
        self.store.transaction(|snap| {
            let record = snap.circuits.entry(worker_id.to_string()).or_default();
            if record.record_failure(&policy, now) {
                tracing::warn!(
                    worker = worker_id,
                    failures = record.consecutive_failures,
                    cooldown_secs = record.cooldown_secs,
                    "Circuit opened"
                );
            }
            Ok(record.state)
        })
    }

    /// A trial interrupted by an operator stop says nothing about the slot.
    pub fn abort_trial(&self, worker_id: &str) -> Result<(), StateError> {
        self.store.transaction(|snap| {
            if let Some(record) = snap.circuits.get_mut(worker_id) {
                record.abort_trial();
            }
            Ok(())
        })
    }

    pub fn is_open(&self, worker_id: &str) -> Result<bool, StateError> {
        self.is_open_at(worker_id, Utc::now())
    }

    pub fn is_open_at(&self, worker_id: &str, now: DateTime<Utc>) -> Result<bool, StateError> {
        self.store.read(|snap| {
            snap.circuits
                .get(worker_id)
                .is_some_and(|record| record.is_open(now))
        })
    }

    /// Consume spawn permission for `worker_id`.
    pub fn try_acquire(&self, worker_id: &str) -> Result<(), WorkerError> {
        self.try_acquire_at(worker_id, Utc::now())
    }

    pub fn try_acquire_at(&self, worker_id: &str, now: DateTime<Utc>) -> Result<(), WorkerError> {
        self.store.transaction(|snap| {
            let Some(record) = snap.circuits.get_mut(worker_id) else {
                return Ok(());
            };
            let before = record.state;
            match record.try_acquire(now) {
                Ok(()) => {
                    if before == CircuitState::Open {
                        tracing::info!(worker = worker_id, "Circuit half-open; allowing one trial");
                    }
                    Ok(())
                }
                Err(retry_after_secs) => Err(CircuitOpenError {
                    worker_id: worker_id.to_string(),
                    retry_after_secs,
                }
                .into()),
            }
        })
    }

    /// Operator reset: close the circuit and forget escalation.
    pub fn reset(&self, worker_id: &str) -> Result<(), StateError> {
        self.store.transaction(|snap| {
            if let Some(record) = snap.circuits.get_mut(worker_id) {
                record.reset();
            }
            Ok(())
        })
    }

    /// Reset every worker's circuit.
    pub fn reset_all(&self) -> Result<usize, StateError> {
        self.store.transaction(|snap| {
            let count = snap.circuits.len();
            snap.circuits.values_mut().for_each(CircuitRecord::reset);
            Ok(count)
        })
    }
}
