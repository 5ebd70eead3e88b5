//! Heartbeat-based liveness for running workers.
//!
//! Workers heartbeat into the state store. A worker silent for longer than
//! the grace period is stalled; every further grace period of silence counts
//! as another consecutive stall, and reaching the configured maximum
//! declares the worker crashed.

use crate::state::WorkerRecord;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub grace_secs: u64,
    pub max_stalls: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            grace_secs: 60,
            max_stalls: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Alive,
    Stalled { silent_secs: i64, stalls: u32 },
    Crashed { reason: String },
}

impl Health {
    pub fn is_crashed(&self) -> bool {
        matches!(self, Health::Crashed { .. })
    }
}

/// Seconds since the worker last showed a sign of life.
pub fn silence(record: &WorkerRecord, now: DateTime<Utc>) -> i64 {
    record
        .heartbeat
        .or(record.launched_at)
        .map(|last| (now - last).num_seconds().max(0))
        .unwrap_or(0)
}

pub fn assess(record: &WorkerRecord, policy: &HealthPolicy, now: DateTime<Utc>) -> Health {
    let silent_secs = silence(record, now);
    let grace = policy.grace_secs.max(1) as i64;
    if silent_secs <= grace {
        return Health::Alive;
    }
    let stalls = (silent_secs / grace) as u32;
    if stalls >= policy.max_stalls {
        Health::Crashed {
            reason: format!(
                "no heartbeat for {}s ({} consecutive stalls)",
                silent_secs, stalls
            ),
        }
    } else {
        Health::Stalled {
            silent_secs,
            stalls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record_with_heartbeat(at: DateTime<Utc>) -> WorkerRecord {
        WorkerRecord {
            heartbeat: Some(at),
            ..Default::default()
        }
    }

    #[test]
    fn test_recent_heartbeat_is_alive() {
        let now = Utc::now();
        let record = record_with_heartbeat(now - Duration::seconds(30));
        assert_eq!(assess(&record, &HealthPolicy::default(), now), Health::Alive);
    }

    #[test]
    fn test_silence_past_grace_is_stalled() {
        let now = Utc::now();
        let record = record_with_heartbeat(now - Duration::seconds(130));
        assert_eq!(
            assess(&record, &HealthPolicy::default(), now),
            Health::Stalled {
                silent_secs: 130,
                stalls: 2
            }
        );
    }

    #[test]
    fn test_max_stalls_is_crashed() {
        let now = Utc::now();
        let record = record_with_heartbeat(now - Duration::seconds(185));
        assert!(assess(&record, &HealthPolicy::default(), now).is_crashed());
    }

    #[test]
    fn test_launch_time_used_before_first_heartbeat() {
        let now = Utc::now();
        let record = WorkerRecord {
            launched_at: Some(now - Duration::seconds(90)),
            ..Default::default()
        };
        assert_eq!(silence(&record, now), 90);
        let fresh = WorkerRecord::default();
        assert_eq!(assess(&fresh, &HealthPolicy::default(), now), Health::Alive);
    }
}
