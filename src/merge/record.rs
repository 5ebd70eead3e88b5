use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Merging,
    Merged,
    Conflict,
    GateFailed,
}

impl std::fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStatus::Merging => write!(f, "merging"),
            MergeStatus::Merged => write!(f, "merged"),
            MergeStatus::Conflict => write!(f, "conflict"),
            MergeStatus::GateFailed => write!(f, "gate_failed"),
        }
    }
}

/// Result of merging one worker branch into the integration branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchOutcome {
    /// Merged; `commit` is the integration tip afterwards.
    Merged { commit: String },
    /// Nothing to merge.
    UpToDate,
    Conflict { paths: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchMerge {
    pub branch: String,
    pub outcome: BranchOutcome,
}

impl BranchMerge {
    pub fn is_conflict(&self) -> bool {
        matches!(self.outcome, BranchOutcome::Conflict { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub required: bool,
    pub passed: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-level merge outcome. Finalized (tagged) only when every branch
/// merged cleanly and every required gate passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub level: u32,
    pub status: MergeStatus,
    pub integration_branch: String,
    #[serde(default)]
    pub base_commit: Option<String>,
    #[serde(default)]
    pub branches: Vec<BranchMerge>,
    #[serde(default)]
    pub gates: Vec<GateResult>,
    #[serde(default)]
    pub merge_commit: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    /// Slot branches whose unmerged commits were dropped when they were
    /// brought forward.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reset_branches: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl MergeRecord {
    pub fn new(level: u32, integration_branch: &str) -> Self {
        Self {
            level,
            status: MergeStatus::Merging,
            integration_branch: integration_branch.to_string(),
            base_commit: None,
            branches: Vec::new(),
            gates: Vec::new(),
            merge_commit: None,
            tag: None,
            reset_branches: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn failed_gate(&self) -> Option<&GateResult> {
        self.gates.iter().find(|g| g.required && !g.passed)
    }

    pub fn finish(&mut self, status: MergeStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}
