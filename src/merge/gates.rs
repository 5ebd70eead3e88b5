//! Quality gates run against the integration branch after a level merges.

use super::record::GateResult;
use crate::util::{ShellOutcome, run_shell};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// One configured gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    pub command: String,
    /// A failing required gate blocks level advancement
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default = "default_gate_timeout")]
    pub timeout_seconds: u64,
}

fn default_required() -> bool {
    true
}

fn default_gate_timeout() -> u64 {
    600
}

impl GateConfig {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            required: default_required(),
            timeout_seconds: default_gate_timeout(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Runs gates in declared order.
#[derive(Debug, Clone, Default)]
pub struct GateRunner {
    gates: Vec<GateConfig>,
}

impl GateRunner {
    pub fn new(gates: Vec<GateConfig>) -> Self {
        Self { gates }
    }

    pub fn gates(&self) -> &[GateConfig] {
        &self.gates
    }

    /// Run every gate in `dir`, stopping after the first failing required
    /// gate. Optional gate failures are recorded and do not stop the run.
    pub async fn run(&self, dir: &Path, env: &[(String, String)]) -> Vec<GateResult> {
        let mut results = Vec::with_capacity(self.gates.len());
        for gate in &self.gates {
            tracing::info!(gate = %gate.name, command = %gate.command, "Running quality gate");
            let outcome = run_shell(
                &gate.command,
                dir,
                env,
                Duration::from_secs(gate.timeout_seconds),
            )
            .await;
            let result = match outcome {
                Ok(outcome) => gate_result(gate, &outcome),
                Err(e) => GateResult {
                    name: gate.name.clone(),
                    required: gate.required,
                    passed: false,
                    exit_code: None,
                    timed_out: false,
                    duration_ms: 0,
                    detail: Some(format!("{:#}", e)),
                },
            };
            let stop = gate.required && !result.passed;
            if result.passed {
                tracing::info!(gate = %gate.name, "Gate passed");
            } else if gate.required {
                tracing::error!(gate = %gate.name, detail = ?result.detail, "Required gate failed");
            } else {
                tracing::warn!(gate = %gate.name, detail = ?result.detail, "Optional gate failed");
            }
            results.push(result);
            if stop {
                break;
            }
        }
        results
    }
}

fn gate_result(gate: &GateConfig, outcome: &ShellOutcome) -> GateResult {
    let passed = outcome.success();
    GateResult {
        name: gate.name.clone(),
        required: gate.required,
        passed,
        exit_code: outcome.exit_code,
        timed_out: outcome.timed_out,
        duration_ms: outcome.duration.as_millis() as u64,
        detail: (!passed).then(|| outcome.failure_detail(2_000)),
    }
}
