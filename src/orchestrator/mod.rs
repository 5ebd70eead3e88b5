//! Feature runs: the control loop that drives a task graph level by level
//! to merged code.

mod report;
mod runner;

pub use report::{BlockedTask, LevelReport, RunOutcome, RunReport};
pub use runner::{Orchestrator, OrchestratorSettings, RunEvent};
