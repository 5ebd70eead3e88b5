//! Worker slots: launching worker processes, watching their heartbeats and
//! the worker-process side of an assignment.
//!
//! A worker process reports how its task ended through its exit code:
//! [`EXIT_COMPLETED`], [`EXIT_FAILED`], [`EXIT_CHECKPOINT`] or
//! [`EXIT_INFRA`] when it could not run the task at all.

mod container;
mod health;
mod launcher;
mod manager;
mod runner;

pub use container::ContainerLauncher;
pub use health::{Health, HealthPolicy};
pub use launcher::{Assignment, ExitOutcome, LaunchHandle, Launcher, ProcessLauncher};
pub use manager::{WorkerExit, WorkerManager, WorkerOutcome, WorkerSettings};
pub use runner::{WorkerRun, WorkerRunner};

#[cfg(test)]
pub(crate) use launcher::mock;

pub const EXIT_COMPLETED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_CHECKPOINT: i32 = 2;
pub const EXIT_INFRA: i32 = 3;
