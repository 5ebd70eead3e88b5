//! Level merge pipeline.
//!
//! After every task at a level completes, the [`MergeCoordinator`] collects
//! the worker branches, merges them one by one into an integration branch,
//! runs the configured quality gates there and, on success, tags the result
//! as the new base. Exclusive file ownership per level means a conflict can
//! only come from a bad task graph, so conflicts abort the level instead of
//! being resolved.

mod coordinator;
mod gates;
mod record;
pub mod vcs;

pub use coordinator::MergeCoordinator;
pub use gates::{GateConfig, GateRunner};
pub use record::{BranchMerge, BranchOutcome, GateResult, MergeRecord, MergeStatus};
pub use vcs::{GitVcs, Integration, MergeResult, Vcs, WorktreeInfo};
