//! Persistent, lock-protected run state.
//!
//! One JSON snapshot per feature lives at `.hive/state/<feature>.json`. The
//! orchestrator and every worker process read and mutate it through
//! [`StateStore`] transactions.

pub(crate) mod lock;
mod snapshot;
mod store;

pub use snapshot::{
    EventKind, LevelRecord, LevelStatus, MAX_EVENTS, StateEvent, StateSnapshot, StopMode,
    TaskRecord, TaskStatus, WorkerRecord, WorkerStatus,
};
pub use store::StateStore;
