//! Reconciliation between the local snapshot and the task registry.

pub mod registry;
mod service;

pub use registry::{
    InMemoryRegistry, JsonFileRegistry, RecordKind, RegistryFilter, RegistryMetadata,
    RegistryRecord, TaskRegistry,
};
pub use service::{StateSyncService, SyncReport};
