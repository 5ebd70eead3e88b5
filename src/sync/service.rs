use super::registry::{
    RecordKind, RegistryFilter, RegistryMetadata, RegistryRecord, TaskRegistry,
};
use crate::errors::StateError;
use crate::graph::TaskGraph;
use crate::state::{
    EventKind, LevelStatus, StateSnapshot, StateStore, TaskStatus, WorkerStatus,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// `(task, local, registry)` for every local status overwritten
    pub overwritten: Vec<(String, TaskStatus, TaskStatus)>,
    /// In-progress tasks taken back from dead workers
    pub reassigned: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.overwritten.is_empty() && self.reassigned.is_empty()
    }
}

/// Keeps the local snapshot consistent with the task registry.
#[derive(Clone)]
pub struct StateSyncService {
    store: StateStore,
    registry: Arc<dyn TaskRegistry>,
}

impl StateSyncService {
    pub fn new(store: StateStore, registry: Arc<dyn TaskRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &Arc<dyn TaskRegistry> {
        &self.registry
    }

    /// Create registry records for every task that lacks one. Returns the
    /// number created.
    pub async fn ensure_registered(&self, graph: &TaskGraph) -> Result<usize> {
        let missing: Vec<(String, RegistryMetadata)> = self.store.read(|snap| {
            snap.tasks
                .iter()
                .filter(|(_, record)| record.registry_id.is_none())
                .filter_map(|(id, _)| metadata_for(snap, id).map(|m| (id.clone(), m)))
                .collect()
        })?;
        if missing.is_empty() {
            return Ok(0);
        }

        let mut created = Vec::with_capacity(missing.len());
        for (task_id, metadata) in missing {
            let subject = match graph.get(&task_id) {
                Some(task) => format!("{}: {}", task.id, task.title),
                None => task_id.clone(),
            };
            let registry_id = self
                .registry
                .create(&subject, metadata)
                .await
                .with_context(|| format!("Failed to register task '{}'", task_id))?;
            created.push((task_id, registry_id));
        }

        let count = created.len();
        self.store.transaction(|snap| {
            for (task_id, registry_id) in &created {
                snap.task_mut(task_id)?.registry_id = Some(registry_id.clone());
            }
            Ok::<_, StateError>(())
        })?;
        tracing::info!(count, "Registered tasks with the registry");
        Ok(count)
    }

    /// Push a task's local status to the registry. Never pulls.
    pub async fn publish(&self, task_id: &str) -> Result<()> {
        self.publish_status(task_id, None).await
    }

    /// Publish `status` ahead of the matching local transition.
    pub async fn publish_as(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.publish_status(task_id, Some(status)).await
    }

    async fn publish_status(&self, task_id: &str, status: Option<TaskStatus>) -> Result<()> {
        let (registry_id, local, metadata) = self.store.read(|snap| {
            let record = snap.task(task_id)?;
            let metadata = metadata_for(snap, task_id)
                .ok_or_else(|| StateError::UnknownTask(task_id.to_string()))?;
            Ok::<_, StateError>((record.registry_id.clone(), record.status, metadata))
        })??;
        let status = status.unwrap_or(local);

        let registry_id = match registry_id {
            Some(id) => id,
            None => {
                let id = self.registry.create(task_id, metadata.clone()).await?;
                self.store.transaction(|snap| {
                    snap.task_mut(task_id)?.registry_id = Some(id.clone());
                    Ok::<_, StateError>(())
                })?;
                id
            }
        };
        self.registry
            .update(&registry_id, status, metadata)
            .await
            .with_context(|| format!("Failed to publish task '{}' as {}", task_id, status))?;
        tracing::debug!(task = task_id, %status, "Published task status");
        Ok(())
    }

    /// Push a level's local status to the registry. Level records are
    /// informational; reconciliation never reads them back.
    pub async fn publish_level(&self, level: u32) -> Result<()> {
        let (registry_id, status) = self.store.read(|snap| {
            let record = snap.levels.get(&level);
            (
                record.and_then(|l| l.registry_id.clone()),
                snap.level_status(level),
            )
        })?;
        let metadata = RegistryMetadata {
            kind: RecordKind::Level,
            feature: self.store.feature().to_string(),
            level,
            level_status: Some(status),
            ..Default::default()
        };

        let registry_id = match registry_id {
            Some(id) => id,
            None => {
                let id = self
                    .registry
                    .create(&format!("level {}", level), metadata.clone())
                    .await?;
                self.store.transaction(|snap| {
                    snap.levels.entry(level).or_default().registry_id = Some(id.clone());
                    Ok::<_, StateError>(())
                })?;
                id
            }
        };
        self.registry
            .update(&registry_id, level_task_status(status), metadata)
            .await
            .with_context(|| format!("Failed to publish level {} as {}", level, status))?;
        tracing::debug!(level, %status, "Published level status");
        Ok(())
    }

    /// Apply the registry's status for one task if it differs from local.
    /// Returns the adopted status.
    pub async fn reconcile_task(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        let registry_id = self
            .store
            .read(|snap| snap.task(task_id).map(|t| t.registry_id.clone()))??;
        let Some(registry_id) = registry_id else {
            return Ok(None);
        };
        let Some(remote) = self.registry.get(&registry_id).await? else {
            return Ok(None);
        };
        let adopted = self.store.transaction(|snap| {
            let local = snap.task(task_id)?.status;
            if local == remote.status {
                return Ok::<_, StateError>(None);
            }
            overwrite(snap, task_id, &remote)?;
            Ok(Some(remote.status))
        })?;
        if let Some(status) = adopted {
            tracing::info!(task = task_id, %status, "Adopted registry status");
        }
        Ok(adopted)
    }

    /// Overwrite local statuses from the registry, then return in-progress
    /// tasks owned by dead workers to `pending`.
    pub async fn reconcile(&self) -> Result<SyncReport> {
        let records: HashMap<String, RegistryRecord> = self
            .registry
            .list(&RegistryFilter::feature(self.store.feature()))
            .await
            .context("Failed to list registry records")?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let report = self.store.transaction(|snap| {
            let mut report = SyncReport::default();
            let task_ids: Vec<String> = snap.tasks.keys().cloned().collect();

            for task_id in &task_ids {
                let record = snap.task(task_id)?;
                let Some(remote) = record
                    .registry_id
                    .as_ref()
                    .and_then(|id| records.get(id))
                else {
                    continue;
                };
                let local = record.status;
                if remote.status == local {
                    continue;
                }
                overwrite(snap, task_id, remote)?;
                report
                    .overwritten
                    .push((task_id.clone(), local, remote.status));
            }

            for task_id in &task_ids {
                let record = snap.task(task_id)?;
                if record.status != TaskStatus::InProgress || owner_alive(snap, task_id) {
                    continue;
                }
                let owner = record.worker_id.clone();
                let record = snap.task_mut(task_id)?;
                record.status = TaskStatus::Pending;
                record.worker_id = None;
                if let Some(owner) = &owner
                    && let Some(worker) = snap.workers.get_mut(owner)
                    && worker.current_task.as_deref() == Some(task_id.as_str())
                {
                    worker.current_task = None;
                }
                snap.record_event(
                    EventKind::Reassigned,
                    Some(task_id),
                    owner.as_deref(),
                    "owner crashed or gone",
                );
                report.reassigned.push(task_id.clone());
            }
            Ok::<_, StateError>(report)
        })?;

        for (task, local, remote) in &report.overwritten {
            tracing::info!(task = %task, %local, %remote, "Local status overwritten from registry");
        }
        for task in &report.reassigned {
            tracing::warn!(task = %task, "Reassigned task stranded by a dead worker");
            if let Err(e) = self.publish(task).await {
                tracing::warn!(task = %task, error = %e, "Failed to publish reassignment");
            }
        }
        Ok(report)
    }
}

/// Coarse registry status of a level record.
fn level_task_status(status: LevelStatus) -> TaskStatus {
    match status {
        LevelStatus::Pending => TaskStatus::Pending,
        LevelStatus::Running | LevelStatus::Merging => TaskStatus::InProgress,
        LevelStatus::Merged => TaskStatus::Completed,
        LevelStatus::Failed => TaskStatus::Failed,
    }
}

/// Registry metadata for a task as the snapshot currently sees it.
fn metadata_for(snap: &StateSnapshot, task_id: &str) -> Option<RegistryMetadata> {
    let record = snap.tasks.get(task_id)?;
    Some(RegistryMetadata {
        feature: snap.feature.clone(),
        task_id: task_id.to_string(),
        level: record.level,
        worker: record.worker_id.clone(),
        retries: record.retries,
        error: record.error.clone(),
        ..Default::default()
    })
}

/// Apply the registry's view of a task. Bypasses the transition table.
fn overwrite(
    snap: &mut StateSnapshot,
    task_id: &str,
    remote: &RegistryRecord,
) -> Result<(), StateError> {
    let local = snap.task(task_id)?.status;
    let record = snap.task_mut(task_id)?;
    record.status = remote.status;
    record.retries = record.retries.max(remote.metadata.retries);
    if remote.metadata.error.is_some() {
        record.error = remote.metadata.error.clone();
    }
    match remote.status {
        TaskStatus::Completed => {
            record.completed_at.get_or_insert_with(Utc::now);
            if let Some(worker) = &remote.metadata.worker {
                record.worker_id = Some(worker.clone());
            }
            record.clear_checkpoint();
        }
        TaskStatus::InProgress => {
            if remote.metadata.worker.is_some() {
                record.worker_id = remote.metadata.worker.clone();
            }
        }
        _ => record.worker_id = None,
    }

    if remote.status != TaskStatus::InProgress {
        for worker in snap.workers.values_mut() {
            if !worker.status.is_active() && worker.current_task.as_deref() == Some(task_id) {
                worker.current_task = None;
            }
        }
    }
    snap.record_event(
        EventKind::Reconciled,
        Some(task_id),
        remote.metadata.worker.as_deref(),
        format!("{} -> {} (registry)", local, remote.status),
    );
    Ok(())
}

/// An owner is alive while its slot is active or still holds the task.
fn owner_alive(snap: &StateSnapshot, task_id: &str) -> bool {
    let Some(owner) = snap.tasks.get(task_id).and_then(|t| t.worker_id.as_deref()) else {
        return false;
    };
    match snap.workers.get(owner) {
        Some(worker) if worker.status == WorkerStatus::Crashed => false,
        Some(worker) => {
            worker.status.is_active() || worker.current_task.as_deref() == Some(task_id)
        }
        None => false,
    }
}
