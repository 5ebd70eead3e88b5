//! The external task registry: the authoritative record of task status.
//!
//! Local state may lag behind the registry (a worker may publish its result
//! and die before updating the snapshot), so reconciliation always lets the
//! registry win.

use crate::state::{LevelStatus, TaskStatus};
use crate::state::lock::ProcessLock;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// What a registry record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    #[default]
    Task,
    Level,
}

/// Descriptive fields published alongside a status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryMetadata {
    #[serde(default)]
    pub kind: RecordKind,
    pub feature: String,
    /// Empty for level records.
    #[serde(default)]
    pub task_id: String,
    pub level: u32,
    /// Exact level status; the record's status is its coarse task form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_status: Option<LevelStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub id: String,
    pub subject: String,
    pub status: TaskStatus,
    pub metadata: RegistryMetadata,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryFilter {
    pub feature: Option<String>,
    pub status: Option<TaskStatus>,
}

impl RegistryFilter {
    pub fn feature(feature: &str) -> Self {
        Self {
            feature: Some(feature.to_string()),
            status: None,
        }
    }

    fn matches(&self, record: &RegistryRecord) -> bool {
        self.feature
            .as_deref()
            .is_none_or(|f| record.metadata.feature == f)
            && self.status.is_none_or(|s| record.status == s)
    }
}

#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Create a pending record and return its id.
    async fn create(&self, subject: &str, metadata: RegistryMetadata) -> Result<String>;

    async fn update(&self, id: &str, status: TaskStatus, metadata: RegistryMetadata)
    -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<RegistryRecord>>;

    async fn list(&self, filter: &RegistryFilter) -> Result<Vec<RegistryRecord>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    records: BTreeMap<String, RegistryRecord>,
}

fn new_record_id() -> String {
    format!("task-{}", uuid::Uuid::new_v4().simple())
}

/// Registry kept in a JSON file shared by the orchestrator and its worker
/// processes. Each call is one locked read-modify-write, run on the blocking
/// pool since the lock is a file lock.
pub struct JsonFileRegistry {
    inner: Arc<RegistryFileStore>,
}

struct RegistryFileStore {
    path: PathBuf,
    lock: ProcessLock,
}

impl JsonFileRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self {
            inner: Arc::new(RegistryFileStore {
                path: path.to_path_buf(),
                lock: ProcessLock::new(path.with_extension("lock")),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn locked<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RegistryFile) -> Result<(T, bool)> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.locked(f))
            .await
            .context("Registry access task failed")?
    }
}

impl RegistryFileStore {
    fn load(&self) -> Result<RegistryFile> {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Corrupt registry file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        }
    }

    fn save(&self, file: &RegistryFile) -> Result<()> {
        let json = serde_json::to_vec_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        let mut out =
            fs::File::create(&tmp).with_context(|| format!("Failed to write {}", tmp.display()))?;
        out.write_all(&json)?;
        out.sync_all()?;
        drop(out);
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn locked<T>(&self, f: impl FnOnce(&mut RegistryFile) -> Result<(T, bool)>) -> Result<T> {
        let _guard = self.lock.acquire()?;
        let mut file = self.load()?;
        let (value, dirty) = f(&mut file)?;
        if dirty {
            self.save(&file)?;
        }
        Ok(value)
    }
}

#[async_trait]
impl TaskRegistry for JsonFileRegistry {
    async fn create(&self, subject: &str, metadata: RegistryMetadata) -> Result<String> {
        let subject = subject.to_string();
        self.locked(move |file| Ok((insert_record(&mut file.records, &subject, metadata), true)))
            .await
    }

    async fn update(
        &self,
        id: &str,
        status: TaskStatus,
        metadata: RegistryMetadata,
    ) -> Result<()> {
        let id = id.to_string();
        self.locked(move |file| {
            update_record(&mut file.records, &id, status, metadata)?;
            Ok(((), true))
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<RegistryRecord>> {
        let id = id.to_string();
        self.locked(move |file| Ok((file.records.get(&id).cloned(), false)))
            .await
    }

    async fn list(&self, filter: &RegistryFilter) -> Result<Vec<RegistryRecord>> {
        let filter = filter.clone();
        self.locked(move |file| {
            let records = file
                .records
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect();
            Ok((records, false))
        })
        .await
    }
}

/// Registry held in memory, for tests and embedding.
#[derive(Default)]
pub struct InMemoryRegistry {
    records: Mutex<BTreeMap<String, RegistryRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, RegistryRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TaskRegistry for InMemoryRegistry {
    async fn create(&self, subject: &str, metadata: RegistryMetadata) -> Result<String> {
        Ok(insert_record(&mut self.records(), subject, metadata))
    }

    async fn update(
        &self,
        id: &str,
        status: TaskStatus,
        metadata: RegistryMetadata,
    ) -> Result<()> {
        update_record(&mut self.records(), id, status, metadata)
    }

    async fn get(&self, id: &str) -> Result<Option<RegistryRecord>> {
        Ok(self.records().get(id).cloned())
    }

    async fn list(&self, filter: &RegistryFilter) -> Result<Vec<RegistryRecord>> {
        Ok(self
            .records()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }
}

fn insert_record(
    records: &mut BTreeMap<String, RegistryRecord>,
    subject: &str,
    metadata: RegistryMetadata,
) -> String {
    let id = new_record_id();
    records.insert(
        id.clone(),
        RegistryRecord {
            id: id.clone(),
            subject: subject.to_string(),
            status: TaskStatus::Pending,
            metadata,
            updated_at: Utc::now(),
        },
    );
    id
}

fn update_record(
    records: &mut BTreeMap<String, RegistryRecord>,
    id: &str,
    status: TaskStatus,
    metadata: RegistryMetadata,
) -> Result<()> {
    let record = records
        .get_mut(id)
        .with_context(|| format!("Unknown registry record '{}'", id))?;
    record.status = status;
    record.metadata = metadata;
    record.updated_at = Utc::now();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn metadata(task: &str) -> RegistryMetadata {
        RegistryMetadata {
            feature: "auth".to_string(),
            task_id: task.to_string(),
            level: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_json_registry_persists_across_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = JsonFileRegistry::open(&path).unwrap();
        let id = registry.create("T1: login", metadata("T1")).await.unwrap();

        let other = JsonFileRegistry::open(&path).unwrap();
        let mut meta = metadata("T1");
        meta.worker = Some("worker-0".to_string());
        other
            .update(&id, TaskStatus::Completed, meta)
            .await
            .unwrap();

        let record = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.metadata.worker.as_deref(), Some("worker-0"));
    }

    #[tokio::test]
    async fn test_update_unknown_record_fails() {
        let registry = InMemoryRegistry::new();
        let err = registry
            .update("task-missing", TaskStatus::Failed, metadata("T1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("task-missing"));
    }

    #[tokio::test]
    async fn test_list_filters_by_feature_and_status() {
        let registry = InMemoryRegistry::new();
        let a = registry.create("A", metadata("A")).await.unwrap();
        registry.create("B", metadata("B")).await.unwrap();
        let mut other = metadata("C");
        other.feature = "billing".to_string();
        registry.create("C", other).await.unwrap();
        registry
            .update(&a, TaskStatus::Completed, metadata("A"))
            .await
            .unwrap();

        assert_eq!(
            registry
                .list(&RegistryFilter::feature("auth"))
                .await
                .unwrap()
                .len(),
            2
        );
        let done = registry
            .list(&RegistryFilter {
                feature: Some("auth".to_string()),
                status: Some(TaskStatus::Completed),
            })
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, a);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_json_registry_serializes_concurrent_writers() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(JsonFileRegistry::open(&dir.path().join("registry.json")).unwrap());
        let creates = (0..8).map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .create(&format!("T{}", i), metadata(&format!("T{}", i)))
                    .await
                    .unwrap()
            })
        });
        let ids = futures::future::join_all(creates).await;
        assert!(ids.iter().all(|id| id.is_ok()));
        let records = registry.list(&RegistryFilter::feature("auth")).await.unwrap();
        assert_eq!(records.len(), 8);
    }
}
