//! Task definitions as read from the task graph document.

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Files touched by a task, split by access mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFiles {
    #[serde(default)]
    pub create: Vec<String>,
    #[serde(default)]
    pub modify: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
}

impl TaskFiles {
    /// Paths this task writes (create ∪ modify), normalized and deduplicated.
    pub fn owned(&self) -> BTreeSet<String> {
        self.create
            .iter()
            .chain(self.modify.iter())
            .map(|p| normalize_path(p))
            .collect()
    }
}

/// How a worker proves a task is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub command: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    300
}

impl Verification {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// A unit of work owned by exactly one worker at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub level: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: TaskFiles,
    pub verification: Verification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Task {
    pub fn new(id: &str, title: &str, level: u32, dependencies: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            level,
            dependencies,
            files: TaskFiles::default(),
            verification: Verification {
                command: "true".to_string(),
                timeout_seconds: default_timeout_seconds(),
            },
            description: None,
        }
    }

    pub fn with_files(mut self, create: &[&str], modify: &[&str]) -> Self {
        self.files.create = create.iter().map(|s| s.to_string()).collect();
        self.files.modify = modify.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_verification(mut self, command: &str, timeout_seconds: u64) -> Self {
        self.verification = Verification {
            command: command.to_string(),
            timeout_seconds,
        };
        self
    }
}

/// The raw task graph document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraphDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    pub tasks: Vec<Task>,
}

impl TaskGraphDocument {
    pub fn parse(content: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(content).map_err(ValidationError::Parse)
    }

    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|source| ValidationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }
}

/// Collapse `./` prefixes and duplicate separators so `./src//a.rs` and
/// `src/a.rs` compare equal.
pub fn normalize_path(path: &str) -> String {
    path.trim()
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_document() {
        let doc = TaskGraphDocument::parse(
            r#"{"tasks": [{"id": "T1", "title": "Types", "level": 1,
                "verification": {"command": "cargo check"}}]}"#,
        )
        .unwrap();
        assert_eq!(doc.tasks.len(), 1);
        let task = &doc.tasks[0];
        assert!(task.dependencies.is_empty());
        assert!(task.files.create.is_empty());
        assert_eq!(task.verification.timeout_seconds, 300);
        assert!(doc.feature.is_none());
    }

    #[test]
    fn test_parse_full_document() {
        let doc = TaskGraphDocument::parse(
            r#"{
              "feature": "auth",
              "tasks": [{
                "id": "T2", "title": "Service", "level": 2,
                "dependencies": ["T1"],
                "files": {"create": ["src/auth.rs"], "modify": ["src/lib.rs"], "read": ["src/types.rs"]},
                "verification": {"command": "cargo test auth", "timeout_seconds": 60}
              }]
            }"#,
        )
        .unwrap();
        assert_eq!(doc.feature.as_deref(), Some("auth"));
        let task = &doc.tasks[0];
        assert_eq!(task.dependencies, vec!["T1"]);
        assert_eq!(task.verification.timeout(), Duration::from_secs(60));
        assert_eq!(task.files.read, vec!["src/types.rs"]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = TaskGraphDocument::parse("{not json").unwrap_err();
        assert!(matches!(err, ValidationError::Parse(_)));
    }

    #[test]
    fn test_owned_paths_are_normalized() {
        let task = Task::new("T1", "x", 1, vec![]).with_files(&["./src//a.rs"], &["src/a.rs", "b.rs"]);
        let owned = task.files.owned();
        assert_eq!(owned.len(), 2);
        assert!(owned.contains("src/a.rs"));
        assert!(owned.contains("b.rs"));
    }
}
