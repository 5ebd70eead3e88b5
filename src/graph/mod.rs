//! Task graph model and level resolution.
//!
//! A task graph is a JSON document listing tasks with their dependencies,
//! owned files and verification command. The resolver validates it and
//! partitions it into levels: every task at level *n* depends only on tasks
//! at levels below *n*, and no two tasks at one level write the same path.
//!
//! ## Example
//!
//! ```
//! use hive::graph::{LevelResolver, Task};
//!
//! let graph = LevelResolver::new(vec![
//!     Task::new("T1", "Types", 1, vec![]).with_files(&["src/types.rs"], &[]),
//!     Task::new("T2", "Parser", 1, vec![]).with_files(&["src/parser.rs"], &[]),
//!     Task::new("T3", "Wire up", 2, vec!["T1".into(), "T2".into()])
//!         .with_files(&[], &["src/lib.rs"]),
//! ])
//! .resolve()
//! .unwrap();
//!
//! assert_eq!(graph.levels(), vec![1, 2]);
//! assert_eq!(graph.owner_of("src/parser.rs", 1), Some("T2"));
//! ```

mod builder;
mod task;

pub use builder::{LevelResolver, TaskGraph, TaskIndex};
pub use task::{Task, TaskFiles, TaskGraphDocument, Verification, normalize_path};

use crate::errors::ValidationError;
use std::path::Path;

/// Load, parse and validate a task graph file.
///
/// Returns the feature name declared in the document (if any) with the graph.
pub fn load(path: &Path) -> Result<(Option<String>, TaskGraph), ValidationError> {
    let doc = TaskGraphDocument::load(path)?;
    let graph = LevelResolver::new(doc.tasks).resolve()?;
    Ok((doc.feature, graph))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_valid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(
            &path,
            r#"{"feature": "billing", "tasks": [
                {"id": "A", "title": "a", "level": 1, "files": {"create": ["a.txt"]},
                 "verification": {"command": "test -f a.txt", "timeout_seconds": 5}},
                {"id": "B", "title": "b", "level": 2, "dependencies": ["A"],
                 "verification": {"command": "true", "timeout_seconds": 5}}
            ]}"#,
        )
        .unwrap();

        let (feature, graph) = load(&path).unwrap();
        assert_eq!(feature.as_deref(), Some("billing"));
        assert_eq!(graph.levels(), vec![1, 2]);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let err = load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ValidationError::Read { .. }));
    }

    #[test]
    fn test_single_invalid_task_rejects_whole_graph() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(
            &path,
            r#"{"tasks": [
                {"id": "A", "title": "a", "level": 1, "verification": {"command": "true"}},
                {"id": "B", "title": "b", "level": 1, "verification": {"command": "true"}},
                {"id": "C", "title": "c", "level": 2, "dependencies": ["Z"],
                 "verification": {"command": "true"}}
            ]}"#,
        )
        .unwrap();
        let err = load(&path).unwrap_err();
        assert_eq!(err.offending_tasks(), vec!["C"]);
    }
}
