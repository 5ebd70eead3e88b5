//! Integration tests for hive
//!
//! These drive the binary the way an operator does: validate a graph, run it
//! against a real git repository with real worker processes, inspect and
//! control the recorded state.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use git2::{IndexAddOption, Repository, Signature};
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Helper to create a hive Command
fn hive() -> Command {
    cargo_bin_cmd!("hive")
}

/// A temporary git repository with one commit.
fn create_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    fs::write(dir.path().join("README.md"), "# fixture\n").unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
    dir
}

fn write_graph(dir: &Path, name: &str, json: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, json).unwrap();
    path
}

const TWO_LEVELS: &str = r#"{
  "feature": "demo",
  "tasks": [
    {"id": "A", "title": "first", "level": 1,
     "files": {"create": ["A.txt"]},
     "verification": {"command": "test -f A.txt", "timeout_seconds": 30}},
    {"id": "B", "title": "second", "level": 1,
     "files": {"create": ["B.txt"]},
     "verification": {"command": "test -f B.txt", "timeout_seconds": 30}},
    {"id": "C", "title": "third", "level": 2, "dependencies": ["A", "B"],
     "files": {"create": ["C.txt"], "read": ["A.txt", "B.txt"]},
     "verification": {"command": "test -f A.txt && test -f C.txt", "timeout_seconds": 30}}
  ]
}"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_hive_help() {
        hive()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("validate"))
            .stdout(predicate::str::contains("run"));
    }

    #[test]
    fn test_hive_version() {
        hive().arg("--version").assert().success();
    }
}

// =============================================================================
// Validation Tests
// =============================================================================

mod validate {
    use super::*;

    #[test]
    fn test_valid_graph_lists_levels() {
        let dir = TempDir::new().unwrap();
        let tasks = write_graph(dir.path(), "tasks.json", TWO_LEVELS);

        hive()
            .arg("validate")
            .arg(&tasks)
            .assert()
            .success()
            .stdout(predicate::str::contains("Valid task graph"))
            .stdout(predicate::str::contains("Level 1: A, B"))
            .stdout(predicate::str::contains("Level 2: C"));
    }

    #[test]
    fn test_ownership_overlap_names_both_tasks() {
        let dir = TempDir::new().unwrap();
        let tasks = write_graph(
            dir.path(),
            "tasks.json",
            r#"{"tasks": [
                {"id": "A", "title": "a", "level": 1, "files": {"create": ["shared.rs"]},
                 "verification": {"command": "true", "timeout_seconds": 5}},
                {"id": "B", "title": "b", "level": 1, "files": {"modify": ["shared.rs"]},
                 "verification": {"command": "true", "timeout_seconds": 5}}
            ]}"#,
        );

        hive()
            .arg("validate")
            .arg(&tasks)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Offending tasks: A, B"));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let dir = TempDir::new().unwrap();
        let tasks = write_graph(
            dir.path(),
            "tasks.json",
            r#"{"tasks": [
                {"id": "A", "title": "a", "level": 1, "dependencies": ["Z"],
                 "verification": {"command": "true", "timeout_seconds": 5}}
            ]}"#,
        );

        hive()
            .arg("validate")
            .arg(&tasks)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Z"));
    }

    #[test]
    fn test_invalid_graph_never_launches_workers() {
        let repo = create_repo();
        let tasks = write_graph(
            repo.path(),
            "tasks.json",
            r#"{"tasks": [
                {"id": "A", "title": "a", "level": 1, "dependencies": ["B"],
                 "verification": {"command": "true", "timeout_seconds": 5}},
                {"id": "B", "title": "b", "level": 1, "dependencies": ["A"],
                 "verification": {"command": "true", "timeout_seconds": 5}}
            ]}"#,
        );

        hive()
            .arg("--project")
            .arg(repo.path())
            .arg("run")
            .arg(&tasks)
            .assert()
            .failure();
        assert!(!repo.path().join(".hive/state/tasks.json").exists());
        assert!(!repo.path().join(".hive/worktrees").exists());
    }
}

// =============================================================================
// Operator Controls
// =============================================================================

mod controls {
    use super::*;

    #[test]
    fn test_status_without_runs() {
        let dir = TempDir::new().unwrap();

        hive()
            .arg("--project")
            .arg(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs recorded"));
    }

    #[test]
    fn test_stop_without_runs_fails() {
        let dir = TempDir::new().unwrap();

        hive()
            .arg("--project")
            .arg(dir.path())
            .args(["stop", "--feature", "demo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No run recorded for feature 'demo'"));
    }

    #[test]
    fn test_retry_requires_a_target() {
        let dir = TempDir::new().unwrap();

        hive()
            .arg("--project")
            .arg(dir.path())
            .arg("retry")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Nothing to retry"));
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".hive")).unwrap();
        fs::write(
            dir.path().join(".hive/hive.toml"),
            "[orchestrator]\nworkers = 0\n",
        )
        .unwrap();

        hive()
            .arg("--project")
            .arg(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }
}

// =============================================================================
// End-to-end Runs
// =============================================================================

mod end_to_end {
    use super::*;

    fn configure(repo: &Path, command: &str) {
        fs::create_dir_all(repo.join(".hive")).unwrap();
        fs::write(
            repo.join(".hive/hive.toml"),
            format!(
                r#"
[orchestrator]
workers = 2
poll_interval_ms = 50
sync_interval_ms = 500

[worker]
command = '{}'
heartbeat_interval_secs = 1

[retry]
base_delay_secs = 0
max_attempts = 2

[backpressure]
probe_interval_secs = 0
"#,
                command
            ),
        )
        .unwrap();
    }

    fn head_has(repo: &Path, name: &str) -> bool {
        let repo = Repository::open(repo).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        tree.get_name(name).is_some()
    }

    #[test]
    fn test_run_merges_both_levels() {
        let repo = create_repo();
        configure(repo.path(), r#"echo "$HIVE_TASK_ID" > "$HIVE_TASK_ID.txt""#);
        let tasks = write_graph(repo.path(), "tasks.json", TWO_LEVELS);

        hive()
            .arg("--project")
            .arg(repo.path())
            .arg("run")
            .arg(&tasks)
            .timeout(Duration::from_secs(120))
            .assert()
            .success()
            .stdout(predicate::str::contains("Level 1 merged"))
            .stdout(predicate::str::contains("Level 2 merged"))
            .stdout(predicate::str::contains("Feature 'demo' completed"));

        for file in ["A.txt", "B.txt", "C.txt"] {
            assert!(head_has(repo.path(), file), "{} not on the base branch", file);
        }

        hive()
            .arg("--project")
            .arg(repo.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Level 2 [merged]"))
            .stdout(predicate::str::contains("3 completed"));
    }

    #[test]
    fn test_failing_verification_blocks_and_reports() {
        let repo = create_repo();
        // B never creates its file, so its verification always fails.
        configure(
            repo.path(),
            r#"[ "$HIVE_TASK_ID" = B ] || echo ok > "$HIVE_TASK_ID.txt""#,
        );
        let tasks = write_graph(repo.path(), "tasks.json", TWO_LEVELS);

        hive()
            .arg("--project")
            .arg(repo.path())
            .arg("run")
            .arg(&tasks)
            .timeout(Duration::from_secs(120))
            .assert()
            .failure()
            .stdout(predicate::str::contains("blocked B after 2 attempts"))
            .stderr(predicate::str::contains("halted at level 1"));

        assert!(!head_has(repo.path(), "A.txt"));
        hive()
            .arg("--project")
            .arg(repo.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("blocked"));
    }
}
