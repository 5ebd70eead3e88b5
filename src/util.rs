//! Shared utility functions for the hive crate.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Result of running a shell command under a hard timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutcome {
    /// Exit code, or `None` when killed by a signal or the timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ShellOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Short human-readable reason for a failure.
    pub fn failure_detail(&self, limit: usize) -> String {
        if self.timed_out {
            return format!("timed out after {}s", self.duration.as_secs());
        }
        let stream = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        if stream.is_empty() {
            format!("exit {}", code)
        } else {
            format!("exit {}: {}", code, tail(stream, limit))
        }
    }
}

/// Run `command` with `sh -c` in `dir`, killing it once `limit` elapses.
pub async fn run_shell(
    command: &str,
    dir: &Path,
    env: &[(String, String)],
    limit: Duration,
) -> Result<ShellOutcome> {
    let started = Instant::now();
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", command))?;

    match timeout(limit, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.with_context(|| format!("Failed to wait for: {}", command))?;
            Ok(ShellOutcome {
                exit_code: output.status.code(),
                timed_out: false,
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration: started.elapsed(),
            })
        }
        // The child future is dropped here, which kills the process.
        Err(_) => Ok(ShellOutcome {
            exit_code: None,
            timed_out: true,
            stdout: String::new(),
            stderr: String::new(),
            duration: started.elapsed(),
        }),
    }
}

/// Last `limit` characters of `text`, on a char boundary.
pub fn tail(text: &str, limit: usize) -> &str {
    let count = text.chars().count();
    if count <= limit {
        return text;
    }
    let skip = count - limit;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_run_shell_success() {
        let dir = tempdir().unwrap();
        let out = run_shell("echo hello", dir.path(), &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_shell_failure_detail() {
        let dir = tempdir().unwrap();
        let out = run_shell("echo broken >&2; exit 3", dir.path(), &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.failure_detail(100), "exit 3: broken");
    }

    #[tokio::test]
    async fn test_run_shell_timeout() {
        let dir = tempdir().unwrap();
        let out = run_shell("sleep 10", dir.path(), &[], Duration::from_millis(200))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.failure_detail(100).starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_run_shell_passes_env_and_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let env = vec![("HIVE_TASK_ID".to_string(), "T1".to_string())];
        let out = run_shell(
            "test -f marker && echo $HIVE_TASK_ID",
            dir.path(),
            &env,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.trim(), "T1");
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
        assert_eq!(tail("héllo", 4), "éllo");
    }
}
