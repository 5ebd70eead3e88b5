//! Layered configuration for hive.
//!
//! Settings are read from `.hive/hive.toml`, then overridden by environment
//! variables (`HIVE_WORKERS`, `HIVE_LOG`, `HIVE_LAUNCHER`), then by CLI flags.
//! A missing file yields the defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! workers = 3
//! poll_interval_ms = 500
//! sync_interval_ms = 5000
//! launcher = "process"
//!
//! [worker]
//! command = "my-agent --task \"$HIVE_TASK_ID\""
//! heartbeat_interval_secs = 10
//! heartbeat_grace_secs = 60
//! max_stalls = 3
//! max_restarts = 2
//! immediate_failure_secs = 10
//! task_timeout_secs = 3600
//!
//! [worker.container]
//! image = "hive-worker:latest"
//! memory_mb = 4096
//! cpus = 2.0
//!
//! [retry]
//! strategy = "exponential"
//! base_delay_secs = 5
//! max_delay_secs = 300
//! max_attempts = 3
//!
//! [circuit_breaker]
//! failure_threshold = 3
//! window_secs = 300
//! cooldown_secs = 60
//! max_cooldown_secs = 900
//!
//! [backpressure]
//! window_size = 10
//! failure_threshold = 0.5
//! min_samples = 3
//! probe_interval_secs = 30
//!
//! [merge]
//! base_branch = "main"
//!
//! [logging]
//! level = "info"
//! json = false
//!
//! [[gates]]
//! name = "build"
//! command = "cargo build"
//! timeout_seconds = 600
//!
//! [[gates]]
//! name = "lint"
//! command = "cargo clippy"
//! required = false
//! ```

use crate::backpressure::BackpressurePolicy;
use crate::circuit::CircuitPolicy;
use crate::merge::GateConfig;
use crate::retry::{RetryPolicy, RetryStrategy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where worker processes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    /// Native subprocess on this host
    #[default]
    Process,
    /// Docker container
    Container,
}

impl std::fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LauncherKind::Process => write!(f, "process"),
            LauncherKind::Container => write!(f, "container"),
        }
    }
}

impl std::str::FromStr for LauncherKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(LauncherKind::Process),
            "container" | "docker" => Ok(LauncherKind::Container),
            _ => anyhow::bail!("Invalid launcher '{}'. Valid values: process, container", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Number of worker slots
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Control loop poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Registry reconciliation interval
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default)]
    pub launcher: LauncherKind,
}

fn default_workers() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_sync_interval_ms() -> u64 {
    5_000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            launcher: LauncherKind::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSection {
    #[serde(default = "default_container_image")]
    pub image: String,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub cpus: Option<f64>,
}

fn default_container_image() -> String {
    "hive-worker:latest".to_string()
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            image: default_container_image(),
            memory_mb: None,
            cpus: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Shell command that performs a task inside the worktree. When unset
    /// the worker only runs the task's verification command.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Silence longer than this marks a worker stalled
    #[serde(default = "default_heartbeat_grace_secs")]
    pub heartbeat_grace_secs: u64,
    /// Consecutive stalls before the worker is declared crashed
    #[serde(default = "default_max_stalls")]
    pub max_stalls: u32,
    /// Automatic restarts of a slot before it is abandoned
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// A non-zero exit sooner than this counts against the circuit breaker
    #[serde(default = "default_immediate_failure_secs")]
    pub immediate_failure_secs: u64,
    /// Hard per-task timeout
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default)]
    pub container: ContainerSection,
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_heartbeat_grace_secs() -> u64 {
    60
}

fn default_max_stalls() -> u32 {
    3
}

fn default_max_restarts() -> u32 {
    2
}

fn default_immediate_failure_secs() -> u64 {
    10
}

fn default_task_timeout_secs() -> u64 {
    3_600
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_grace_secs: default_heartbeat_grace_secs(),
            max_stalls: default_max_stalls(),
            max_restarts: default_max_restarts(),
            immediate_failure_secs: default_immediate_failure_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            container: ContainerSection::default(),
        }
    }
}

impl WorkerSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default)]
    pub strategy: RetryStrategy,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_secs() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            strategy: self.strategy,
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_circuit_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

fn default_circuit_failure_threshold() -> u32 {
    3
}

fn default_window_secs() -> u64 {
    300
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_max_cooldown_secs() -> u64 {
    900
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_circuit_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

impl CircuitBreakerSection {
    pub fn to_policy(&self) -> CircuitPolicy {
        CircuitPolicy {
            failure_threshold: self.failure_threshold,
            window_secs: self.window_secs,
            cooldown_secs: self.cooldown_secs,
            max_cooldown_secs: self.max_cooldown_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureSection {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Failure ratio in `0.0..=1.0` at which dispatch is throttled
    #[serde(default = "default_backpressure_threshold")]
    pub failure_threshold: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

fn default_window_size() -> usize {
    10
}

fn default_backpressure_threshold() -> f64 {
    0.5
}

fn default_min_samples() -> usize {
    3
}

fn default_probe_interval_secs() -> u64 {
    30
}

impl Default for BackpressureSection {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            failure_threshold: default_backpressure_threshold(),
            min_samples: default_min_samples(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl BackpressureSection {
    pub fn to_policy(&self) -> BackpressurePolicy {
        BackpressurePolicy {
            window_size: self.window_size,
            failure_threshold: self.failure_threshold,
            min_samples: self.min_samples,
            probe_interval: Duration::from_secs(self.probe_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeSection {
    /// Branch levels are merged into. Defaults to the branch checked out
    /// when the run starts.
    #[serde(default)]
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// The complete hive.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HiveToml {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
    #[serde(default)]
    pub backpressure: BackpressureSection,
    #[serde(default)]
    pub merge: MergeSection,
    #[serde(default)]
    pub logging: LoggingSection,
    /// Quality gates, run in order after each level merge
    #[serde(default)]
    pub gates: Vec<GateConfig>,
}

impl HiveToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse hive.toml")
    }

    /// Load `.hive/hive.toml`, or defaults if it does not exist.
    pub fn load_or_default(hive_dir: &Path) -> Result<Self> {
        let path = hive_dir.join("hive.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize hive.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(workers) = lookup("HIVE_WORKERS") {
            self.orchestrator.workers = workers
                .trim()
                .parse()
                .with_context(|| format!("Invalid HIVE_WORKERS value '{}'", workers))?;
        }
        if let Some(launcher) = lookup("HIVE_LAUNCHER") {
            self.orchestrator.launcher = launcher.parse()?;
        }
        if let Some(level) = lookup("HIVE_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Every invalid value, one message each.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.orchestrator.workers == 0 {
            problems.push("orchestrator.workers must be at least 1".to_string());
        }
        if self.orchestrator.poll_interval_ms == 0 {
            problems.push("orchestrator.poll_interval_ms must be positive".to_string());
        }
        if self.worker.heartbeat_interval_secs == 0 {
            problems.push("worker.heartbeat_interval_secs must be positive".to_string());
        }
        if self.worker.heartbeat_grace_secs <= self.worker.heartbeat_interval_secs {
            problems.push(
                "worker.heartbeat_grace_secs must exceed worker.heartbeat_interval_secs"
                    .to_string(),
            );
        }
        if self.worker.max_stalls == 0 {
            problems.push("worker.max_stalls must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            problems.push("retry.max_delay_secs must be >= retry.base_delay_secs".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            problems.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if self.circuit_breaker.max_cooldown_secs < self.circuit_breaker.cooldown_secs {
            problems.push(
                "circuit_breaker.max_cooldown_secs must be >= circuit_breaker.cooldown_secs"
                    .to_string(),
            );
        }
        if self.backpressure.window_size == 0 {
            problems.push("backpressure.window_size must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.backpressure.failure_threshold)
            || self.backpressure.failure_threshold == 0.0
        {
            problems.push("backpressure.failure_threshold must be in (0.0, 1.0]".to_string());
        }
        if self.backpressure.min_samples > self.backpressure.window_size {
            problems.push("backpressure.min_samples must not exceed window_size".to_string());
        }
        let mut names = std::collections::HashSet::new();
        for gate in &self.gates {
            if gate.name.trim().is_empty() || gate.command.trim().is_empty() {
                problems.push("every gate needs a name and a command".to_string());
            }
            if !names.insert(gate.name.as_str()) {
                problems.push(format!("duplicate gate name '{}'", gate.name));
            }
            if gate.timeout_seconds == 0 {
                problems.push(format!("gate '{}' has a zero timeout", gate.name));
            }
        }
        problems
    }
}

/// Resolved configuration: hive.toml merged with environment and CLI
/// overrides, plus the project paths derived from it.
#[derive(Debug, Clone)]
pub struct HiveConfig {
    pub project_dir: PathBuf,
    pub hive_dir: PathBuf,
    pub toml: HiveToml,
    pub verbose: bool,
}

impl HiveConfig {
    /// Load configuration for a project directory (file → environment).
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let hive_dir = project_dir.join(".hive");
        let mut toml = HiveToml::load_or_default(&hive_dir)?;
        toml.apply_env(|key| std::env::var(key).ok())?;
        Ok(Self {
            project_dir,
            hive_dir,
            toml,
            verbose: false,
        })
    }

    /// Apply CLI overrides on top of file and environment.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        workers: Option<usize>,
        launcher: Option<LauncherKind>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        if let Some(workers) = workers {
            config.toml.orchestrator.workers = workers;
        }
        if let Some(launcher) = launcher {
            config.toml.orchestrator.launcher = launcher;
        }
        Ok(config)
    }

    /// Fail with every invalid value listed.
    pub fn validate(&self) -> Result<()> {
        let problems = self.toml.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }

    pub fn workers(&self) -> usize {
        self.toml.orchestrator.workers
    }

    pub fn launcher(&self) -> LauncherKind {
        self.toml.orchestrator.launcher
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.toml.orchestrator.poll_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.toml.orchestrator.sync_interval_ms)
    }

    /// Effective log level: `--verbose` wins over the configured level.
    pub fn log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.toml.logging.level
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.hive_dir.join("state")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.hive_dir.join("registry.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.hive_dir.join("logs")
    }

    pub fn worker_log_dir(&self) -> PathBuf {
        self.log_dir().join("workers")
    }

    /// Root for a feature's worktrees.
    pub fn worktree_dir(&self, feature: &str) -> PathBuf {
        self.hive_dir.join("worktrees").join(feature)
    }

    pub fn config_file(&self) -> PathBuf {
        self.hive_dir.join("hive.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_empty_file_gives_defaults() {
        let toml = HiveToml::parse("").unwrap();
        assert_eq!(toml.orchestrator.workers, 3);
        assert_eq!(toml.orchestrator.launcher, LauncherKind::Process);
        assert_eq!(toml.retry.max_attempts, 3);
        assert_eq!(toml.retry.strategy, RetryStrategy::Exponential);
        assert_eq!(toml.circuit_breaker.failure_threshold, 3);
        assert_eq!(toml.backpressure.min_samples, 3);
        assert!(toml.gates.is_empty());
        assert!(toml.problems().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let toml = HiveToml::parse(
            r#"
            [orchestrator]
            workers = 5
            launcher = "container"

            [worker]
            command = "agent run"
            max_restarts = 4

            [worker.container]
            image = "img:1"
            cpus = 1.5

            [retry]
            strategy = "linear"
            base_delay_secs = 2

            [merge]
            base_branch = "develop"

            [[gates]]
            name = "build"
            command = "make"

            [[gates]]
            name = "lint"
            command = "make lint"
            required = false
            timeout_seconds = 30
            "#,
        )
        .unwrap();
        assert_eq!(toml.orchestrator.workers, 5);
        assert_eq!(toml.orchestrator.launcher, LauncherKind::Container);
        assert_eq!(toml.worker.command.as_deref(), Some("agent run"));
        assert_eq!(toml.worker.max_restarts, 4);
        assert_eq!(toml.worker.container.image, "img:1");
        assert_eq!(toml.worker.container.cpus, Some(1.5));
        assert_eq!(toml.retry.strategy, RetryStrategy::Linear);
        assert_eq!(toml.retry.to_policy().base_delay, Duration::from_secs(2));
        assert_eq!(toml.merge.base_branch.as_deref(), Some("develop"));
        assert_eq!(toml.gates.len(), 2);
        assert!(toml.gates[0].required);
        assert!(!toml.gates[1].required);
        assert_eq!(toml.gates[1].timeout_seconds, 30);
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        assert!(HiveToml::parse("[retry]\nstrategy = \"random\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = HiveToml::parse("[orchestrator]\nworkers = 2").unwrap();
        let env: HashMap<&str, &str> = [
            ("HIVE_WORKERS", "7"),
            ("HIVE_LAUNCHER", "docker"),
            ("HIVE_LOG", "trace"),
        ]
        .into_iter()
        .collect();
        toml.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(toml.orchestrator.workers, 7);
        assert_eq!(toml.orchestrator.launcher, LauncherKind::Container);
        assert_eq!(toml.logging.level, "trace");
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut toml = HiveToml::default();
        let err = toml
            .apply_env(|k| (k == "HIVE_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("HIVE_WORKERS"));
    }

    #[test]
    fn test_problems_are_collected() {
        let mut toml = HiveToml::default();
        toml.orchestrator.workers = 0;
        toml.backpressure.failure_threshold = 1.5;
        toml.gates.push(GateConfig::new("build", "make"));
        toml.gates.push(GateConfig::new("build", "make again"));
        let problems = toml.problems();
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().any(|p| p.contains("duplicate gate")));
    }

    #[test]
    fn test_cli_overrides_and_paths() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".hive")).unwrap();
        std::fs::write(
            dir.path().join(".hive/hive.toml"),
            "[orchestrator]\nworkers = 2\n",
        )
        .unwrap();
        let config = HiveConfig::with_cli_args(
            dir.path().to_path_buf(),
            true,
            Some(4),
            Some(LauncherKind::Process),
        )
        .unwrap();
        assert_eq!(config.workers(), 4);
        assert_eq!(config.log_level(), "debug");
        assert!(config.state_dir().ends_with(".hive/state"));
        assert!(config.worktree_dir("feat").ends_with(".hive/worktrees/feat"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        let mut toml = HiveToml::default();
        toml.gates.push(GateConfig::new("test", "cargo test"));
        toml.save(&path).unwrap();
        let loaded = HiveToml::load(&path).unwrap();
        assert_eq!(loaded.gates.len(), 1);
        assert_eq!(loaded.gates[0].name, "test");
    }
}
