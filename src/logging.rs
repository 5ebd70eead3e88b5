//! Tracing setup for the orchestrator and worker processes.
//!
//! The orchestrator logs to stderr and to a daily-rotated file under
//! `.hive/logs/`. Workers log to stderr only; the launcher already captures
//! their output into per-task log files.

use crate::config::HiveConfig;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
    /// Directory for the rotated log file; stderr only when unset
    pub file_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl LogSettings {
    pub fn from_config(config: &HiveConfig) -> Self {
        Self {
            level: config.log_level().to_string(),
            json: config.toml.logging.json,
            file_dir: Some(config.log_dir()),
            file_prefix: "hive.log".to_string(),
        }
    }

    pub fn stderr_only(mut self) -> Self {
        self.file_dir = None;
        self
    }

    /// `RUST_LOG` wins over the configured level.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("warn,hive={}", self.level)))
    }
}

/// Flushes the file writer when dropped. Hold it until the process exits.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

pub fn init(settings: &LogSettings) -> Result<LogGuard> {
    let mut layers = Vec::new();
    let stderr = fmt::layer().with_writer(std::io::stderr);
    if settings.json {
        layers.push(stderr.json().boxed());
    } else {
        layers.push(stderr.compact().with_target(false).boxed());
    }

    let mut guard = None;
    if let Some(dir) = &settings.file_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, &settings.file_prefix);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        let file = fmt::layer().with_writer(writer).with_ansi(false);
        if settings.json {
            layers.push(file.json().boxed());
        } else {
            layers.push(file.boxed());
        }
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(settings.filter())
        .with(layers)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(LogGuard { _file: guard })
}
