//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled               |
//! |-----------|--------------------------------|
//! | `run`     | `Validate`, `Run`, `Worker`    |
//! | `status`  | `Status`                       |
//! | `control` | `Retry`, `Stop`                |

pub mod control;
pub mod run;
pub mod status;

pub use control::{cmd_retry, cmd_stop};
pub use run::{RunOptions, cmd_run, cmd_validate, cmd_worker};
pub use status::cmd_status;

use anyhow::{Context, Result};
use hive::config::HiveConfig;
use hive::state::StateStore;
use std::path::{Path, PathBuf};

use super::Cli;

/// Configuration for commands that take no per-run overrides.
pub fn load_config(cli: &Cli, project_dir: PathBuf) -> Result<HiveConfig> {
    let config = HiveConfig::with_cli_args(project_dir, cli.verbose, None, None)?;
    config.validate()?;
    Ok(config)
}

/// The feature to act on: the explicit one, or the only one with state.
pub fn resolve_feature(config: &HiveConfig, explicit: Option<&str>) -> Result<String> {
    if let Some(feature) = explicit {
        return Ok(feature.to_string());
    }
    let features = known_features(&config.state_dir())?;
    match features.as_slice() {
        [only] => Ok(only.clone()),
        [] => anyhow::bail!("No runs recorded in {}", config.state_dir().display()),
        many => anyhow::bail!(
            "Several features have state ({}); pick one with --feature",
            many.join(", ")
        ),
    }
}

fn known_features(state_dir: &Path) -> Result<Vec<String>> {
    if !state_dir.exists() {
        return Ok(Vec::new());
    }
    let mut features = Vec::new();
    for entry in std::fs::read_dir(state_dir)
        .with_context(|| format!("Failed to read {}", state_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "json")
            && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
        {
            features.push(stem.to_string());
        }
    }
    features.sort();
    Ok(features)
}

/// Open an existing run's state, failing if there is none.
pub fn open_existing(config: &HiveConfig, feature: &str) -> Result<StateStore> {
    let store = StateStore::open(&config.state_dir(), feature)?;
    if !store.exists() {
        anyhow::bail!("No run recorded for feature '{}'", feature);
    }
    Ok(store)
}
