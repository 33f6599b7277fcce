use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{wlog_debug, Error, Result};

pub const DEFAULT_MAX_PARALLEL: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 1;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_INTEGRATION_BRANCH: &str = "weft/integration";

/// Engine configuration. Every field has a default, so a partial
/// `weft.toml` is always valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub max_parallel: usize,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub task_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL.
    pub termination_grace_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Failure rate above which the rest of the batch runs sequentially.
    pub failure_rate_threshold: f64,
    pub circuit_min_samples: usize,
    pub cpu_threshold_percent: f32,
    pub memory_threshold_percent: f32,
    pub resource_check_interval_ms: u64,
    pub keep_failed_workspaces: bool,
    pub integration_branch: String,
    pub workspace_dir: Option<String>,
    pub state_dir: Option<String>,
    /// Worker program and arguments, run inside each workspace.
    pub command: Vec<String>,
    /// Regexes matched against a failed worker's log tail to mark the
    /// failure transient.
    pub transient_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_retries: DEFAULT_MAX_RETRIES,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            termination_grace_ms: 5000,
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
            failure_rate_threshold: 0.5,
            circuit_min_samples: 4,
            cpu_threshold_percent: 90.0,
            memory_threshold_percent: 90.0,
            resource_check_interval_ms: 5000,
            keep_failed_workspaces: false,
            integration_branch: DEFAULT_INTEGRATION_BRANCH.to_string(),
            workspace_dir: None,
            state_dir: None,
            command: Vec::new(),
            transient_patterns: default_transient_patterns(),
        }
    }
}

fn default_transient_patterns() -> Vec<String> {
    [
        r"(?i)rate limit",
        r"(?i)too many requests",
        r"(?i)connection (refused|reset)",
        r"(?i)timed? ?out",
        r"(?i)temporar(y|ily) unavailable",
        r"(?i)resource temporarily unavailable",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    pub fn weft_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".weft"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::weft_dir()?.join("weft.toml"))
    }

    /// Where workspaces are created.
    pub fn workspaces_dir(&self) -> Result<PathBuf> {
        match &self.workspace_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::weft_dir()?.join("worktrees")),
        }
    }

    /// Where logs, markers and task context files live.
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::weft_dir()?.join("state")),
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn resource_check_interval(&self) -> Duration {
        Duration::from_millis(self.resource_check_interval_ms.max(1))
    }

    /// Load from `~/.weft/weft.toml`, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        wlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            wlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        wlog_debug!(
            "Config loaded: max_parallel={}, max_retries={}, timeout={}s",
            config.max_parallel,
            config.max_retries,
            config.task_timeout_secs
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        wlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// # Errors
    /// Returns `Error::Validation` for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(Error::Validation("max_parallel must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(Error::Validation(
                "failure_rate_threshold must be between 0 and 1".into(),
            ));
        }
        if self.integration_branch.trim().is_empty() {
            return Err(Error::Validation("integration_branch must not be empty".into()));
        }
        if git2::Branch::name_is_valid(&self.integration_branch).ok() != Some(true) {
            return Err(Error::Validation(format!(
                "integration_branch '{}' is not a valid branch name",
                self.integration_branch
            )));
        }
        for pattern in &self.transient_patterns {
            regex::Regex::new(pattern).map_err(|e| Error::Pattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
