use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::claims::DEFAULT_CLAIM_TIMEOUT;
use crate::orchestration::orchestrator::{
    OrchestratorConfig, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SWEEP_INTERVAL_MS,
};
use crate::orchestration::queue::{
    QueueConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_PRIORITY_BOOST, DEFAULT_STEAL_BATCH_SIZE,
    DEFAULT_STEAL_THRESHOLD, DEFAULT_TASK_TIMEOUT_SECS, DEFAULT_WORKER_COUNT,
};
use crate::{Error, Result};

/// `[queue]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub workers: usize,
    pub steal_batch_size: usize,
    pub steal_threshold: usize,
    pub task_timeout_secs: u64,
    pub max_attempts: u32,
    pub boost_stolen_priority: bool,
    pub max_priority_boost: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKER_COUNT,
            steal_batch_size: DEFAULT_STEAL_BATCH_SIZE,
            steal_threshold: DEFAULT_STEAL_THRESHOLD,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            boost_stolen_priority: true,
            max_priority_boost: DEFAULT_MAX_PRIORITY_BOOST,
        }
    }
}

/// `[orchestrator]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub poll_interval_ms: u64,
    pub claim_timeout_ms: u64,
    pub timeout_sweep_interval_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            claim_timeout_ms: DEFAULT_CLAIM_TIMEOUT.as_millis() as u64,
            timeout_sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

/// `[commands]` table: the shell collaborators used by `kiln run`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub generator: Option<String>,
    pub verify: Option<String>,
    pub sandbox_root: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueSettings,
    pub orchestrator: OrchestratorSettings,
    pub commands: CommandSettings,
}

impl Config {
    pub fn kiln_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".kiln"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::kiln_dir()?.join("kiln.toml"))
    }

    /// Load `~/.kiln/kiln.toml`, or defaults when it does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        tracing::debug!(
            workers = config.queue.workers,
            max_attempts = config.queue.max_attempts,
            generator = ?config.commands.generator,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                tracing::debug!(dir = %dir.display(), "creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Sandbox root for shell collaborators; the current directory by default.
    pub fn sandbox_root(&self) -> PathBuf {
        match &self.commands.sandbox_root {
            Some(dir) => expand_tilde(dir),
            None => PathBuf::from("."),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let q = &self.queue;
        let o = &self.orchestrator;
        OrchestratorConfig {
            queue: QueueConfig {
                worker_count: q.workers.max(1),
                steal_batch_size: q.steal_batch_size.max(1),
                steal_threshold: q.steal_threshold,
                task_timeout: Duration::from_secs(q.task_timeout_secs),
                max_attempts: q.max_attempts.max(1),
                boost_stolen_priority: q.boost_stolen_priority,
                max_priority_boost: q.max_priority_boost,
            },
            poll_interval: Duration::from_millis(o.poll_interval_ms.max(1)),
            claim_timeout: Duration::from_millis(o.claim_timeout_ms),
            sweep_interval: Duration::from_millis(o.timeout_sweep_interval_ms.max(1)),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
