//! Configuration management for the mirror agent.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. `MIRROR_`-prefixed environment variables, `__` between section and
//!    key (e.g. `MIRROR_SYNC__RETENTION=5`)

use crate::utils::errors::{AgentError, Result};
use chrono::Duration;
use mirror_engine::fs::walker::WalkOptions;
use mirror_engine::{EngineSettings, MachineId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "MIRROR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub machine: MachineConfig,
    pub paths: PathsConfig,
    pub sync: SyncConfig,
    pub source_app: SourceAppConfig,
    pub log: LogConfig,
    pub api: ApiConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Name used in snapshot and lock file names (default: host name)
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Data directory of the source application
    pub source: PathBuf,

    /// Shared folder receiving snapshots, usually inside a cloud-synced folder
    pub shared_root: PathBuf,

    /// SQLite file holding this machine's sync record
    pub state_db: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Lock files older than this are considered abandoned
    pub stale_after_minutes: u64,

    /// Snapshots kept per machine
    pub retention: usize,

    /// Queue a sync when the agent starts
    pub sync_on_start: bool,

    /// Process watcher poll interval
    pub poll_interval_secs: u64,

    /// Wall-clock jump that counts as a wake from sleep
    pub wake_threshold_secs: u64,

    /// Entry names left out of snapshots, matched exactly
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceAppConfig {
    /// Exact process name of the application owning the source data
    pub process_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Entries kept in memory for the logs endpoint
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Desktop notification command, called with title and body
    /// (e.g. `notify-send`)
    pub command: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            shared_root: PathBuf::new(),
            state_db: PathBuf::from("mirror-agent.db"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_after_minutes: 4 * 60,
            retention: 3,
            sync_on_start: true,
            poll_interval_secs: 5,
            wake_threshold_secs: 60,
            exclude: WalkOptions::default().exclude_names,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            capacity: mirror_engine::log_buffer::DEFAULT_LOG_CAPACITY,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 9990,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.source.as_os_str().is_empty() {
            return Err(AgentError::Config("paths.source must be set".to_string()));
        }
        if self.paths.shared_root.as_os_str().is_empty() {
            return Err(AgentError::Config("paths.shared_root must be set".to_string()));
        }
        if self.paths.source == self.paths.shared_root || self.paths.shared_root.starts_with(&self.paths.source) {
            return Err(AgentError::Config(
                "paths.shared_root must not be inside paths.source".to_string(),
            ));
        }
        if self.source_app.process_name.trim().is_empty() {
            return Err(AgentError::Config("source_app.process_name must be set".to_string()));
        }
        if self.sync.retention == 0 {
            return Err(AgentError::Config("sync.retention must be at least 1".to_string()));
        }
        if self.sync.stale_after_minutes == 0 {
            return Err(AgentError::Config("sync.stale_after_minutes must be positive".to_string()));
        }
        if self.sync.poll_interval_secs == 0 {
            return Err(AgentError::Config("sync.poll_interval_secs must be positive".to_string()));
        }
        if self.log.capacity == 0 {
            return Err(AgentError::Config("log.capacity must be positive".to_string()));
        }

        Ok(())
    }

    /// Configured machine name, falling back to the host name.
    pub fn machine_id(&self) -> Result<MachineId> {
        let raw = match &self.machine.name {
            Some(name) => name.clone(),
            None => hostname::get()?
                .into_string()
                .map_err(|_| AgentError::Config("host name is not valid UTF-8".to_string()))?,
        };

        MachineId::new(&raw).map_err(|e| AgentError::Config(e.to_string()))
    }

    pub fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            exclude_names: self.sync.exclude.clone(),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let stale_after = i64::try_from(self.sync.stale_after_minutes)
            .ok()
            .and_then(Duration::try_minutes)
            .unwrap_or(Duration::MAX);

        EngineSettings {
            source: self.paths.source.clone(),
            shared_root: self.paths.shared_root.clone(),
            stale_after,
            retention: self.sync.retention,
        }
    }
}
