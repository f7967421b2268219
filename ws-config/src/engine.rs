//! Settings of the workspace engine process.
//!
//! This module defines the structure of the engine configuration file
//! (`~/.wsmaster/config.yaml` by default). Every field has a default, so an
//! empty or missing file yields a usable configuration; `WS_*` environment
//! variables override what the file says.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use ws_core::error::Result;

/// Root structure of the engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool running start, stop and snapshot operations
    #[serde(default)]
    pub pool: PoolConfig,

    /// Number of lock stripes shared by all workspace ids
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,

    /// System wide workspace policies
    #[serde(default)]
    pub defaults: PolicyDefaults,

    /// SQLite database holding workspace records
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory holding snapshot metadata
    #[serde(default = "default_snapshots_dir")]
    pub snapshots_dir: PathBuf,

    #[serde(default)]
    pub janitor: JanitorSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// At most `size` operations run at the same time
    #[default]
    Fixed,
    /// Every submitted operation runs immediately
    Cached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub kind: PoolKind,

    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Cooperative wait for running tasks on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Wait after cancelling the tasks that outlived the cooperative wait
    #[serde(default = "default_forced_shutdown_timeout")]
    pub forced_shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PolicyDefaults {
    /// Restore workspaces from their snapshot on start
    #[serde(default)]
    pub auto_restore: bool,

    /// Snapshot workspaces before stopping them
    #[serde(default)]
    pub auto_snapshot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JanitorSettings {
    /// Whether leftover temporary workspaces are removed on engine start
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Page size used while scanning for temporary workspaces
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `console`, `file` or `both`
    #[serde(default = "default_log_output")]
    pub output: String,

    /// `human` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Comma separated `key:value` span field filters, `*` matches any value
    #[serde(default)]
    pub tags: String,

    #[serde(default = "default_log_file_path")]
    pub file_path: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_lock_stripes() -> usize {
    16
}

fn default_pool_size() -> usize {
    num_cpus::get().clamp(2, 16)
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_forced_shutdown_timeout() -> u64 {
    60
}

fn default_page_size() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "console".to_string()
}

fn default_log_format() -> String {
    "human".to_string()
}

fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wsmaster")
}

fn default_db_path() -> PathBuf {
    base_dir().join("workspaces.db")
}

fn default_snapshots_dir() -> PathBuf {
    base_dir().join("snapshots")
}

fn default_log_file_path() -> PathBuf {
    base_dir().join("logs").join("wsmaster.log")
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kind: PoolKind::default(),
            size: default_pool_size(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            forced_shutdown_timeout_secs: default_forced_shutdown_timeout(),
        }
    }
}

impl PoolConfig {
    pub fn fixed(size: usize) -> Self {
        Self {
            kind: PoolKind::Fixed,
            size: size.max(1),
            ..Default::default()
        }
    }

    pub fn cached() -> Self {
        Self {
            kind: PoolKind::Cached,
            ..Default::default()
        }
    }
}

impl Default for JanitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            page_size: default_page_size(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
            format: default_log_format(),
            tags: String::new(),
            file_path: default_log_file_path(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            lock_stripes: default_lock_stripes(),
            defaults: PolicyDefaults::default(),
            db_path: default_db_path(),
            snapshots_dir: default_snapshots_dir(),
            janitor: JanitorSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Default location of the engine configuration file.
    pub fn default_path() -> PathBuf {
        base_dir().join("config.yaml")
    }

    /// Load the configuration from `path` (or the default location), then apply
    /// environment overrides. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);

        let mut config = if path.exists() {
            debug!("Loading engine config from: {}", path.display());
            Self::from_yaml(&std::fs::read_to_string(&path)?)?
        } else {
            debug!(
                "No engine config at {}, using defaults",
                path.display()
            );
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    /// Apply `WS_*` environment variables on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("WS_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("WS_SNAPSHOTS_DIR") {
            self.snapshots_dir = PathBuf::from(dir);
        }
        if let Some(size) = env_parse::<usize>("WS_POOL_SIZE") {
            self.pool.size = size.max(1);
        }
        if let Ok(kind) = std::env::var("WS_POOL_KIND") {
            match kind.to_lowercase().as_str() {
                "fixed" => self.pool.kind = PoolKind::Fixed,
                "cached" => self.pool.kind = PoolKind::Cached,
                other => debug!("Ignoring unknown WS_POOL_KIND '{}'", other),
            }
        }
        if let Some(restore) = env_parse::<bool>("WS_AUTO_RESTORE") {
            self.defaults.auto_restore = restore;
        }
        if let Some(snapshot) = env_parse::<bool>("WS_AUTO_SNAPSHOT") {
            self.defaults.auto_snapshot = snapshot;
        }
        if let Ok(level) = std::env::var("WS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(output) = std::env::var("WS_LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(format) = std::env::var("WS_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(tags) = std::env::var("WS_LOG_TAGS") {
            self.logging.tags = tags;
        }
        if let Ok(path) = std::env::var("WS_LOG_FILE_PATH") {
            self.logging.file_path = PathBuf::from(path);
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
