//! Terminal configuration.
//!
//! Load order (later overrides earlier):
//! 1. Default values
//! 2. TOML file (`kenpos.toml` under the platform config dir)
//! 3. `KENPOS_*` environment variables
//!
//! ```toml
//! [node]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Till 1"
//!
//! [store]
//! path = "/var/lib/kenpos/kenpos.db"
//!
//! [sync]
//! remote_url = "https://sync.example.com"
//! batch_size = 100
//! poll_interval_secs = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use kenpos_engine::{DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};

const CONFIG_FILE: &str = "kenpos.toml";
const DATABASE_FILE: &str = "kenpos.db";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "kenpos", "pos")
}

// =============================================================================
// Node
// =============================================================================

/// Identity of this terminal in replication traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Generated on first run if not provided.
    pub id: String,

    #[serde(default = "default_node_name")]
    pub name: String,
}

fn default_node_name() -> String {
    "POS Terminal".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            id: Uuid::new_v4().to_string(),
            name: default_node_name(),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Where and how the local document database is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file, created if missing.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits on a locked database (milliseconds).
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_database_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join(DATABASE_FILE))
        .unwrap_or_else(|| PathBuf::from(DATABASE_FILE))
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: default_database_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl StoreConfig {
    /// Store configuration for a database at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

// =============================================================================
// Sync
// =============================================================================

/// Replication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the remote replica (`http://` or `https://`).
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Bearer token sent to the remote.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Start continuous replication when the store opens.
    #[serde(default)]
    pub auto_start: bool,

    /// Revisions per pull or push batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on the idle wait between cycles (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Timeout for a single round-trip to the remote (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_poll_interval() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            remote_url: None,
            auth_token: None,
            auto_start: false,
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// Check the remote URL scheme, batch bounds and intervals.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref url) = self.remote_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(StoreError::Config(format!(
                    "remote_url must start with http:// or https://, got: {}",
                    url
                )));
            }
        }

        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(StoreError::Config(format!(
                "batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }

        // Zero would spin the idle wait and time out every request.
        if self.poll_interval_secs == 0 {
            return Err(StoreError::Config("poll_interval_secs must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(StoreError::Config("request_timeout_secs must be at least 1".into()));
        }

        Ok(())
    }
}

// =============================================================================
// Config
// =============================================================================

/// Complete terminal configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from file, environment and defaults.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                config = Self::from_file(&path)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&contents).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Write the configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Config(e.to_string()))?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))?;
        std::fs::write(path, contents).map_err(|e| StoreError::Config(e.to_string()))?;

        info!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.id.is_empty() {
            return Err(StoreError::Config("node id must not be empty".into()));
        }
        self.sync.validate()
    }

    /// Apply `KENPOS_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("KENPOS_NODE_ID") {
            debug!(node_id = %id, "Overriding node id from environment");
            self.node.id = id;
        }

        if let Some(name) = lookup("KENPOS_NODE_NAME") {
            self.node.name = name;
        }

        if let Some(path) = lookup("KENPOS_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.store.path = PathBuf::from(path);
        }

        if let Some(url) = lookup("KENPOS_REMOTE_URL") {
            debug!(url = %url, "Overriding remote url from environment");
            self.sync.remote_url = Some(url);
        }

        if let Some(token) = lookup("KENPOS_AUTH_TOKEN") {
            self.sync.auth_token = Some(token);
        }

        if let Some(value) = lookup("KENPOS_AUTO_START") {
            match value.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.sync.auto_start = true,
                "0" | "false" | "no" => self.sync.auto_start = false,
                _ => warn!(value = %value, "Unknown KENPOS_AUTO_START value"),
            }
        }

        if let Some(size) = lookup("KENPOS_BATCH_SIZE") {
            match size.parse::<usize>() {
                Ok(n) => self.sync.batch_size = n,
                Err(_) => warn!(value = %size, "Invalid KENPOS_BATCH_SIZE"),
            }
        }

        if let Some(secs) = lookup("KENPOS_POLL_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(n) => self.sync.poll_interval_secs = n,
                Err(_) => warn!(value = %secs, "Invalid KENPOS_POLL_INTERVAL_SECS"),
            }
        }
    }

    /// The default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }
}
