//! Configuration for a store handle
//!
//! A [`StoreConfig`] names the store file, the handle's origin and the
//! tuning knobs for the writer and the history tracker. It can be built in
//! code or read from TOML, where durations are written in milliseconds:
//!
//! ```toml
//! path = "/var/lib/app/logs.sqlite"
//! origin = "com.example.app"
//! busy_timeout = 5000
//!
//! [history]
//! poll_interval = 250
//! exclude_origins = ["com.example.widget"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use scribe_core::OriginId;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Default file name used by [`StoreConfig::in_directory`]
pub const DEFAULT_STORE_NAME: &str = "messages";

/// Configuration for a [`MessageStore`](crate::MessageStore) handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Location of the store file
    pub path: PathBuf,
    /// Origin tag for history entries; a random one is generated when absent
    pub origin: Option<OriginId>,
    /// How long a connection waits on a locked database
    #[serde(with = "duration_ms")]
    pub busy_timeout: Duration,
    /// Upper bound on appends folded into one write transaction
    pub max_write_batch: usize,
    /// History synchronization settings
    pub history: HistoryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(format!("./{DEFAULT_STORE_NAME}.sqlite")),
            origin: None,
            busy_timeout: Duration::from_secs(5),
            max_write_batch: 256,
            history: HistoryConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a configuration for the store file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Place `<name>.sqlite` inside `dir`, creating the directory
    pub fn in_directory(dir: impl AsRef<Path>, name: &str) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self::new(dir.join(format!("{name}.sqlite"))))
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, StorageError> {
        let config: StoreConfig =
            toml::from_str(text).map_err(|e| StorageError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, StorageError> {
        toml::to_string_pretty(self).map_err(|e| StorageError::serialization(e.to_string()))
    }

    /// Set the store file location
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the origin tag
    pub fn with_origin(mut self, origin: OriginId) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Set the busy timeout
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Set the group commit bound
    pub fn with_max_write_batch(mut self, max: usize) -> Self {
        self.max_write_batch = max;
        self
    }

    /// Set the history configuration
    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    /// Disable history synchronization
    pub fn without_history(mut self) -> Self {
        self.history.enabled = false;
        self
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.path.as_os_str().is_empty() {
            return Err(StorageError::config("store path is empty"));
        }
        if self.max_write_batch == 0 {
            return Err(StorageError::config("max_write_batch must be at least 1"));
        }
        self.history.validate()
    }
}

/// Settings for the history tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Whether the handle replays changes made by other handles
    pub enabled: bool,
    /// How often the database is checked for commits by other connections
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// History entries read per query during a merge cycle
    pub batch_size: usize,
    /// How long a silent handle's cursor still holds back trimming
    #[serde(with = "duration_ms")]
    pub cursor_ttl: Duration,
    /// Origins never replayed in addition to the handle's own
    pub exclude_origins: Vec<OriginId>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(500),
            batch_size: 512,
            cursor_ttl: Duration::from_secs(3600),
            exclude_origins: Vec::new(),
        }
    }
}

impl HistoryConfig {
    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the number of entries read per query
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the cursor time-to-live
    pub fn with_cursor_ttl(mut self, ttl: Duration) -> Self {
        self.cursor_ttl = ttl;
        self
    }

    /// Never replay entries written under `origin`
    pub fn excluding(mut self, origin: OriginId) -> Self {
        if !self.exclude_origins.contains(&origin) {
            self.exclude_origins.push(origin);
        }
        self
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.poll_interval.is_zero() {
            return Err(StorageError::config("history.poll_interval must be non-zero"));
        }
        if self.batch_size == 0 {
            return Err(StorageError::config("history.batch_size must be at least 1"));
        }
        // Heartbeats ride on the poll tick and must land well inside the TTL
        if self.poll_interval > self.cursor_ttl / 8 {
            return Err(StorageError::config(
                "history.poll_interval must be at most an eighth of history.cursor_ttl",
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
