//! Store configuration.
//!
//! Configuration is plain JSON; every field has a default so an empty
//! object is a valid config:
//!
//! ```json
//! {
//!   "data_dir": "./data",
//!   "log_file": "history.log",
//!   "snapshot_file": "current.snapshot",
//!   "snapshot_policy": { "every_n": 64 },
//!   "sync_writes": true
//! }
//! ```
//!
//! `TEMPORAL_KV_DATA_DIR` overrides `data_dir`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding [`StoreConfig::data_dir`]
pub const DATA_DIR_ENV: &str = "TEMPORAL_KV_DATA_DIR";

/// When the current-state snapshot is written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    /// Persist before every upsert is acknowledged
    #[default]
    EveryWrite,
    /// Persist once every `n` upserts and on flush. The log is still
    /// synced before each acknowledgement; recovery replays the rest.
    EveryN(u32),
}

impl SnapshotPolicy {
    /// Whether a table with `pending` unpersisted writes must persist now
    pub fn should_persist(&self, pending: u32) -> bool {
        match self {
            SnapshotPolicy::EveryWrite => pending > 0,
            SnapshotPolicy::EveryN(n) => pending >= *n,
        }
    }
}

/// Configuration for a file-backed [`TemporalStore`](crate::store::TemporalStore)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding both files
    pub data_dir: PathBuf,
    /// History log file name, relative to `data_dir`
    pub log_file: String,
    /// Snapshot file name, relative to `data_dir`
    pub snapshot_file: String,
    pub snapshot_policy: SnapshotPolicy,
    /// fsync the log after every append
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_file: "history.log".to_string(),
            snapshot_file: "current.snapshot".to_string(),
            snapshot_policy: SnapshotPolicy::default(),
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `data_dir`
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load from a JSON file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }

    /// Parse from a JSON string, then apply environment overrides
    pub fn parse(json: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_file.is_empty() || self.snapshot_file.is_empty() {
            return Err(Error::Configuration(
                "log_file and snapshot_file must not be empty".to_string(),
            ));
        }
        if self.log_file == self.snapshot_file {
            return Err(Error::Configuration(format!(
                "log_file and snapshot_file must differ, both are {:?}",
                self.log_file
            )));
        }
        if self.snapshot_policy == SnapshotPolicy::EveryN(0) {
            return Err(Error::Configuration(
                "snapshot_policy every_n must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_file)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.snapshot_file)
    }
}
