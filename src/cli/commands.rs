//! CLI commands

use crate::config::StoreConfig;
use crate::core::temporal::Timestamp;
use crate::error::Result;
use chrono::DateTime;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Temporal-KV CLI
#[derive(Parser, Debug)]
#[command(name = "temporal-kv")]
#[command(about = "Temporal key-value store with time-travel reads")]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory, overriding the configuration
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Set the current value of a key
    Upsert {
        key: String,
        value: String,
    },
    /// Print the current value of a key
    Get {
        key: String,
    },
    /// Print the value a key held at or before a time
    Travel {
        key: String,
        /// Seconds since epoch or RFC 3339
        #[arg(value_parser = parse_timestamp)]
        timestamp: Timestamp,
    },
    /// Print every version of a key, oldest first
    Diff {
        key: String,
    },
    /// List keys
    Keys,
    /// Rebuild the current-state snapshot from the history log
    Rebuild,
}

impl Cli {
    /// Resolve the store configuration from `--config` and `--data-dir`
    pub fn store_config(&self) -> Result<StoreConfig> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::from_file(path)?,
            None => {
                let mut config = StoreConfig::default();
                config.apply_env_overrides();
                config
            }
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        Ok(config)
    }
}

/// Parse seconds since epoch or an RFC 3339 date-time
pub fn parse_timestamp(s: &str) -> std::result::Result<Timestamp, String> {
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(Timestamp::from_secs(secs));
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| Timestamp::from_secs(dt.timestamp()))
        .map_err(|e| format!("expected seconds since epoch or RFC 3339 time: {e}"))
}
