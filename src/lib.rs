//! Temporal-KV: temporal key-value store
//!
//! Keeps the current value of every key and an append-only history of every
//! value a key has ever held.
//!
//! # Core Concepts
//!
//! - **History log**: durable, append-only sequence of `(timestamp, key, value)`
//!   records, the source of truth for every past value
//! - **Current-state table**: latest value per key, persisted as a snapshot and
//!   rebuilt from the log whenever the two disagree
//! - **Time travel**: the value a key held at or before a timestamp; ties on the
//!   same timestamp go to the record appended last
//!
//! Values are opaque bytes. The store never parses them.
//!
//! # Example
//!
//! ```no_run
//! use temporal_kv::prelude::*;
//!
//! # async fn example() -> temporal_kv::error::Result<()> {
//! let store = TemporalStore::open(StoreConfig::with_data_dir("./data"))?;
//!
//! let written_at = store.upsert("user:1", r#"{"status":"active"}"#).await?;
//! store.upsert("user:1", r#"{"status":"inactive"}"#).await?;
//!
//! let current = store.get("user:1").await;
//! let then = store.travel("user:1", written_at).await?;
//! let versions = store.diff("user:1").await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod storage;

/// Main store type
pub mod store;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::{SnapshotPolicy, StoreConfig};
    pub use crate::core::*;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::store::{RecoveryReport, StoreStats, TemporalStore};
}
