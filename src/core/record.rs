//! Records: the immutable unit of key history

use crate::core::temporal::Timestamp;
use serde::{Deserialize, Serialize};

/// One write to one key, as appended to the history log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Time assigned at upsert
    pub timestamp: Timestamp,
    /// Key the value belongs to
    pub key: String,
    /// Opaque value bytes, never interpreted by the store
    pub value: Vec<u8>,
}

impl Record {
    /// Create a new record
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Drop the key, keeping the versioned value
    pub fn into_version(self) -> Version {
        Version {
            timestamp: self.timestamp,
            value: self.value,
        }
    }
}

/// A single entry of a key's history, as returned by `diff`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub timestamp: Timestamp,
    pub value: Vec<u8>,
}

/// Location of an appended record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle {
    /// Zero-based append index across the whole log
    pub seq: u64,
    /// Byte offset of the frame (for in-memory logs, equal to `seq`)
    pub offset: u64,
}

/// A record together with where it lives in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub handle: RecordHandle,
    pub record: Record,
}
