//! Temporal data types and time handling

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point in time with second precision, as written into the history log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    secs: i64,
}

impl Timestamp {
    /// Create a timestamp from seconds since Unix epoch
    pub fn from_secs(secs: i64) -> Self {
        Self { secs }
    }

    /// Get current wall-clock timestamp
    pub fn now() -> Self {
        Self {
            secs: Utc::now().timestamp(),
        }
    }

    /// Get seconds since Unix epoch
    pub fn as_secs(&self) -> i64 {
        self.secs
    }

    /// Convert to chrono DateTime
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.secs, 0)
    }

    /// Add a number of seconds
    pub fn add_secs(&self, secs: i64) -> Self {
        Self {
            secs: self.secs.saturating_add(secs),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}s", self.secs),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            secs: dt.timestamp(),
        }
    }
}

impl From<i64> for Timestamp {
    fn from(secs: i64) -> Self {
        Self::from_secs(secs)
    }
}
