//! Time sources for assigning upsert timestamps

use crate::core::temporal::Timestamp;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the timestamp assigned to each upsert
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock, second resolution
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven clock for deterministic timelines
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            secs: AtomicI64::new(start.as_secs()),
        }
    }

    /// Jump to an absolute time. Moving backwards is allowed.
    pub fn set(&self, ts: Timestamp) {
        self.secs.store(ts.as_secs(), Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_secs(self.secs.load(Ordering::SeqCst))
    }
}
