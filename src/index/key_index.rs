//! Per-key index of history log records

use crate::core::record::RecordHandle;
use std::collections::HashMap;

/// Map from key to the handles of its records, in append order
#[derive(Debug, Default)]
pub struct KeyIndex {
    by_key: HashMap<String, Vec<RecordHandle>>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles must be added in append order.
    pub fn add(&mut self, key: &str, handle: RecordHandle) {
        match self.by_key.get_mut(key) {
            Some(handles) => {
                debug_assert!(handles.last().map_or(true, |last| last.seq < handle.seq));
                handles.push(handle);
            }
            None => {
                self.by_key.insert(key.to_string(), vec![handle]);
            }
        }
    }

    /// Handles for `key`, oldest first
    pub fn handles(&self, key: &str) -> &[RecordHandle] {
        self.by_key.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of distinct keys
    pub fn key_count(&self) -> usize {
        self.by_key.len()
    }
}
