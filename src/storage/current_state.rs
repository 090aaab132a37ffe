//! Current-state table: latest value per key, persisted as a snapshot.
//!
//! The table is a materialized view over the history log. It is derived
//! data: when the snapshot is missing, unreadable, or does not cover every
//! log record, it is rebuilt by replaying the log.

use crate::error::{Error, Result};
use crate::storage::history_log::{for_each_record, HistoryLog, ScanStats};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic number: "TKVS"
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"TKVS";

/// Snapshot file format version
pub const SNAPSHOT_VERSION: u8 = 1;

/// magic (4) + version (1) + crc32 (4)
const SNAPSHOT_HEADER_LEN: usize = 9;

/// Persisted form of the current-state table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Number of history records reflected in `entries`
    pub covered_records: u64,
    pub entries: BTreeMap<String, Vec<u8>>,
}

impl Snapshot {
    /// Serialize to the on-disk snapshot format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let mut buf = Vec::with_capacity(SNAPSHOT_HEADER_LEN + payload.len());
        buf.extend_from_slice(SNAPSHOT_MAGIC);
        buf.push(SNAPSHOT_VERSION);
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Parse the on-disk snapshot format
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SNAPSHOT_HEADER_LEN {
            return Err(Error::Serialization("Snapshot too short".to_string()));
        }
        if &buf[0..4] != SNAPSHOT_MAGIC {
            return Err(Error::Serialization(format!(
                "Invalid snapshot magic: {:?}",
                &buf[0..4]
            )));
        }
        if buf[4] != SNAPSHOT_VERSION {
            return Err(Error::Serialization(format!(
                "Unsupported snapshot version: {}",
                buf[4]
            )));
        }

        let expected = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
        let payload = &buf[SNAPSHOT_HEADER_LEN..];
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(Error::Serialization(format!(
                "Snapshot checksum mismatch: expected {expected}, got {actual}"
            )));
        }

        Ok(bincode::deserialize(payload)?)
    }
}

/// Where the table's snapshot lives
pub trait SnapshotStore: Send + Sync {
    /// Load the last persisted snapshot, `None` if none was ever written
    fn load(&self) -> Result<Option<Snapshot>>;

    /// Replace the persisted snapshot as a unit
    fn persist(&mut self, snapshot: &Snapshot) -> Result<()>;
}

/// Snapshot kept in a single file, replaced atomically on every persist.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<Snapshot>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        Snapshot::decode(&bytes).map(Some)
    }

    fn persist(&mut self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = snapshot.encode()?;
        let tmp_path = self.tmp_path();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &self.path)?;

        // Make the rename itself durable. Not every platform can open a directory.
        if let Some(parent) = self.path.parent() {
            match File::open(parent) {
                Ok(dir) => {
                    if let Err(e) = dir.sync_all() {
                        warn!(
                            dir = %parent.display(),
                            error = %e,
                            "Failed to sync snapshot directory after rename"
                        );
                    }
                }
                Err(e) => debug!(
                    dir = %parent.display(),
                    error = %e,
                    "Cannot open snapshot directory to sync it"
                ),
            }
        }

        debug!(
            path = %self.path.display(),
            keys = snapshot.entries.len(),
            covered_records = snapshot.covered_records,
            "Persisted current-state snapshot"
        );
        Ok(())
    }
}

/// Snapshot held in memory only
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshot: Option<Snapshot>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }

    fn persist(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }
}

/// Outcome of loading the snapshot at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// No snapshot was found; the table starts empty
    Missing,
    /// Snapshot loaded, covering this many log records
    Loaded { covered_records: u64 },
    /// Snapshot could not be decoded; the table starts empty
    Corrupt { reason: String },
}

/// Latest value per key
pub struct CurrentStateTable {
    entries: HashMap<String, Vec<u8>>,
    covered_records: u64,
    pending_writes: u32,
    store: Box<dyn SnapshotStore>,
}

impl CurrentStateTable {
    /// Create an empty table persisting into `store`
    pub fn new(store: Box<dyn SnapshotStore>) -> Self {
        Self {
            entries: HashMap::new(),
            covered_records: 0,
            pending_writes: 0,
            store,
        }
    }

    /// Insert or overwrite the value of `key`.
    ///
    /// Each call stands for exactly one history record.
    pub fn put(&mut self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_string(), value);
        self.covered_records += 1;
        self.pending_writes += 1;
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of history records the table reflects
    pub fn covered_records(&self) -> u64 {
        self.covered_records
    }

    /// Puts applied since the last successful persist
    pub fn pending_writes(&self) -> u32 {
        self.pending_writes
    }

    /// Replace the in-memory table with the persisted snapshot.
    ///
    /// A missing or undecodable snapshot leaves the table empty. Errors reading
    /// an existing file are returned.
    pub fn load_from_disk(&mut self) -> Result<SnapshotStatus> {
        let status = match self.store.load() {
            Ok(Some(snapshot)) => {
                let covered_records = snapshot.covered_records;
                self.entries = snapshot.entries.into_iter().collect();
                self.covered_records = covered_records;
                SnapshotStatus::Loaded { covered_records }
            }
            Ok(None) => {
                self.entries.clear();
                self.covered_records = 0;
                SnapshotStatus::Missing
            }
            Err(Error::Serialization(reason)) => {
                warn!(%reason, "Current-state snapshot is unreadable, starting empty");
                self.entries.clear();
                self.covered_records = 0;
                SnapshotStatus::Corrupt { reason }
            }
            Err(e) => return Err(e),
        };
        self.pending_writes = 0;
        Ok(status)
    }

    /// Write the whole table as one snapshot
    pub fn persist(&mut self) -> Result<()> {
        let snapshot = Snapshot {
            covered_records: self.covered_records,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        self.store.persist(&snapshot)?;
        self.pending_writes = 0;
        Ok(())
    }

    /// Rebuild from scratch by replaying the whole log, keeping the last
    /// value seen per key. Does not persist.
    pub fn rebuild(&mut self, log: &dyn HistoryLog) -> Result<ScanStats> {
        let mut entries = HashMap::new();
        let stats = for_each_record(log.scan_all()?, |entry| {
            entries.insert(entry.record.key, entry.record.value);
        })?;

        self.entries = entries;
        self.covered_records = stats.records;
        self.pending_writes = 0;

        info!(
            keys = self.entries.len(),
            records = stats.records,
            corrupt_frames = stats.corrupt_frames,
            "Rebuilt current-state table from history log"
        );
        Ok(stats)
    }
}
