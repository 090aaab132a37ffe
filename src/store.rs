//! Temporal store: the public API over the history log and current-state table.
//!
//! Every upsert is appended to the history log first. Only once that append
//! is durable is the current-state table updated and, per the configured
//! [`SnapshotPolicy`], its snapshot persisted.
//!
//! If persisting the snapshot fails after the log append succeeded, the
//! upsert returns an error for which
//! [`Error::is_logged_but_not_snapshotted`](crate::error::Error::is_logged_but_not_snapshotted) is true. The write is already
//! durable: `travel` and `diff` see it, and so does the table after the next
//! rebuild (which also runs automatically at startup).

use crate::config::{SnapshotPolicy, StoreConfig};
use crate::core::clock::{Clock, SystemClock};
use crate::core::record::{Record, Version};
use crate::core::temporal::Timestamp;
use crate::error::{Result, OP_UPSERT_PERSIST_SNAPSHOT};
use crate::storage::{
    CurrentStateTable, FileHistoryLog, FileSnapshotStore, HistoryLog, InMemoryHistoryLog,
    InMemorySnapshotStore, ScanStats, SnapshotStatus, SnapshotStore,
};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// What happened while opening the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// History log scan results from open
    pub log: ScanStats,
    /// State of the snapshot as found on disk
    pub snapshot: SnapshotStatus,
    /// Whether the current-state table had to be rebuilt from the log
    pub rebuilt: bool,
}

/// Store-wide counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub keys: usize,
    pub records: u64,
    /// Corrupt history frames skipped on open and by `travel`/`diff`
    pub corrupt_frames: u64,
}

/// Temporal key-value store
pub struct TemporalStore {
    /// Source of truth for every version of every key
    log: RwLock<Box<dyn HistoryLog>>,
    /// Latest value per key
    current: RwLock<CurrentStateTable>,
    /// Serializes upserts so log order and table order agree
    writer: Mutex<()>,
    clock: Arc<dyn Clock>,
    snapshot_policy: SnapshotPolicy,
    recovery: RecoveryReport,
}

impl TemporalStore {
    /// Open a file-backed store, recovering the current-state table if needed
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        info!(data_dir = %config.data_dir.display(), "Opening temporal store");

        let log = FileHistoryLog::open(config.log_path(), config.sync_writes)?;
        let log_stats = log.open_stats();
        let snapshots = FileSnapshotStore::new(config.snapshot_path());

        Self::recover(
            Box::new(log),
            Box::new(snapshots),
            config.snapshot_policy,
            log_stats,
        )
    }

    /// Create a store that keeps everything in memory
    pub fn in_memory() -> Self {
        Self {
            log: RwLock::new(Box::new(InMemoryHistoryLog::new())),
            current: RwLock::new(CurrentStateTable::new(Box::new(InMemorySnapshotStore::new()))),
            writer: Mutex::new(()),
            clock: Arc::new(SystemClock),
            snapshot_policy: SnapshotPolicy::EveryWrite,
            recovery: RecoveryReport {
                log: ScanStats::default(),
                snapshot: SnapshotStatus::Missing,
                rebuilt: false,
            },
        }
    }

    /// Assemble a store from custom storage backends, recovering as `open` does
    pub fn with_backends(
        log: Box<dyn HistoryLog>,
        snapshots: Box<dyn SnapshotStore>,
        snapshot_policy: SnapshotPolicy,
    ) -> Result<Self> {
        let log_stats = ScanStats {
            records: log.len(),
            ..ScanStats::default()
        };
        Self::recover(log, snapshots, snapshot_policy, log_stats)
    }

    /// Use `clock` to timestamp upserts
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn recover(
        log: Box<dyn HistoryLog>,
        snapshots: Box<dyn SnapshotStore>,
        snapshot_policy: SnapshotPolicy,
        log_stats: ScanStats,
    ) -> Result<Self> {
        let mut current = CurrentStateTable::new(snapshots);
        let snapshot = current.load_from_disk()?;

        let rebuilt = match &snapshot {
            SnapshotStatus::Loaded { covered_records } => *covered_records != log.len(),
            SnapshotStatus::Missing => !log.is_empty(),
            SnapshotStatus::Corrupt { .. } => true,
        };

        if rebuilt {
            warn!(
                ?snapshot,
                log_records = log.len(),
                "Current-state snapshot does not match history log, rebuilding"
            );
            current.rebuild(log.as_ref())?;
            current.persist()?;
        }

        info!(
            keys = current.len(),
            records = log.len(),
            rebuilt,
            "Temporal store ready"
        );

        Ok(Self {
            log: RwLock::new(log),
            current: RwLock::new(current),
            writer: Mutex::new(()),
            clock: Arc::new(SystemClock),
            snapshot_policy,
            recovery: RecoveryReport {
                log: log_stats,
                snapshot,
                rebuilt,
            },
        })
    }

    /// Set the current value of `key`, recording a new version.
    ///
    /// Returns the timestamp assigned to the write, usable with [`travel`](Self::travel).
    pub async fn upsert(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<Timestamp> {
        let _writer = self.writer.lock().await;

        let timestamp = self.clock.now();
        let record = Record::new(key, value, timestamp);

        let handle = self
            .log
            .write()
            .await
            .append(&record)
            .map_err(|e| e.context("upsert", key))?;

        let mut current = self.current.write().await;
        current.put(key, record.value);

        if self.snapshot_policy.should_persist(current.pending_writes()) {
            if let Err(e) = current.persist() {
                warn!(
                    key,
                    seq = handle.seq,
                    error = %e,
                    "Upsert is durable in the history log but the snapshot was not persisted"
                );
                return Err(e.context(OP_UPSERT_PERSIST_SNAPSHOT, key));
            }
        }

        debug!(key, seq = handle.seq, timestamp = timestamp.as_secs(), "Upserted");
        Ok(timestamp)
    }

    /// Current value of `key`
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.current.read().await.get(key).map(<[u8]>::to_vec)
    }

    /// Value `key` held at or before `at`
    pub async fn travel(&self, key: &str, at: Timestamp) -> Result<Option<Vec<u8>>> {
        let record = self
            .log
            .read()
            .await
            .latest_at(key, at)
            .map_err(|e| e.context("travel", key))?;
        Ok(record.map(|r| r.value))
    }

    /// Every version of `key`, oldest first
    pub async fn diff(&self, key: &str) -> Result<Vec<Version>> {
        let records = self
            .log
            .read()
            .await
            .history(key)
            .map_err(|e| e.context("diff", key))?;
        Ok(records.into_iter().map(Record::into_version).collect())
    }

    /// All keys with a current value, sorted
    pub async fn keys(&self) -> Vec<String> {
        self.current.read().await.keys()
    }

    pub async fn stats(&self) -> StoreStats {
        let (records, corrupt_frames) = {
            let log = self.log.read().await;
            (log.len(), log.corrupt_frames())
        };
        let keys = self.current.read().await.len();
        StoreStats {
            keys,
            records,
            corrupt_frames,
        }
    }

    /// What recovery found when the store was opened
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Rebuild the current-state table from the history log and persist it
    pub async fn rebuild(&self) -> Result<ScanStats> {
        let _writer = self.writer.lock().await;
        let log = self.log.read().await;
        let mut current = self.current.write().await;

        let stats = current
            .rebuild(&**log)
            .map_err(|e| e.context("rebuild", "*"))?;
        current.persist().map_err(|e| e.context("rebuild", "*"))?;
        Ok(stats)
    }

    /// Persist any snapshot writes deferred by the snapshot policy
    pub async fn flush(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut current = self.current.write().await;
        if current.pending_writes() > 0 {
            current.persist().map_err(|e| e.context("flush", "*"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::error::{Error, ErrorKind};
    use crate::storage::Snapshot;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn clock_at(secs: i64) -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Timestamp::from_secs(secs)))
    }

    fn open_at(dir: &TempDir, clock: &Arc<ManualClock>) -> TemporalStore {
        TemporalStore::open(StoreConfig::with_data_dir(dir.path()))
            .unwrap()
            .with_clock(clock.clone())
    }

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    fn as_pairs(versions: Vec<Version>) -> Vec<(i64, Vec<u8>)> {
        versions
            .into_iter()
            .map(|v| (v.timestamp.as_secs(), v.value))
            .collect()
    }

    #[tokio::test]
    async fn test_upsert_get_travel_diff() {
        let dir = TempDir::new().unwrap();
        let clock = clock_at(100);
        let store = open_at(&dir, &clock);

        let t1 = store.upsert("u1", "v1").await.unwrap();
        assert_eq!(t1.as_secs(), 100);

        clock.set(Timestamp::from_secs(200));
        let t2 = store.upsert("u1", "v2").await.unwrap();
        assert_eq!(t2.as_secs(), 200);

        assert_eq!(store.get("u1").await, Some(b"v2".to_vec()));
        assert_eq!(store.travel("u1", ts(150)).await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.travel("u1", ts(50)).await.unwrap(), None);
        assert_eq!(
            as_pairs(store.diff("u1").await.unwrap()),
            vec![(100, b"v1".to_vec()), (200, b"v2".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_absent_key_is_not_found() {
        let store = TemporalStore::in_memory();
        assert_eq!(store.get("nope").await, None);
        assert_eq!(store.travel("nope", ts(i64::MAX)).await.unwrap(), None);
        assert!(store.diff("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_travel_monotonicity() {
        let clock = clock_at(0);
        let store = TemporalStore::in_memory().with_clock(clock.clone());
        let times = [10, 20, 35, 50];

        for (i, t) in times.iter().enumerate() {
            clock.set(Timestamp::from_secs(*t));
            store.upsert("k", format!("v{i}")).await.unwrap();
        }

        assert_eq!(store.travel("k", ts(9)).await.unwrap(), None);
        for (i, window) in times.windows(2).enumerate() {
            for t in window[0]..window[1] {
                assert_eq!(
                    store.travel("k", ts(t)).await.unwrap(),
                    Some(format!("v{i}").into_bytes()),
                    "at {t}"
                );
            }
        }
        assert_eq!(store.travel("k", ts(1000)).await.unwrap(), Some(b"v3".to_vec()));
    }

    #[tokio::test]
    async fn test_same_second_writes_resolved_by_append_order() {
        let clock = clock_at(500);
        let store = TemporalStore::in_memory().with_clock(clock);

        store.upsert("k", "a").await.unwrap();
        store.upsert("k", "b").await.unwrap();
        store.upsert("k", "c").await.unwrap();

        assert_eq!(store.travel("k", ts(500)).await.unwrap(), Some(b"c".to_vec()));
        assert_eq!(
            as_pairs(store.diff("k").await.unwrap()),
            vec![(500, b"a".to_vec()), (500, b"b".to_vec()), (500, b"c".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_values_are_opaque_bytes() {
        let dir = TempDir::new().unwrap();
        let clock = clock_at(1);
        let value = b"{\"a\":\"tab\there\",\n\"nl\":true}\x00\xff".to_vec();
        {
            let store = open_at(&dir, &clock);
            store.upsert("key\twith\ndelims", value.clone()).await.unwrap();
        }

        let store = open_at(&dir, &clock);
        assert_eq!(store.get("key\twith\ndelims").await, Some(value.clone()));
        assert_eq!(store.travel("key\twith\ndelims", ts(1)).await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_reopen_uses_snapshot_without_rebuild() {
        let dir = TempDir::new().unwrap();
        let clock = clock_at(10);
        {
            let store = open_at(&dir, &clock);
            store.upsert("a", "1").await.unwrap();
            store.upsert("b", "2").await.unwrap();
        }

        let store = open_at(&dir, &clock);
        assert!(!store.recovery().rebuilt);
        assert_eq!(
            store.recovery().snapshot,
            SnapshotStatus::Loaded { covered_records: 2 }
        );
        assert_eq!(store.keys().await, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            store.stats().await,
            StoreStats {
                keys: 2,
                records: 2,
                corrupt_frames: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_rebuilt_on_open() {
        let dir = TempDir::new().unwrap();
        let clock = clock_at(10);
        let mut config = StoreConfig::with_data_dir(dir.path());
        config.snapshot_policy = SnapshotPolicy::EveryN(100);
        {
            // Snapshot writes are deferred, so nothing but the log is on disk.
            let store = TemporalStore::open(config.clone()).unwrap().with_clock(clock.clone());
            store.upsert("a", "1").await.unwrap();
            store.upsert("a", "2").await.unwrap();
        }

        let store = TemporalStore::open(config).unwrap();
        assert!(store.recovery().rebuilt);
        assert_eq!(store.get("a").await, Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_flush_persists_deferred_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::with_data_dir(dir.path());
        config.snapshot_policy = SnapshotPolicy::EveryN(100);
        {
            let store = TemporalStore::open(config.clone()).unwrap();
            store.upsert("a", "1").await.unwrap();
            store.flush().await.unwrap();
        }

        let store = TemporalStore::open(config).unwrap();
        assert!(!store.recovery().rebuilt);
        assert_eq!(store.get("a").await, Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_rebuilt_on_open() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::with_data_dir(dir.path());
        {
            let store = TemporalStore::open(config.clone()).unwrap();
            store.upsert("a", "1").await.unwrap();
        }
        std::fs::write(config.snapshot_path(), b"garbage").unwrap();

        let store = TemporalStore::open(config).unwrap();
        assert!(store.recovery().rebuilt);
        assert!(matches!(store.recovery().snapshot, SnapshotStatus::Corrupt { .. }));
        assert_eq!(store.get("a").await, Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_damaged_frame_length_keeps_later_keys() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::with_data_dir(dir.path());
        let clock = clock_at(100);
        {
            let store = open_at(&dir, &clock);
            store.upsert("a", "1").await.unwrap();
            store.upsert("b", "2").await.unwrap();
            store.upsert("c", "3").await.unwrap();
        }

        let first_len = crate::storage::frame::encode(&Record::new("a", "1", ts(100)))
            .unwrap()
            .len();
        let mut bytes = std::fs::read(config.log_path()).unwrap();
        let file_len = bytes.len() as u64;
        bytes[first_len + 1] ^= 0x01;
        std::fs::write(config.log_path(), &bytes).unwrap();

        let store = open_at(&dir, &clock);
        assert!(store.recovery().rebuilt);
        assert_eq!(store.recovery().log.truncated_bytes, 0);
        assert_eq!(std::fs::metadata(config.log_path()).unwrap().len(), file_len);

        assert_eq!(store.get("a").await, Some(b"1".to_vec()));
        assert_eq!(store.get("c").await, Some(b"3".to_vec()));
        assert_eq!(store.get("b").await, None);
        assert_eq!(store.travel("c", ts(100)).await.unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.stats().await.corrupt_frames, 1);
    }

    #[tokio::test]
    async fn test_corrupt_frame_skipped_by_travel_shows_in_stats() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::with_data_dir(dir.path());
        let clock = clock_at(100);
        let store = open_at(&dir, &clock);
        store.upsert("a", "v1").await.unwrap();
        clock.advance(10);
        store.upsert("a", "v2").await.unwrap();

        let mut bytes = std::fs::read(config.log_path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(config.log_path(), &bytes).unwrap();

        assert_eq!(store.travel("a", ts(200)).await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.diff("a").await.unwrap().len(), 1);
        assert_eq!(store.stats().await.corrupt_frames, 2);
    }

    #[tokio::test]
    async fn test_torn_log_tail_does_not_affect_earlier_keys() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::with_data_dir(dir.path());
        let clock = clock_at(100);
        {
            let store = open_at(&dir, &clock);
            store.upsert("a", "1").await.unwrap();
            clock.advance(10);
            store.upsert("b", "2").await.unwrap();
        }

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(config.log_path())
            .unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let store = open_at(&dir, &clock);
        assert_eq!(store.recovery().log.truncated_bytes, 6);
        assert!(!store.recovery().rebuilt);
        assert_eq!(store.get("a").await, Some(b"1".to_vec()));
        assert_eq!(store.travel("b", ts(110)).await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.diff("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent_and_matches_diff() {
        let store = TemporalStore::in_memory();
        for (key, value) in [("a", "1"), ("b", "2"), ("a", "3"), ("c", "4"), ("b", "5")] {
            store.upsert(key, value).await.unwrap();
        }

        store.rebuild().await.unwrap();
        let once: Vec<_> = collect_state(&store).await;
        store.rebuild().await.unwrap();
        let twice: Vec<_> = collect_state(&store).await;
        assert_eq!(once, twice);

        for (key, value) in once {
            let last = store.diff(&key).await.unwrap().pop().unwrap();
            assert_eq!(Some(last.value), value);
        }
    }

    async fn collect_state(store: &TemporalStore) -> Vec<(String, Option<Vec<u8>>)> {
        let mut state = Vec::new();
        for key in store.keys().await {
            let value = store.get(&key).await;
            state.push((key, value));
        }
        state
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_keep_table_in_step_with_log() {
        let store = Arc::new(TemporalStore::in_memory());

        let mut tasks = Vec::new();
        for writer in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    let key = if i % 2 == 0 { "shared".to_string() } else { format!("own:{writer}") };
                    store.upsert(&key, format!("{writer}-{i}")).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.stats().await.records, 200);
        assert_eq!(store.diff("shared").await.unwrap().len(), 8 * 13);
        for key in store.keys().await {
            let last = store.diff(&key).await.unwrap().pop().unwrap();
            assert_eq!(store.get(&key).await, Some(last.value), "key {key}");
        }
    }

    struct FailingLog;

    impl HistoryLog for FailingLog {
        fn append(&mut self, _record: &Record) -> Result<crate::core::RecordHandle> {
            Err(Error::Io(std::io::Error::other("disk unavailable")))
        }

        fn scan_all(&self) -> Result<crate::storage::LogScan<'_>> {
            Ok(Box::new(std::iter::empty::<Result<crate::core::LogEntry>>()))
        }

        fn len(&self) -> u64 {
            0
        }
    }

    #[tokio::test]
    async fn test_failed_log_append_leaves_table_unchanged() {
        let store = TemporalStore::with_backends(
            Box::new(FailingLog),
            Box::new(InMemorySnapshotStore::new()),
            SnapshotPolicy::EveryWrite,
        )
        .unwrap();

        let err = store.upsert("k", "v").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert!(!err.is_logged_but_not_snapshotted());
        assert_eq!(store.get("k").await, None);
    }

    struct FlakySnapshots {
        failing: Arc<AtomicBool>,
        inner: InMemorySnapshotStore,
    }

    impl SnapshotStore for FlakySnapshots {
        fn load(&self) -> Result<Option<Snapshot>> {
            self.inner.load()
        }

        fn persist(&mut self, snapshot: &Snapshot) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::other("snapshot disk full")));
            }
            self.inner.persist(snapshot)
        }
    }

    #[tokio::test]
    async fn test_failed_snapshot_after_append_is_reported_and_recoverable() {
        let failing = Arc::new(AtomicBool::new(false));
        let clock = clock_at(100);
        let store = TemporalStore::with_backends(
            Box::new(InMemoryHistoryLog::new()),
            Box::new(FlakySnapshots {
                failing: failing.clone(),
                inner: InMemorySnapshotStore::new(),
            }),
            SnapshotPolicy::EveryWrite,
        )
        .unwrap()
        .with_clock(clock);

        store.upsert("k", "v1").await.unwrap();

        failing.store(true, Ordering::SeqCst);
        let err = store.upsert("k", "v2").await.unwrap_err();
        assert!(err.is_logged_but_not_snapshotted());
        assert_eq!(err.kind(), ErrorKind::IoFailure);

        // The write is durable in the log.
        assert_eq!(store.travel("k", ts(100)).await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.diff("k").await.unwrap().len(), 2);

        failing.store(false, Ordering::SeqCst);
        store.rebuild().await.unwrap();
        assert_eq!(store.get("k").await, Some(b"v2".to_vec()));
    }
}
