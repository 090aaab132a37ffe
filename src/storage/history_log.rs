//! History log: append-only, durable sequence of timestamped records.
//!
//! The log is the single source of truth for what a key held at any point in
//! time. Records are never rewritten or reordered once appended; ties between
//! equal timestamps are resolved by append order.
//!
//! Queries against [`FileHistoryLog`] use a per-key index of frame offsets
//! built on open and extended on every append, so `latest_at` walks only the
//! key's own records, newest first. The trait's default query methods are the
//! reference forward scan and cost O(history size) per call.

use crate::core::record::{LogEntry, Record, RecordHandle};
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::index::KeyIndex;
use crate::storage::frame::{self, Decoded, FRAME_HEADER_LEN, MAX_FRAME_LEN};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Lazy, restartable sequence of log entries in append order.
///
/// `Err(Error::CorruptRecord { .. })` items mark single skipped frames and do
/// not end the scan. Any other error is final.
pub type LogScan<'a> = Box<dyn Iterator<Item = Result<LogEntry>> + Send + 'a>;

/// Counters gathered while scanning a log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Well-formed records read
    pub records: u64,
    /// Damaged frames (or damaged runs, when a length could not be trusted) skipped
    pub corrupt_frames: u64,
    /// Bytes after the last valid frame, moved aside and removed on open
    pub truncated_bytes: u64,
}

/// Trait for history log implementations
pub trait HistoryLog: Send + Sync {
    /// Append a record after all previous ones. Durable on `Ok`.
    fn append(&mut self, record: &Record) -> Result<RecordHandle>;

    /// Scan every record from the beginning
    fn scan_all(&self) -> Result<LogScan<'_>>;

    /// Number of records appended so far
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Corrupt frames skipped so far, while opening and while answering queries
    fn corrupt_frames(&self) -> u64 {
        0
    }

    /// Value record of `key` at or before `at`: the latest-appended record
    /// for the key whose timestamp is `<= at`.
    fn latest_at(&self, key: &str, at: Timestamp) -> Result<Option<Record>> {
        let mut found = None;
        for_each_record(self.scan_all()?, |entry| {
            if entry.record.key == key && entry.record.timestamp <= at {
                found = Some(entry.record);
            }
        })?;
        Ok(found)
    }

    /// All records for `key` in append order
    fn history(&self, key: &str) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for_each_record(self.scan_all()?, |entry| {
            if entry.record.key == key {
                records.push(entry.record);
            }
        })?;
        Ok(records)
    }
}

/// Drive a scan to completion, counting corrupt frames instead of failing on them.
pub fn for_each_record(scan: LogScan<'_>, mut f: impl FnMut(LogEntry)) -> Result<ScanStats> {
    let mut stats = ScanStats::default();
    for item in scan {
        match item {
            Ok(entry) => {
                stats.records += 1;
                f(entry);
            }
            Err(Error::CorruptRecord { offset, reason }) => {
                stats.corrupt_frames += 1;
                warn!(offset, %reason, "Skipping corrupt history record");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(stats)
}

/// Frame reader over a log file, bounded by a committed length.
///
/// A frame whose checksum fails but whose length leads to another valid frame
/// (or to the end) is skipped by its length. A frame whose length cannot be
/// trusted is skipped by searching forward for the next valid frame. The scan
/// ends where no further valid frame can be found.
struct FrameScanner<R = File> {
    reader: BufReader<R>,
    /// Position of `reader` in the file
    pos: u64,
    offset: u64,
    limit: u64,
    next_seq: u64,
    done: bool,
}

impl FrameScanner<File> {
    fn open(path: &Path, limit: u64) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            pos: 0,
            offset: 0,
            limit,
            next_seq: 0,
            done: false,
        })
    }
}

impl<R: Read + Seek> FrameScanner<R> {
    /// Start of the first frame not yet consumed. Once the scan is over, the
    /// end of the readable prefix.
    fn offset(&self) -> u64 {
        self.offset
    }

    fn seek_to(&mut self, at: u64) -> std::io::Result<()> {
        if self.pos != at {
            self.reader.seek(SeekFrom::Start(at))?;
            self.pos = at;
        }
        Ok(())
    }

    /// Read and decode the frame starting at `at`
    fn frame_at(&mut self, at: u64) -> Result<Decoded> {
        let remaining = self.limit.saturating_sub(at);
        if remaining < FRAME_HEADER_LEN as u64 {
            return Ok(Decoded::Incomplete);
        }

        self.seek_to(at)?;
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.reader.read_exact(&mut header)?;
        self.pos += FRAME_HEADER_LEN as u64;

        let body_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if body_len > MAX_FRAME_LEN || (FRAME_HEADER_LEN + body_len) as u64 > remaining {
            return Ok(Decoded::Incomplete);
        }

        let mut buf = vec![0u8; FRAME_HEADER_LEN + body_len];
        buf[..FRAME_HEADER_LEN].copy_from_slice(&header);
        self.reader.read_exact(&mut buf[FRAME_HEADER_LEN..])?;
        self.pos += body_len as u64;
        Ok(frame::decode(&buf))
    }

    /// Offset of the first valid frame after `from`, if any
    fn resync(&mut self, from: u64) -> Result<Option<u64>> {
        if from >= self.limit {
            return Ok(None);
        }

        self.seek_to(from)?;
        let mut rest = Vec::new();
        (&mut self.reader).take(self.limit - from).read_to_end(&mut rest)?;
        self.pos = from + rest.len() as u64;

        let found = (1..rest.len()).find(|&i| {
            frame::could_start_frame(&rest[i..])
                && matches!(frame::decode(&rest[i..]), Decoded::Complete { .. })
        });
        Ok(found.map(|i| from + i as u64))
    }

    fn step(&mut self) -> Result<Option<Result<LogEntry>>> {
        let offset = self.offset;
        let reason = match self.frame_at(offset)? {
            Decoded::Complete { record, frame_len } => {
                self.offset += frame_len as u64;
                let handle = RecordHandle {
                    seq: self.next_seq,
                    offset,
                };
                self.next_seq += 1;
                return Ok(Some(Ok(LogEntry { handle, record })));
            }
            Decoded::Corrupt { frame_len, reason } => {
                let next = offset + frame_len as u64;
                if next == self.limit || matches!(self.frame_at(next)?, Decoded::Complete { .. }) {
                    self.offset = next;
                    return Ok(Some(Err(Error::CorruptRecord { offset, reason })));
                }
                reason
            }
            Decoded::Incomplete => "frame length runs past the end of the log".to_string(),
        };

        match self.resync(offset)? {
            Some(next) => {
                self.offset = next;
                Ok(Some(Err(Error::CorruptRecord {
                    offset,
                    reason: format!("{reason}; skipped {} bytes to the next valid frame", next - offset),
                })))
            }
            None => Ok(None),
        }
    }
}

impl<R: Read + Seek> Iterator for FrameScanner<R> {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.step() {
            Ok(Some(item)) => Some(item),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Copy everything in `file` from `start` onward into a sibling
/// `<log>.corrupt-<start>` file, synced before returning.
fn quarantine_tail(path: &Path, file: &mut File, start: u64) -> Result<PathBuf> {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".corrupt-{start}"));
    let target = path.with_file_name(name);

    file.seek(SeekFrom::Start(start))?;
    let mut out = File::create(&target)?;
    std::io::copy(file, &mut out)?;
    out.sync_all()?;
    Ok(target)
}

/// Disk-backed history log: a single file of frames.
pub struct FileHistoryLog {
    path: PathBuf,
    file: File,
    /// Length of the committed, fully written prefix
    end: u64,
    next_seq: u64,
    index: KeyIndex,
    sync_writes: bool,
    open_stats: ScanStats,
    /// Where the unreadable tail found on open was moved
    quarantined: Option<PathBuf>,
    /// Corrupt frames skipped while answering queries
    corrupt_reads: AtomicU64,
    #[cfg(test)]
    fail_next_write_after: Option<usize>,
}

impl FileHistoryLog {
    /// Open (or create) the log at `path`.
    ///
    /// Bytes after the last valid frame (a torn trailing write, or a tail
    /// damaged beyond resynchronization) are copied to a
    /// `<log>.corrupt-<offset>` file next to the log and then truncated, so
    /// later appends stay readable.
    pub fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let mut index = KeyIndex::new();
        let mut scanner = FrameScanner::open(&path, file_len)?;
        let mut stats = for_each_record(Box::new(scanner.by_ref()), |entry| {
            index.add(&entry.record.key, entry.handle);
        })?;
        let end = scanner.offset();

        let mut quarantined = None;
        if end < file_len {
            stats.truncated_bytes = file_len - end;
            let target = quarantine_tail(&path, &mut file, end)?;
            warn!(
                path = %path.display(),
                valid_len = end,
                truncated_bytes = stats.truncated_bytes,
                quarantine = %target.display(),
                "Truncating unreadable tail of history log"
            );
            file.set_len(end)?;
            file.sync_data()?;
            quarantined = Some(target);
        }

        info!(
            path = %path.display(),
            records = stats.records,
            keys = index.key_count(),
            corrupt_frames = stats.corrupt_frames,
            "Opened history log"
        );

        Ok(Self {
            path,
            file,
            end,
            next_seq: scanner.next_seq,
            index,
            sync_writes,
            open_stats: stats,
            quarantined,
            corrupt_reads: AtomicU64::new(0),
            #[cfg(test)]
            fail_next_write_after: None,
        })
    }

    /// What was found when the log was opened
    pub fn open_stats(&self) -> ScanStats {
        self.open_stats
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File holding the tail removed on open, if there was one
    pub fn quarantined(&self) -> Option<&Path> {
        self.quarantined.as_deref()
    }

    fn write_frame(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        #[cfg(test)]
        if let Some(n) = self.fail_next_write_after.take() {
            self.file.write_all(&bytes[..n.min(bytes.len())])?;
            return Err(std::io::Error::other("injected write failure"));
        }
        self.file.write_all(bytes)?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn read_at(&self, file: &mut File, handle: RecordHandle) -> Result<Record> {
        file.seek(SeekFrom::Start(handle.offset))?;
        let mut scanner = FrameScanner {
            reader: BufReader::new(file),
            pos: handle.offset,
            offset: handle.offset,
            limit: self.end,
            next_seq: handle.seq,
            done: false,
        };
        match scanner.frame_at(handle.offset)? {
            Decoded::Complete { record, .. } => Ok(record),
            Decoded::Corrupt { reason, .. } => Err(Error::CorruptRecord {
                offset: handle.offset,
                reason,
            }),
            Decoded::Incomplete => Err(Error::CorruptRecord {
                offset: handle.offset,
                reason: "indexed frame is no longer readable".to_string(),
            }),
        }
    }

    /// Read the indexed records of `key`, in the order `handles` yields them,
    /// skipping frames that fail validation.
    fn read_indexed<'h>(
        &self,
        handles: impl Iterator<Item = &'h RecordHandle>,
        mut keep_going: impl FnMut(Record) -> bool,
    ) -> Result<()> {
        let mut file = File::open(&self.path)?;
        for handle in handles {
            match self.read_at(&mut file, *handle) {
                Ok(record) => {
                    if !keep_going(record) {
                        break;
                    }
                }
                Err(Error::CorruptRecord { offset, reason }) => {
                    self.corrupt_reads.fetch_add(1, Ordering::Relaxed);
                    warn!(offset, %reason, "Skipping corrupt history record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl HistoryLog for FileHistoryLog {
    fn append(&mut self, record: &Record) -> Result<RecordHandle> {
        let bytes = frame::encode(record)?;
        let offset = self.end;

        if let Err(e) = self.write_frame(offset, &bytes) {
            // Leave no partial frame behind for the next append to land after.
            if let Err(rollback) = self.file.set_len(offset) {
                warn!(offset, error = %rollback, "Failed to roll back partial append");
            }
            return Err(Error::Io(e));
        }

        let handle = RecordHandle {
            seq: self.next_seq,
            offset,
        };
        self.end += bytes.len() as u64;
        self.next_seq += 1;
        self.index.add(&record.key, handle);

        debug!(key = %record.key, seq = handle.seq, offset, "Appended history record");
        Ok(handle)
    }

    fn scan_all(&self) -> Result<LogScan<'_>> {
        Ok(Box::new(FrameScanner::open(&self.path, self.end)?))
    }

    fn len(&self) -> u64 {
        self.next_seq
    }

    fn corrupt_frames(&self) -> u64 {
        self.open_stats.corrupt_frames + self.corrupt_reads.load(Ordering::Relaxed)
    }

    fn latest_at(&self, key: &str, at: Timestamp) -> Result<Option<Record>> {
        let handles = self.index.handles(key);
        if handles.is_empty() {
            return Ok(None);
        }

        let mut found = None;
        self.read_indexed(handles.iter().rev(), |record| {
            if record.timestamp <= at {
                found = Some(record);
                false
            } else {
                true
            }
        })?;
        Ok(found)
    }

    fn history(&self, key: &str) -> Result<Vec<Record>> {
        let handles = self.index.handles(key);
        let mut records = Vec::with_capacity(handles.len());
        self.read_indexed(handles.iter(), |record| {
            records.push(record);
            true
        })?;
        Ok(records)
    }
}

/// In-memory implementation of the history log
#[derive(Debug, Default)]
pub struct InMemoryHistoryLog {
    records: Vec<Record>,
}

impl InMemoryHistoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryLog for InMemoryHistoryLog {
    fn append(&mut self, record: &Record) -> Result<RecordHandle> {
        let seq = self.records.len() as u64;
        self.records.push(record.clone());
        Ok(RecordHandle { seq, offset: seq })
    }

    fn scan_all(&self) -> Result<LogScan<'_>> {
        Ok(Box::new(self.records.iter().enumerate().map(|(i, record)| {
            Ok::<_, Error>(LogEntry {
                handle: RecordHandle {
                    seq: i as u64,
                    offset: i as u64,
                },
                record: record.clone(),
            })
        })))
    }

    fn len(&self) -> u64 {
        self.records.len() as u64
    }

    fn latest_at(&self, key: &str, at: Timestamp) -> Result<Option<Record>> {
        Ok(self
            .records
            .iter()
            .rev()
            .find(|r| r.key == key && r.timestamp <= at)
            .cloned())
    }
}
