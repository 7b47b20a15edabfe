//! Commit log sink and a write-ahead-log file implementation
//!
//! The transaction managers report every installed write through the
//! `CommitLog` trait during commit. A database without a log skips those
//! calls entirely, so logging never decides the outcome of a commit.
//!
//! File format of `WalLog`:
//! ```text
//! +----------------+----------------+----------------+
//! | Header (10B)   | Frame 1        | Frame 2 ...    |
//! +----------------+----------------+----------------+
//!
//! Header:
//! - magic: 4 bytes "TCWL"
//! - version: 2 bytes
//! - crc32 of the 6 bytes above: 4 bytes
//!
//! Frame:
//! - payload_len: 4 bytes
//! - payload: bincode-serialized LogRecord
//! - crc32 of payload: 4 bytes
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{Cid, ItemPointer};
use crate::{CcError, Result};

const WAL_MAGIC: &[u8; 4] = b"TCWL";
const WAL_VERSION: u16 = 1;
const WAL_HEADER_SIZE: usize = 10;
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Commit Log Trait
// ============================================================================

/// Receiver of committed writes, called from the commit install phase
pub trait CommitLog: Send + Sync {
    fn log_begin(&self, commit_id: Cid);
    fn log_insert(&self, commit_id: Cid, location: ItemPointer);
    fn log_update(&self, commit_id: Cid, old: ItemPointer, new: ItemPointer);
    fn log_delete(&self, commit_id: Cid, location: ItemPointer);
    fn log_commit(&self, commit_id: Cid);
}

/// One logged event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    Begin { commit_id: Cid },
    Insert { commit_id: Cid, location: ItemPointer },
    Update { commit_id: Cid, old: ItemPointer, new: ItemPointer },
    Delete { commit_id: Cid, location: ItemPointer },
    Commit { commit_id: Cid },
}

impl LogRecord {
    pub fn commit_id(&self) -> Cid {
        match *self {
            LogRecord::Begin { commit_id }
            | LogRecord::Insert { commit_id, .. }
            | LogRecord::Update { commit_id, .. }
            | LogRecord::Delete { commit_id, .. }
            | LogRecord::Commit { commit_id } => commit_id,
        }
    }
}

// ============================================================================
// In-Memory Log
// ============================================================================

/// Keeps records in memory; used for inspection and tests
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Commit ids of fully logged transactions, in log order
    pub fn committed(&self) -> Vec<Cid> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                LogRecord::Commit { commit_id } => Some(*commit_id),
                _ => None,
            })
            .collect()
    }

    fn push(&self, record: LogRecord) {
        self.records.lock().push(record);
    }
}

impl CommitLog for MemoryLog {
    fn log_begin(&self, commit_id: Cid) {
        self.push(LogRecord::Begin { commit_id });
    }

    fn log_insert(&self, commit_id: Cid, location: ItemPointer) {
        self.push(LogRecord::Insert { commit_id, location });
    }

    fn log_update(&self, commit_id: Cid, old: ItemPointer, new: ItemPointer) {
        self.push(LogRecord::Update { commit_id, old, new });
    }

    fn log_delete(&self, commit_id: Cid, location: ItemPointer) {
        self.push(LogRecord::Delete { commit_id, location });
    }

    fn log_commit(&self, commit_id: Cid) {
        self.push(LogRecord::Commit { commit_id });
    }
}

// ============================================================================
// File WAL
// ============================================================================

fn header_bytes() -> [u8; WAL_HEADER_SIZE] {
    let mut buf = [0u8; WAL_HEADER_SIZE];
    buf[0..4].copy_from_slice(WAL_MAGIC);
    buf[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
    let checksum = crc32fast::hash(&buf[0..6]);
    buf[6..10].copy_from_slice(&checksum.to_le_bytes());
    buf
}

fn check_header(buf: &[u8; WAL_HEADER_SIZE]) -> Result<()> {
    if &buf[0..4] != WAL_MAGIC {
        return Err(CcError::InvalidLogFile("bad magic".to_string()));
    }
    let stored = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
    if stored != crc32fast::hash(&buf[0..6]) {
        return Err(CcError::ChecksumMismatch(0));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != WAL_VERSION {
        return Err(CcError::InvalidLogFile(format!("unsupported version {}", version)));
    }
    Ok(())
}

/// Append-only commit log file
///
/// Frames are buffered and flushed at every `log_commit`. I/O failures are
/// reported through `log::error!` and latch `has_failed()`; they never fail
/// the transaction that is installing.
pub struct WalLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    sync_on_commit: bool,
    records_written: AtomicU64,
    failed: AtomicBool,
}

impl WalLog {
    /// Open (or create) a log file for appending
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            file.write_all(&header_bytes())?;
            file.flush()?;
        } else {
            let mut header = [0u8; WAL_HEADER_SIZE];
            File::open(&path)?.read_exact(&mut header)?;
            check_header(&header)?;
        }

        log::info!("commit log opened at {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)),
            sync_on_commit: false,
            records_written: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        })
    }

    /// fsync on every commit record instead of only flushing
    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    /// Whether any append or flush has failed since opening
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Flush buffered frames and fsync the file
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn append(&self, record: LogRecord) {
        let outcome = bincode::serialize(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            .and_then(|payload| {
                let crc = crc32fast::hash(&payload);
                let mut writer = self.writer.lock();
                writer.write_all(&(payload.len() as u32).to_le_bytes())?;
                writer.write_all(&payload)?;
                writer.write_all(&crc.to_le_bytes())?;
                if let LogRecord::Commit { .. } = record {
                    writer.flush()?;
                    if self.sync_on_commit {
                        writer.get_ref().sync_all()?;
                    }
                }
                Ok(())
            });

        match outcome {
            Ok(()) => {
                self.records_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.store(true, Ordering::Relaxed);
                log::error!("commit log append to {} failed: {}", self.path.display(), e);
            }
        }
    }

    /// Read every intact frame of a log file.
    ///
    /// A torn frame at the tail ends the scan; a frame with a bad checksum is
    /// skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        let mut header = [0u8; WAL_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        check_header(&header)?;

        let mut records = Vec::new();
        let mut offset = WAL_HEADER_SIZE as u64;
        loop {
            let mut len_buf = [0u8; 4];
            if reader.read_exact(&mut len_buf).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                break;
            }
            let mut crc_buf = [0u8; 4];
            if reader.read_exact(&mut crc_buf).is_err() {
                break;
            }

            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                log::warn!("skipping corrupt commit log frame at offset {}", offset);
            } else {
                let record = bincode::deserialize::<LogRecord>(&payload)
                    .map_err(|e| CcError::Serialization(e.to_string()))?;
                records.push(record);
            }
            offset += 8 + len as u64;
        }
        Ok(records)
    }
}

impl CommitLog for WalLog {
    fn log_begin(&self, commit_id: Cid) {
        self.append(LogRecord::Begin { commit_id });
    }

    fn log_insert(&self, commit_id: Cid, location: ItemPointer) {
        self.append(LogRecord::Insert { commit_id, location });
    }

    fn log_update(&self, commit_id: Cid, old: ItemPointer, new: ItemPointer) {
        self.append(LogRecord::Update { commit_id, old, new });
    }

    fn log_delete(&self, commit_id: Cid, location: ItemPointer) {
        self.append(LogRecord::Delete { commit_id, location });
    }

    fn log_commit(&self, commit_id: Cid) {
        self.append(LogRecord::Commit { commit_id });
    }
}

impl Drop for WalLog {
    fn drop(&mut self) {
        if let Err(e) = self.writer.get_mut().flush() {
            log::error!("commit log flush on close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_log_records_in_order() {
        let log = MemoryLog::new();
        log.log_begin(4);
        log.log_insert(4, ItemPointer::new(0, 1));
        log.log_commit(4);
        assert_eq!(log.records().len(), 3);
        assert_eq!(log.committed(), vec![4]);
    }

    #[test]
    fn test_wal_basic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commit.wal");
        {
            let wal = WalLog::open(&path).unwrap();
            wal.log_begin(7);
            wal.log_update(7, ItemPointer::new(0, 1), ItemPointer::new(0, 2));
            wal.log_delete(7, ItemPointer::new(1, 0));
            wal.log_commit(7);
            assert_eq!(wal.records_written(), 4);
            assert!(!wal.has_failed());
        }

        let records = WalLog::read_all(&path).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[1], LogRecord::Update {
            commit_id: 7,
            old: ItemPointer::new(0, 1),
            new: ItemPointer::new(0, 2),
        });
        assert!(records.iter().all(|r| r.commit_id() == 7));
    }

    #[test]
    fn test_wal_reopen_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commit.wal");
        {
            let wal = WalLog::open(&path).unwrap();
            wal.log_begin(1);
            wal.log_commit(1);
        }
        {
            let wal = WalLog::open(&path).unwrap();
            wal.log_begin(2);
            wal.log_commit(2);
            wal.sync().unwrap();
        }
        let records = WalLog::read_all(&path).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[3], LogRecord::Commit { commit_id: 2 });
    }

    #[test]
    fn test_wal_torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commit.wal");
        {
            let wal = WalLog::open(&path).unwrap();
            wal.log_begin(3);
            wal.log_commit(3);
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        assert_eq!(WalLog::read_all(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_wal_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("other.bin");
        std::fs::write(&path, b"not a log file").unwrap();
        assert!(WalLog::open(&path).is_err());
        assert!(WalLog::read_all(&path).is_err());
    }
}
