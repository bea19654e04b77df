//! Per-volume intent log handle
//!
//! Records are appended to an in-memory pending list under a short lock and
//! written out by the next commit. Commits serialize on the file lock; a
//! caller whose records were written by someone else's batch returns
//! without touching the file.

use crate::error::{WalError, WalResult};
use crate::record::{LogEntry, LogRecord, Payload};

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};
use voltx_common::{Dispatcher, IntentLogConfig};

/// Magic number for the log file header
const LOG_MAGIC: u64 = 0x564C_5458_5F57_414C; // "VLTX_WAL"

/// Log file version
const LOG_VERSION: u32 = 1;

/// Header: magic, version, dataset GUID
const HEADER_LEN: u64 = 8 + 4 + 8;

/// Pending list length at which records already durable in the store are
/// dropped without being written
const PRUNE_THRESHOLD: usize = 1024;

/// How a write record obtains its data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteState {
    /// Data captured when the intent was logged
    Copied(Bytes),
    /// Data read from the volume at commit time
    NeedCopy,
    /// Data made durable in the store at commit time
    Indirect,
}

/// Access to the volume behind a log
pub trait LogDataSource: Send + Sync {
    /// Read committed volume data
    fn read(&self, offset: u64, length: u64) -> WalResult<Bytes>;

    /// Make everything up to `txg` durable in the store
    fn persist(&self, txg: u64) -> WalResult<()>;

    /// Highest txg already durable in the store
    fn synced_txg(&self) -> u64;
}

#[derive(Debug)]
enum PendingRecord {
    Write {
        txg: u64,
        offset: u64,
        length: u64,
        state: WriteState,
    },
    Truncate {
        txg: u64,
        offset: u64,
        length: u64,
    },
}

impl PendingRecord {
    const fn txg(&self) -> u64 {
        match self {
            Self::Write { txg, .. } | Self::Truncate { txg, .. } => *txg,
        }
    }
}

struct LogFile {
    writer: BufWriter<File>,
    size: u64,
}

/// Result of scanning an existing log file
#[derive(Debug, Default)]
struct Scan {
    entries: Vec<LogEntry>,
    last_sequence: u64,
    checkpoint_txg: u64,
    max_txg: u64,
    valid_end: u64,
}

/// Write-ahead intent log of one volume
pub struct Wal {
    path: PathBuf,
    guid: u64,
    max_log_size: u64,
    source: Arc<dyn LogDataSource>,
    /// Records not yet written, in sequence order
    pending: Mutex<Vec<(u64, PendingRecord)>>,
    /// Next sequence number; assigned under the pending lock
    next_sequence: AtomicU64,
    file: Mutex<Option<LogFile>>,
    /// Every sequence up to this one is durable or no longer needed
    durable_sequence: AtomicU64,
    /// Highest checkpointed txg
    checkpoint_txg: AtomicU64,
    /// Highest txg of any record in the current file
    max_logged_txg: AtomicU64,
    /// Number of batches written
    commits: AtomicU64,
    closed: AtomicBool,
}

impl Wal {
    /// Log file location for a dataset
    #[must_use]
    pub fn path_for(dir: &Path, guid: u64) -> PathBuf {
        dir.join(format!("{guid:016x}.wal"))
    }

    /// Create or open the log of dataset `guid`
    pub fn open(
        config: &IntentLogConfig,
        guid: u64,
        source: Arc<dyn LogDataSource>,
    ) -> WalResult<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let path = Self::path_for(&config.dir, guid);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let scan = if file_len == 0 {
            Self::write_header(&mut file, guid)?;
            file.sync_all()?;
            Scan {
                valid_end: HEADER_LEN,
                ..Scan::default()
            }
        } else {
            Self::read_header(&mut file, guid)?;
            Self::scan(&mut file, file_len)?
        };

        if scan.valid_end < file_len {
            warn!(
                "Truncating intent log {:?} from {} to {} bytes after a damaged record",
                path, file_len, scan.valid_end
            );
            file.set_len(scan.valid_end)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(scan.valid_end))?;

        info!(
            "Opened intent log at {:?}: seq={}, checkpoint_txg={}, size={}",
            path, scan.last_sequence, scan.checkpoint_txg, scan.valid_end
        );

        Ok(Self {
            path,
            guid,
            max_log_size: config.max_log_size,
            source,
            pending: Mutex::new(Vec::new()),
            next_sequence: AtomicU64::new(scan.last_sequence + 1),
            file: Mutex::new(Some(LogFile {
                writer: BufWriter::new(file),
                size: scan.valid_end,
            })),
            durable_sequence: AtomicU64::new(scan.last_sequence),
            checkpoint_txg: AtomicU64::new(scan.checkpoint_txg),
            max_logged_txg: AtomicU64::new(scan.max_txg),
            commits: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn write_header<W: Write>(writer: &mut W, guid: u64) -> WalResult<()> {
        writer.write_all(&LOG_MAGIC.to_le_bytes())?;
        writer.write_all(&LOG_VERSION.to_le_bytes())?;
        writer.write_all(&guid.to_le_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn read_header(file: &mut File, guid: u64) -> WalResult<()> {
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|e| WalError::InvalidHeader(format!("short header: {e}")))?;

        let mut word = [0u8; 8];
        word.copy_from_slice(&header[0..8]);
        if u64::from_le_bytes(word) != LOG_MAGIC {
            return Err(WalError::InvalidHeader("bad magic".to_string()));
        }
        let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if version != LOG_VERSION {
            return Err(WalError::InvalidHeader(format!(
                "unsupported version: {version}"
            )));
        }
        word.copy_from_slice(&header[12..20]);
        let found = u64::from_le_bytes(word);
        if found != guid {
            return Err(WalError::InvalidHeader(format!(
                "log belongs to dataset {found:016x}, expected {guid:016x}"
            )));
        }
        Ok(())
    }

    /// Read every intact record after the header
    fn scan(file: &mut File, file_len: u64) -> WalResult<Scan> {
        file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut reader = BufReader::new(file);
        let mut scan = Scan {
            valid_end: HEADER_LEN,
            ..Scan::default()
        };

        while scan.valid_end < file_len {
            match LogEntry::decode(&mut reader) {
                Ok(entry) => {
                    scan.valid_end += entry.encoded_len() as u64;
                    scan.last_sequence = scan.last_sequence.max(entry.sequence);
                    match entry.record {
                        LogRecord::Checkpoint { txg } => {
                            scan.checkpoint_txg = scan.checkpoint_txg.max(txg);
                        }
                        ref record => scan.max_txg = scan.max_txg.max(record.txg()),
                    }
                    scan.entries.push(entry);
                }
                Err(e) => {
                    warn!("Intent log scan stopped at byte {}: {}", scan.valid_end, e);
                    break;
                }
            }
        }
        Ok(scan)
    }

    /// Records that must be re-applied: writes and truncates newer than both
    /// the last checkpoint and `synced_txg`, in log order
    pub fn replay(&self, synced_txg: u64) -> WalResult<Vec<LogEntry>> {
        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        Self::read_header(&mut file, self.guid)?;
        let scan = Self::scan(&mut file, file_len)?;

        let floor = scan.checkpoint_txg.max(synced_txg);
        let entries: Vec<LogEntry> = scan
            .entries
            .into_iter()
            .filter(|entry| {
                !matches!(entry.record, LogRecord::Checkpoint { .. }) && entry.record.txg() > floor
            })
            .collect();

        info!(
            "Intent log {:?}: {} records to replay after txg {}",
            self.path,
            entries.len(),
            floor
        );
        Ok(entries)
    }

    /// Record a write intent; returns its sequence number
    pub fn log_write(&self, txg: u64, offset: u64, length: u64, state: WriteState) -> WalResult<u64> {
        self.append(PendingRecord::Write {
            txg,
            offset,
            length,
            state,
        })
    }

    /// Record a free intent; returns its sequence number
    pub fn log_truncate(&self, txg: u64, offset: u64, length: u64) -> WalResult<u64> {
        self.append(PendingRecord::Truncate {
            txg,
            offset,
            length,
        })
    }

    fn append(&self, record: PendingRecord) -> WalResult<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WalError::Closed(self.path.display().to_string()));
        }
        let mut pending = self.pending.lock();
        if pending.len() >= PRUNE_THRESHOLD {
            let synced = self.source.synced_txg();
            pending.retain(|(_, r)| r.txg() > synced);
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        pending.push((sequence, record));
        Ok(sequence)
    }

    /// Make every record logged so far durable
    pub fn commit_sync(&self) -> WalResult<()> {
        let target = self.next_sequence.load(Ordering::SeqCst) - 1;
        if self.durable_sequence.load(Ordering::SeqCst) >= target {
            return Ok(());
        }

        let mut file = self.file.lock();
        // Another caller's batch may have covered us while we waited.
        if self.durable_sequence.load(Ordering::SeqCst) >= target {
            return Ok(());
        }
        let log = file
            .as_mut()
            .ok_or_else(|| WalError::Closed(self.path.display().to_string()))?;
        self.write_batch(log, None)
    }

    /// Commit on the dispatcher and report the outcome to `callback`,
    /// which runs exactly once
    pub fn commit_async<F>(self: &Arc<Self>, dispatcher: &Dispatcher, callback: F)
    where
        F: FnOnce(WalResult<()>) + Send + 'static,
    {
        let wal = Arc::clone(self);
        dispatcher.dispatch(move || callback(wal.commit_sync()));
    }

    /// Record that everything up to `txg` is durable in the store. Pending
    /// records are written first. The log is rotated when it has outgrown
    /// its size limit and every record in it is covered.
    pub fn checkpoint(&self, txg: u64) -> WalResult<()> {
        let mut file = self.file.lock();
        let log = file
            .as_mut()
            .ok_or_else(|| WalError::Closed(self.path.display().to_string()))?;
        self.write_batch(log, Some(txg))?;
        self.checkpoint_txg.fetch_max(txg, Ordering::SeqCst);
        debug!("Intent log checkpoint at txg {}", txg);

        if log.size > self.max_log_size && self.max_logged_txg.load(Ordering::SeqCst) <= txg {
            *log = self.rotate()?;
        }
        Ok(())
    }

    /// Write all pending records, plus an optional checkpoint, with one fsync
    fn write_batch(&self, log: &mut LogFile, checkpoint: Option<u64>) -> WalResult<()> {
        let (batch, checkpoint, last) = {
            let mut pending = self.pending.lock();
            let batch = std::mem::take(&mut *pending);
            let checkpoint = checkpoint.map(|txg| LogEntry {
                sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
                record: LogRecord::Checkpoint { txg },
            });
            (batch, checkpoint, self.next_sequence.load(Ordering::SeqCst) - 1)
        };

        let mut entries = match self.resolve(&batch) {
            Ok(entries) => entries,
            Err(e) => {
                self.restore(batch);
                return Err(e);
            }
        };
        entries.extend(checkpoint);

        let mut written = 0u64;
        let mut max_txg = 0u64;
        let result = (|| -> WalResult<()> {
            for entry in &entries {
                let data = entry.encode();
                log.writer.write_all(&data)?;
                written += data.len() as u64;
                if !matches!(entry.record, LogRecord::Checkpoint { .. }) {
                    max_txg = max_txg.max(entry.record.txg());
                }
            }
            log.writer.flush()?;
            log.writer.get_ref().sync_data()?;
            Ok(())
        })();
        log.size += written;

        if let Err(e) = result {
            warn!("Intent log write to {:?} failed: {}", self.path, e);
            self.restore(batch);
            return Err(e);
        }

        self.max_logged_txg.fetch_max(max_txg, Ordering::SeqCst);
        self.durable_sequence.fetch_max(last, Ordering::SeqCst);
        self.commits.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Committed {} intent log records through sequence {}",
            entries.len(),
            last
        );
        Ok(())
    }

    /// Turn pending records into log entries, fetching or persisting data
    fn resolve(&self, batch: &[(u64, PendingRecord)]) -> WalResult<Vec<LogEntry>> {
        let mut entries = Vec::with_capacity(batch.len());
        let mut persist_txg = None;

        for (sequence, record) in batch {
            let record = match record {
                PendingRecord::Write {
                    txg,
                    offset,
                    length,
                    state,
                } => {
                    let payload = match state {
                        WriteState::Copied(data) => Payload::Copied(data.clone()),
                        WriteState::NeedCopy => match self.source.read(*offset, *length) {
                            Ok(data) => Payload::Copied(data),
                            Err(e) => {
                                warn!(
                                    "Reading {} bytes at {} for the intent log failed, logging by reference: {}",
                                    length, offset, e
                                );
                                persist_txg = persist_txg.max(Some(*txg));
                                Payload::Indirect
                            }
                        },
                        WriteState::Indirect => {
                            persist_txg = persist_txg.max(Some(*txg));
                            Payload::Indirect
                        }
                    };
                    LogRecord::Write {
                        txg: *txg,
                        offset: *offset,
                        length: *length,
                        payload,
                    }
                }
                PendingRecord::Truncate {
                    txg,
                    offset,
                    length,
                } => LogRecord::Truncate {
                    txg: *txg,
                    offset: *offset,
                    length: *length,
                },
            };
            entries.push(LogEntry {
                sequence: *sequence,
                record,
            });
        }

        if let Some(txg) = persist_txg {
            self.source.persist(txg)?;
        }
        Ok(entries)
    }

    /// Put a failed batch back in front of records logged since
    fn restore(&self, batch: Vec<(u64, PendingRecord)>) {
        let mut pending = self.pending.lock();
        let newer = std::mem::replace(&mut *pending, batch);
        pending.extend(newer);
    }

    /// Replace the log file with an empty one
    fn rotate(&self) -> WalResult<LogFile> {
        let old_path = self.path.with_extension("old");
        std::fs::rename(&self.path, &old_path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        Self::write_header(&mut writer, self.guid)?;
        writer.get_ref().sync_all()?;
        self.max_logged_txg.store(0, Ordering::SeqCst);

        if let Err(e) = std::fs::remove_file(&old_path) {
            warn!("Failed to remove old intent log: {}", e);
        }
        info!(
            "Rotated intent log {:?} at sequence {}",
            self.path,
            self.durable_sequence.load(Ordering::SeqCst)
        );
        Ok(LogFile {
            writer,
            size: HEADER_LEN,
        })
    }

    /// Write pending records and stop accepting new ones
    pub fn close(&self) -> WalResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut file = self.file.lock();
        let result = match file.as_mut() {
            Some(log) => self.write_batch(log, None),
            None => Ok(()),
        };
        *file = None;
        info!("Closed intent log {:?}", self.path);
        result
    }

    /// Log file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest sequence known durable
    #[must_use]
    pub fn durable_sequence(&self) -> u64 {
        self.durable_sequence.load(Ordering::SeqCst)
    }

    /// Number of records waiting for a commit
    #[must_use]
    pub fn pending_records(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of batches written so far
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Highest checkpointed txg
    #[must_use]
    pub fn checkpoint_txg(&self) -> u64 {
        self.checkpoint_txg.load(Ordering::SeqCst)
    }

    /// Current file size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.file.lock().as_ref().map_or(0, |log| log.size)
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("durable_sequence", &self.durable_sequence())
            .field("checkpoint_txg", &self.checkpoint_txg())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeVolume {
        data: Mutex<HashMap<u64, Bytes>>,
        persisted: Mutex<Vec<u64>>,
        synced: AtomicU64,
        fail_reads: AtomicBool,
    }

    impl LogDataSource for FakeVolume {
        fn read(&self, offset: u64, _length: u64) -> WalResult<Bytes> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(WalError::Source("read failed".to_string()));
            }
            self.data
                .lock()
                .get(&offset)
                .cloned()
                .ok_or_else(|| WalError::Source(format!("nothing at {offset}")))
        }

        fn persist(&self, txg: u64) -> WalResult<()> {
            self.persisted.lock().push(txg);
            self.synced.fetch_max(txg, Ordering::SeqCst);
            Ok(())
        }

        fn synced_txg(&self) -> u64 {
            self.synced.load(Ordering::SeqCst)
        }
    }

    fn config(dir: &Path) -> IntentLogConfig {
        IntentLogConfig {
            dir: dir.to_path_buf(),
            ..IntentLogConfig::default()
        }
    }

    fn copied(data: &[u8]) -> WriteState {
        WriteState::Copied(Bytes::copy_from_slice(data))
    }

    #[test]
    fn test_commit_and_replay_after_reopen() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeVolume::default());
        {
            let wal = Wal::open(&config(dir.path()), 7, source.clone()).unwrap();
            wal.log_write(1, 0, 3, copied(b"abc")).unwrap();
            wal.log_truncate(2, 4096, 512).unwrap();
            wal.commit_sync().unwrap();
            assert_eq!(wal.durable_sequence(), 2);
            assert_eq!(wal.pending_records(), 0);
        }

        let wal = Wal::open(&config(dir.path()), 7, source).unwrap();
        let entries = wal.replay(0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].record,
            LogRecord::Write {
                txg: 1,
                offset: 0,
                length: 3,
                payload: Payload::Copied(Bytes::from_static(b"abc")),
            }
        );
        // Sequence numbering continues after the recovered records.
        assert_eq!(wal.log_write(3, 0, 1, copied(b"x")).unwrap(), 3);

        // Records at or below the synced txg are skipped.
        assert_eq!(wal.replay(1).unwrap().len(), 1);
    }

    #[test]
    fn test_uncommitted_records_are_lost() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeVolume::default());
        {
            let wal = Wal::open(&config(dir.path()), 1, source.clone()).unwrap();
            wal.log_write(1, 0, 1, copied(b"a")).unwrap();
        }
        let wal = Wal::open(&config(dir.path()), 1, source).unwrap();
        assert!(wal.replay(0).unwrap().is_empty());
    }

    #[test]
    fn test_checkpoint_hides_older_records() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeVolume::default());
        let wal = Wal::open(&config(dir.path()), 1, source).unwrap();
        wal.log_write(1, 0, 1, copied(b"a")).unwrap();
        wal.log_write(2, 1, 1, copied(b"b")).unwrap();
        wal.checkpoint(1).unwrap();
        wal.log_write(3, 2, 1, copied(b"c")).unwrap();
        wal.commit_sync().unwrap();

        let txgs: Vec<u64> = wal
            .replay(0)
            .unwrap()
            .iter()
            .map(|e| e.record.txg())
            .collect();
        assert_eq!(txgs, vec![2, 3]);
    }

    #[test]
    fn test_need_copy_reads_at_commit() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeVolume::default());
        let wal = Wal::open(&config(dir.path()), 1, source.clone()).unwrap();
        wal.log_write(1, 512, 4, WriteState::NeedCopy).unwrap();
        source
            .data
            .lock()
            .insert(512, Bytes::from_static(b"late"));
        wal.commit_sync().unwrap();

        let entries = wal.replay(0).unwrap();
        assert!(matches!(
            &entries[0].record,
            LogRecord::Write { payload: Payload::Copied(data), .. } if &data[..] == b"late"
        ));
        assert!(source.persisted.lock().is_empty());
    }

    #[test]
    fn test_indirect_persists_before_logging() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeVolume::default());
        let wal = Wal::open(&config(dir.path()), 1, source.clone()).unwrap();
        wal.log_write(4, 0, 131_072, WriteState::Indirect).unwrap();
        source.fail_reads.store(true, Ordering::SeqCst);
        wal.log_write(5, 131_072, 16, WriteState::NeedCopy).unwrap();
        wal.commit_sync().unwrap();

        assert_eq!(*source.persisted.lock(), vec![5]);
        // Both records are covered by the persisted txg.
        assert!(wal.replay(source.synced_txg()).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_commits_share_batches() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeVolume::default());
        let wal = Arc::new(Wal::open(&config(dir.path()), 1, source).unwrap());

        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let wal = Arc::clone(&wal);
                thread::spawn(move || {
                    let seq = wal.log_write(i + 1, i * 4096, 1, copied(&[i as u8])).unwrap();
                    wal.commit_sync().unwrap();
                    assert!(wal.durable_sequence() >= seq);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(wal.commit_count() <= 8);
        let committed = wal.commit_count();
        wal.commit_sync().unwrap();
        assert_eq!(wal.commit_count(), committed);
        assert_eq!(wal.replay(0).unwrap().len(), 8);
    }

    #[test]
    fn test_commit_async_calls_back_once() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeVolume::default());
        let wal = Arc::new(Wal::open(&config(dir.path()), 1, source).unwrap());
        wal.log_write(1, 0, 1, copied(b"a")).unwrap();

        let calls = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&calls);
        wal.commit_async(&Dispatcher::Inline, move |result| {
            assert!(result.is_ok());
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(wal.durable_sequence(), 1);
    }

    #[test]
    fn test_damaged_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeVolume::default());
        let path = {
            let wal = Wal::open(&config(dir.path()), 9, source.clone()).unwrap();
            wal.log_write(1, 0, 2, copied(b"ok")).unwrap();
            wal.commit_sync().unwrap();
            wal.path().to_path_buf()
        };
        let intact = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xFF; 13]).unwrap();
        }

        let wal = Wal::open(&config(dir.path()), 9, source).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);
        wal.log_write(2, 2, 2, copied(b"go")).unwrap();
        wal.commit_sync().unwrap();
        assert_eq!(wal.replay(0).unwrap().len(), 2);
    }

    #[test]
    fn test_rotation_after_covering_checkpoint() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeVolume::default());
        let config = IntentLogConfig {
            max_log_size: 256,
            ..config(dir.path())
        };
        let wal = Wal::open(&config, 1, source).unwrap();
        for i in 0..4 {
            wal.log_write(1, i * 100, 100, copied(&[1; 100])).unwrap();
        }
        wal.commit_sync().unwrap();
        assert!(wal.size() > 256);

        wal.checkpoint(1).unwrap();
        assert_eq!(wal.size(), HEADER_LEN);
        assert!(wal.replay(0).unwrap().is_empty());
    }

    #[test]
    fn test_foreign_log_rejected() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeVolume::default());
        drop(Wal::open(&config(dir.path()), 1, source.clone()).unwrap());
        std::fs::rename(
            Wal::path_for(dir.path(), 1),
            Wal::path_for(dir.path(), 2),
        )
        .unwrap();
        let err = Wal::open(&config(dir.path()), 2, source).unwrap_err();
        assert!(matches!(err, WalError::InvalidHeader(_)));
    }

    #[test]
    fn test_closed_log_rejects_records() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeVolume::default());
        let wal = Wal::open(&config(dir.path()), 1, source).unwrap();
        wal.log_write(1, 0, 1, copied(b"a")).unwrap();
        wal.close().unwrap();
        assert_eq!(wal.durable_sequence(), 1);
        assert!(matches!(
            wal.log_truncate(2, 0, 1),
            Err(WalError::Closed(_))
        ));
        assert!(wal.close().is_ok());
    }
}
