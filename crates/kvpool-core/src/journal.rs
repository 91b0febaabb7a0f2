//! Journal: durability layer for persistent engines
//!
//! Owns the WAL writer behind a mutex. A mutation is committed by taking a
//! [`JournalTxn`], appending the record, and applying it to the index while
//! the transaction is still held, so the WAL order and the index order of
//! writes always agree.
//!
//! Recovery on open:
//! 1. Load `checkpoint.kvp` if present (strict)
//! 2. Replay WAL segments from the checkpoint's segment onwards
//! 3. Truncate a torn tail off the newest segment
//! 4. Delete segments the checkpoint already covers

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::checkpoint::{load_checkpoint, write_checkpoint};
use crate::config::{Durability, PoolOptions};
use crate::error::{KvError, KvResult};
use crate::format::{encode_record, LogRecord, Operation};
use crate::index::KeyIndex;
use crate::platform_durability::sync_directory;
use crate::pool::WAL_DIR;
use crate::wal::{list_segments, WalReader, WalWriter};

/// Live segments allowed before a commit triggers a checkpoint.
pub const MAX_LIVE_SEGMENTS: u64 = 4;

struct JournalState {
    wal: WalWriter,
    /// Oldest segment recovery still needs
    base_segment: u64,
    /// Records appended since the last checkpoint
    pending: u64,
    closed: bool,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Default)]
pub struct JournalStats {
    appended: AtomicU64,
    checkpoints: AtomicU64,
    recovered: AtomicU64,
}

impl JournalStats {
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    pub fn recovered(&self) -> u64 {
        self.recovered.load(Ordering::Relaxed)
    }
}

pub struct Journal {
    dir: PathBuf,
    wal_dir: PathBuf,
    durability: Durability,
    state: Mutex<JournalState>,
    pending: AtomicU64,
    stats: JournalStats,
}

impl Journal {
    /// Open the journal in pool directory `dir` and recover its contents.
    ///
    /// Returns the records to replay into a fresh index, oldest first.
    pub fn open(dir: &Path, opts: &PoolOptions) -> KvResult<(Self, Vec<LogRecord>)> {
        let wal_dir = dir.join(WAL_DIR);
        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| KvError::io(&wal_dir, "failed to create WAL directory", e))?;

        let (base_segment, mut records) = match load_checkpoint(dir)? {
            Some((header, records)) => {
                tracing::info!(
                    segment = header.segment,
                    records = header.records,
                    "loaded checkpoint"
                );
                (header.segment, records)
            }
            None => (0, Vec::new()),
        };

        let recovered = WalReader::new(&wal_dir).recover(base_segment)?;
        let replayed = recovered.records.len();
        records.extend(recovered.records);

        let mut sequence = base_segment;
        if let Some(tail) = &recovered.tail {
            sequence = tail.sequence;
            if tail.valid_len < tail.file_len {
                tracing::warn!(
                    path = %tail.path.display(),
                    valid = tail.valid_len,
                    len = tail.file_len,
                    "truncating torn WAL tail"
                );
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .open(&tail.path)
                    .map_err(|e| KvError::io(&tail.path, "failed to open WAL tail", e))?;
                file.set_len(tail.valid_len)
                    .map_err(|e| KvError::io(&tail.path, "failed to truncate WAL tail", e))?;
                crate::platform_durability::durable_sync(&file)
                    .map_err(|e| KvError::io(&tail.path, "failed to sync WAL tail", e))?;
            }
        }

        remove_segments_before(&wal_dir, base_segment)?;

        let wal = WalWriter::open(&wal_dir, sequence, opts.wal_segment_size)?;
        tracing::info!(
            path = %dir.display(),
            replayed,
            skipped = recovered.skipped,
            segment = sequence,
            "journal recovered"
        );

        let stats = JournalStats::default();
        stats.recovered.store(records.len() as u64, Ordering::Relaxed);
        let pending = replayed as u64;

        Ok((
            Self {
                dir: dir.to_path_buf(),
                wal_dir,
                durability: opts.durability,
                state: Mutex::new(JournalState {
                    wal,
                    base_segment,
                    pending,
                    closed: false,
                }),
                pending: AtomicU64::new(pending),
                stats,
            },
            records,
        ))
    }

    /// Lock the journal for one mutation.
    pub fn begin(&self) -> KvResult<JournalTxn<'_>> {
        let state = self.state.lock();
        if state.closed {
            return Err(KvError::Stopped);
        }
        Ok(JournalTxn { journal: self, state })
    }

    /// Write a checkpoint of `index` and drop the segments it covers.
    pub fn checkpoint(&self, index: &dyn KeyIndex) -> KvResult<()> {
        let mut txn = self.begin()?;
        txn.checkpoint(index)
    }

    /// Force every appended record to stable storage.
    pub fn sync(&self) -> KvResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(KvError::Stopped);
        }
        state.wal.sync()
    }

    /// Flush and refuse further commits. In buffered mode pending records
    /// are folded into a final checkpoint.
    pub fn close(&self, index: &dyn KeyIndex) -> KvResult<()> {
        let mut txn = self.begin()?;
        let result = if self.durability == Durability::Buffered && txn.state.pending > 0 {
            txn.checkpoint(index)
        } else {
            txn.state.wal.sync()
        };
        txn.state.closed = true;
        result
    }

    /// Records appended since the last checkpoint.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &JournalStats {
        &self.stats
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    /// Number of segment files currently on disk.
    pub fn live_segments(&self) -> KvResult<usize> {
        Ok(list_segments(&self.wal_dir)?.len())
    }
}

/// Exclusive hold on the journal for one mutation or checkpoint.
pub struct JournalTxn<'a> {
    journal: &'a Journal,
    state: MutexGuard<'a, JournalState>,
}

impl JournalTxn<'_> {
    /// Append one record, synced when the journal runs in sync mode.
    pub fn append(&mut self, op: Operation, key: &[u8], value: &[u8]) -> KvResult<()> {
        let record = encode_record(op, key, value)?;
        let sync = self.journal.durability == Durability::Sync;
        self.state.wal.append(&record, sync)?;
        self.state.pending += 1;
        self.journal.pending.store(self.state.pending, Ordering::Release);
        self.journal.stats.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Whether enough WAL has built up to warrant a checkpoint.
    pub fn should_checkpoint(&self) -> bool {
        self.state.wal.sequence() >= self.state.base_segment + MAX_LIVE_SEGMENTS
    }

    pub fn checkpoint(&mut self, index: &dyn KeyIndex) -> KvResult<()> {
        let segment = self.state.wal.rotate()?;
        let result = write_checkpoint(&self.journal.dir, segment, index)?;

        let previous = self.state.base_segment;
        self.state.base_segment = segment;
        self.state.pending = 0;
        self.journal.pending.store(0, Ordering::Release);
        self.journal.stats.checkpoints.fetch_add(1, Ordering::Relaxed);

        remove_segments_before(&self.journal.wal_dir, segment)?;
        tracing::info!(
            path = %result.path.display(),
            records = result.records,
            bytes = result.bytes,
            segment,
            dropped_from = previous,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "checkpoint complete"
        );
        Ok(())
    }
}

fn remove_segments_before(wal_dir: &Path, segment: u64) -> KvResult<()> {
    let mut removed = 0;
    for (sequence, path) in list_segments(wal_dir)? {
        if sequence >= segment {
            break;
        }
        std::fs::remove_file(&path).map_err(|e| KvError::io(&path, "failed to remove WAL segment", e))?;
        removed += 1;
    }
    if removed > 0 {
        sync_directory(wal_dir).map_err(|e| KvError::io(wal_dir, "failed to sync WAL directory", e))?;
        tracing::debug!(removed, "dropped obsolete WAL segments");
    }
    Ok(())
}
