//! Write-ahead log segments
//!
//! A pool's WAL is a directory of numbered segments `wal-<seq:016x>.log`.
//! Writers append encoded records to the newest segment and rotate when it
//! grows past the configured size. Recovery replays segments in sequence
//! order, skipping corrupt records and stopping at a torn tail.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{KvError, KvResult};
use crate::format::{decode_record, find_next_magic, Decoded, LogRecord};
use crate::platform_durability::{durable_sync, sync_directory};

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";

/// Path of segment `sequence` inside `wal_dir`.
pub fn segment_path(wal_dir: &Path, sequence: u64) -> PathBuf {
    wal_dir.join(format!("{}{:016x}{}", SEGMENT_PREFIX, sequence, SEGMENT_SUFFIX))
}

/// All segments in `wal_dir`, sorted by sequence.
pub fn list_segments(wal_dir: &Path) -> KvResult<Vec<(u64, PathBuf)>> {
    let entries = std::fs::read_dir(wal_dir)
        .map_err(|e| KvError::io(wal_dir, "failed to read WAL directory", e))?;

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| KvError::io(wal_dir, "failed to read directory entry", e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(hex) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
        else {
            continue;
        };
        if let Ok(seq) = u64::from_str_radix(hex, 16) {
            segments.push((seq, entry.path()));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Appends records to the newest WAL segment.
///
/// The caller serializes access (the journal holds it behind a mutex) and
/// must not apply a mutation to the in-memory index before `append` returns.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    /// Bytes in the current segment (tracked to avoid stat calls)
    size: u64,
    wal_dir: PathBuf,
    sequence: u64,
    segment_size: u64,
    /// Appended bytes not yet synced
    unsynced: bool,
    #[cfg(test)]
    fail_sync: bool,
}

impl WalWriter {
    /// Open segment `sequence` for appending, creating it if needed.
    pub fn open(wal_dir: &Path, sequence: u64, segment_size: u64) -> KvResult<Self> {
        let path = segment_path(wal_dir, sequence);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| KvError::io(&path, "failed to open WAL segment", e))?;
        let size = file
            .metadata()
            .map_err(|e| KvError::io(&path, "failed to stat WAL segment", e))?
            .len();

        Ok(Self {
            file,
            path,
            size,
            wal_dir: wal_dir.to_path_buf(),
            sequence,
            segment_size,
            unsynced: false,
            #[cfg(test)]
            fail_sync: false,
        })
    }

    /// Append one encoded record.
    ///
    /// With `sync` the bytes are on stable storage when this returns Ok.
    /// A failed write or sync is cut back off the segment, so a record whose
    /// append returned Err is never replayed.
    pub fn append(&mut self, record: &[u8], sync: bool) -> KvResult<()> {
        if self.size > 0 && self.size + record.len() as u64 > self.segment_size {
            self.rotate()?;
        }

        let start = self.size;
        if let Err(e) = self.file.write_all(record) {
            self.cut_back(start);
            return Err(KvError::io(&self.path, "WAL write failed", e));
        }
        self.size += record.len() as u64;
        self.unsynced = true;

        if sync {
            if let Err(e) = self.sync() {
                self.cut_back(start);
                return Err(e);
            }
        }
        Ok(())
    }

    fn cut_back(&mut self, len: u64) {
        if let Err(e) = self.file.set_len(len) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to cut failed WAL append");
            return;
        }
        self.size = len;
    }

    /// Start a new segment. The current one is synced first.
    ///
    /// Returns the new segment's sequence number.
    pub fn rotate(&mut self) -> KvResult<u64> {
        self.sync()?;

        let sequence = self.sequence + 1;
        let path = segment_path(&self.wal_dir, sequence);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| KvError::io(&path, "failed to create WAL segment", e))?;
        sync_directory(&self.wal_dir)
            .map_err(|e| KvError::io(&self.wal_dir, "failed to sync WAL directory", e))?;

        self.file = file;
        self.path = path;
        self.size = 0;
        self.sequence = sequence;
        Ok(sequence)
    }

    /// Flush appended bytes to stable storage. Cheap when nothing is pending.
    pub fn sync(&mut self) -> KvResult<()> {
        if !self.unsynced {
            return Ok(());
        }
        self.sync_hook()?;
        durable_sync(&self.file).map_err(|e| KvError::io(&self.path, "WAL sync failed", e))?;
        self.unsynced = false;
        Ok(())
    }

    #[cfg(not(test))]
    fn sync_hook(&self) -> KvResult<()> {
        Ok(())
    }

    #[cfg(test)]
    fn sync_hook(&self) -> KvResult<()> {
        if self.fail_sync {
            let err = std::io::Error::new(std::io::ErrorKind::Other, "injected");
            return Err(KvError::io(&self.path, "WAL sync failed", err));
        }
        Ok(())
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    pub fn current_size(&self) -> u64 {
        self.size
    }
}

/// Result of scanning a buffer of records.
#[derive(Debug, Default)]
pub struct Scan {
    pub records: Vec<LogRecord>,
    /// Offset just past the last valid record
    pub valid_end: usize,
    /// Corrupt regions skipped by resyncing on the next magic
    pub skipped: usize,
    /// The buffer ends inside a record
    pub torn: bool,
}

/// Decode every record in `buf`.
///
/// Corrupt records are skipped by resyncing on the next offset that holds
/// a valid record. A record that runs past the end of the buffer with
/// nothing valid after it is the crash point and stops the scan. One that
/// is followed by valid records has a damaged length and is skipped.
pub fn scan_records(buf: &[u8], path: &Path) -> Scan {
    let mut scan = Scan::default();
    let mut offset = 0;

    while offset < buf.len() {
        match decode_record(buf, offset, path) {
            Ok(Decoded::Record { record, len }) => {
                scan.records.push(record);
                offset += len;
                scan.valid_end = offset;
            }
            Ok(Decoded::Torn) => match next_valid_record(buf, offset + 1, path) {
                Some(next) => {
                    tracing::warn!(
                        path = %path.display(),
                        offset,
                        resume = next,
                        "skipping log record whose length overruns valid data"
                    );
                    scan.skipped += 1;
                    offset = next;
                }
                None => {
                    tracing::warn!(
                        path = %path.display(),
                        offset,
                        available = buf.len() - offset,
                        "torn record at end of log"
                    );
                    scan.torn = true;
                    break;
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), offset, error = %e, "skipping corrupt log record");
                scan.skipped += 1;
                match next_valid_record(buf, offset + 1, path) {
                    Some(next) => offset = next,
                    None => break,
                }
            }
        }
    }
    scan
}

/// Offset of the first magic at or after `start` that decodes to a whole,
/// checksummed record.
fn next_valid_record(buf: &[u8], start: usize, path: &Path) -> Option<usize> {
    let mut from = start;
    while let Some(candidate) = find_next_magic(buf, from) {
        if let Ok(Decoded::Record { .. }) = decode_record(buf, candidate, path) {
            return Some(candidate);
        }
        from = candidate + 1;
    }
    None
}

/// Where recovery left the newest segment.
#[derive(Debug, Clone)]
pub struct SegmentTail {
    pub sequence: u64,
    pub path: PathBuf,
    /// Length up to the last valid record
    pub valid_len: u64,
    /// Length on disk
    pub file_len: u64,
}

/// Records recovered from the WAL.
#[derive(Debug, Default)]
pub struct Recovered {
    pub records: Vec<LogRecord>,
    /// Newest segment replayed, if any
    pub tail: Option<SegmentTail>,
    pub skipped: usize,
}

/// Replays WAL segments.
pub struct WalReader {
    wal_dir: PathBuf,
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self {
            wal_dir: wal_dir.as_ref().to_path_buf(),
        }
    }

    /// Recover all records from segments numbered `from` or higher, in order.
    pub fn recover(&self, from: u64) -> KvResult<Recovered> {
        let mut recovered = Recovered::default();

        for (sequence, path) in list_segments(&self.wal_dir)? {
            if sequence < from {
                continue;
            }
            let buf = read_file(&path)?;
            let scan = scan_records(&buf, &path);
            recovered.records.extend(scan.records);
            recovered.skipped += scan.skipped;
            recovered.tail = Some(SegmentTail {
                sequence,
                path,
                valid_len: scan.valid_end as u64,
                file_len: buf.len() as u64,
            });
        }

        Ok(recovered)
    }
}

pub(crate) fn read_file(path: &Path) -> KvResult<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| KvError::io(path, "failed to open file for recovery", e))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| KvError::io(path, "failed to read file for recovery", e))?;
    Ok(buf)
}
