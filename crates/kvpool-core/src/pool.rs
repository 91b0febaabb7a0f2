//! Pool lifecycle and capacity accounting
//!
//! A persistent pool is a directory:
//!
//! ```text
//! <path>/pool.json         engine name, capacity, format version
//! <path>/LOCK              held exclusively while the pool is open
//! <path>/wal/              write-ahead log segments
//! <path>/checkpoint.kvp    latest snapshot of the index
//! ```
//!
//! Volatile pools only borrow an existing directory as their scratch
//! location and keep nothing in it.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::PoolOptions;
use crate::error::{KvError, KvResult};
use crate::platform_durability::{durable_sync, sync_directory};

pub const META_FILE: &str = "pool.json";
pub const LOCK_FILE: &str = "LOCK";
pub const WAL_DIR: &str = "wal";
pub const FORMAT_VERSION: u32 = 1;

/// Bytes charged per record on top of its key and value.
pub const RECORD_OVERHEAD: u64 = 32;

/// Capacity charge for one record.
pub fn record_charge(key_len: usize, value_len: usize) -> u64 {
    key_len as u64 + value_len as u64 + RECORD_OVERHEAD
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PoolMeta {
    engine: String,
    capacity: u64,
    format_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Open,
    Closed,
}

/// Snapshot of a pool's identity and usage.
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub engine: String,
    pub path: Option<PathBuf>,
    pub persistent: bool,
    /// Capacity in bytes; 0 for engines that store nothing
    pub capacity: u64,
    pub used: u64,
    pub records: usize,
    pub state: PoolState,
}

/// Storage region an engine instance is bound to.
pub struct Pool {
    engine: String,
    path: Option<PathBuf>,
    persistent: bool,
    capacity: u64,
    used: AtomicU64,
    lock: Option<File>,
    closed: AtomicBool,
}

impl Pool {
    /// A pool that stores nothing and accepts everything.
    pub fn detached(engine: &str) -> Self {
        Self {
            engine: engine.to_string(),
            path: None,
            persistent: false,
            capacity: 0,
            used: AtomicU64::new(0),
            lock: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Bind a volatile engine. The path must name an existing directory and
    /// a capacity must be given.
    pub fn volatile(engine: &str, opts: &PoolOptions) -> KvResult<Self> {
        let path = opts.require_path()?;
        if !path.is_dir() {
            return Err(KvError::InvalidArgument(format!(
                "path {} is not an existing directory",
                path.display()
            )));
        }
        if opts.size == 0 {
            return Err(KvError::ConfigParsing(
                "config does not include a valid \"size\"".into(),
            ));
        }

        tracing::debug!(engine, path = %path.display(), capacity = opts.size, "volatile pool bound");
        Ok(Self {
            engine: engine.to_string(),
            path: Some(path.clone()),
            persistent: false,
            capacity: opts.size,
            used: AtomicU64::new(0),
            lock: None,
            closed: AtomicBool::new(false),
        })
    }

    /// Create or reopen a persistent pool directory and lock it.
    ///
    /// A new pool needs a non-zero `size`. Reopening keeps the stored
    /// capacity and refuses a pool created by a different engine.
    pub fn persistent(engine: &str, opts: &PoolOptions) -> KvResult<Self> {
        let path = opts.require_path()?.clone();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(KvError::InvalidArgument(format!(
                    "parent directory of {} does not exist",
                    path.display()
                )));
            }
        }
        if path.exists() && !path.is_dir() {
            return Err(KvError::InvalidArgument(format!(
                "{} exists and is not a pool directory",
                path.display()
            )));
        }
        fs::create_dir_all(path.join(WAL_DIR))
            .map_err(|e| KvError::io(&path, "failed to create pool directory", e))?;

        let lock = acquire_lock(&path)?;

        let meta_path = path.join(META_FILE);
        let capacity = if meta_path.exists() {
            let meta = read_meta(&meta_path)?;
            if meta.engine != engine {
                return Err(KvError::InvalidArgument(format!(
                    "pool {} was created by engine {:?}, not {:?}",
                    path.display(),
                    meta.engine,
                    engine
                )));
            }
            if meta.format_version != FORMAT_VERSION {
                return Err(KvError::InvalidArgument(format!(
                    "pool {} has unsupported format version {}",
                    path.display(),
                    meta.format_version
                )));
            }
            if opts.size != 0 && opts.size != meta.capacity {
                tracing::info!(
                    requested = opts.size,
                    stored = meta.capacity,
                    "ignoring size for existing pool"
                );
            }
            tracing::info!(engine, path = %path.display(), capacity = meta.capacity, "reopening pool");
            meta.capacity
        } else {
            if opts.size == 0 {
                return Err(KvError::ConfigParsing(
                    "config does not include a valid \"size\" for a new pool".into(),
                ));
            }
            let meta = PoolMeta {
                engine: engine.to_string(),
                capacity: opts.size,
                format_version: FORMAT_VERSION,
            };
            write_meta(&path, &meta)?;
            tracing::info!(engine, path = %path.display(), capacity = opts.size, "created pool");
            opts.size
        };

        Ok(Self {
            engine: engine.to_string(),
            path: Some(path),
            persistent: true,
            capacity,
            used: AtomicU64::new(0),
            lock: Some(lock),
            closed: AtomicBool::new(false),
        })
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Move a record's charge from `from` bytes to `to` bytes.
    ///
    /// Growth fails with `OutOfMemory` when it would pass the capacity;
    /// shrinking always succeeds. Detached pools never fail.
    pub fn adjust(&self, from: u64, to: u64) -> KvResult<()> {
        if to <= from {
            self.used.fetch_sub(from - to, Ordering::AcqRel);
            return Ok(());
        }
        let grow = to - from;
        if self.capacity == 0 {
            self.used.fetch_add(grow, Ordering::AcqRel);
            return Ok(());
        }
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(grow).filter(|next| *next <= self.capacity)
            })
            .map(|_| ())
            .map_err(|used| KvError::OutOfMemory {
                requested: grow,
                used,
                capacity: self.capacity,
            })
    }

    /// Charge recovered data without a capacity check.
    pub fn restore(&self, from: u64, to: u64) {
        if to >= from {
            self.used.fetch_add(to - from, Ordering::AcqRel);
        } else {
            self.used.fetch_sub(from - to, Ordering::AcqRel);
        }
    }

    pub fn info(&self, records: usize) -> PoolInfo {
        PoolInfo {
            engine: self.engine.clone(),
            path: self.path.clone(),
            persistent: self.persistent,
            capacity: self.capacity,
            used: self.used(),
            records,
            state: if self.closed.load(Ordering::Acquire) {
                PoolState::Closed
            } else {
                PoolState::Open
            },
        }
    }

    /// Release the pool lock. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(lock) = &self.lock {
            if let Err(e) = FileExt::unlock(lock) {
                tracing::warn!(error = %e, "failed to release pool lock");
            }
        }
        tracing::debug!(engine = %self.engine, "pool closed");
    }
}

fn acquire_lock(path: &Path) -> KvResult<File> {
    let lock_path = path.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| KvError::io(&lock_path, "failed to open pool lock", e))?;
    file.try_lock_exclusive().map_err(|e| {
        if e.kind() == std::io::ErrorKind::WouldBlock
            || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
        {
            KvError::PoolLocked {
                path: path.to_path_buf(),
            }
        } else {
            KvError::io(&lock_path, "failed to lock pool", e)
        }
    })?;
    Ok(file)
}

fn read_meta(meta_path: &Path) -> KvResult<PoolMeta> {
    let text = fs::read_to_string(meta_path)
        .map_err(|e| KvError::io(meta_path, "failed to read pool metadata", e))?;
    serde_json::from_str(&text).map_err(|e| KvError::WalCorrupted {
        path: meta_path.to_path_buf(),
        offset: 0,
        reason: format!("invalid pool metadata: {}", e),
    })
}

/// Write metadata with the temp-file, sync, rename, directory-sync sequence.
fn write_meta(dir: &Path, meta: &PoolMeta) -> KvResult<()> {
    let tmp_path = dir.join(format!("{}.tmp", META_FILE));
    let final_path = dir.join(META_FILE);
    let text = serde_json::to_vec_pretty(meta).map_err(|e| KvError::Io {
        path: Some(final_path.clone()),
        kind: std::io::ErrorKind::InvalidData,
        message: format!("failed to encode pool metadata: {}", e),
    })?;

    {
        use std::io::Write;
        let mut file = File::create(&tmp_path)
            .map_err(|e| KvError::io(&tmp_path, "failed to create pool metadata", e))?;
        file.write_all(&text)
            .map_err(|e| KvError::io(&tmp_path, "failed to write pool metadata", e))?;
        durable_sync(&file).map_err(|e| KvError::io(&tmp_path, "failed to sync pool metadata", e))?;
    }
    fs::rename(&tmp_path, &final_path)
        .map_err(|e| KvError::io(&final_path, "failed to install pool metadata", e))?;
    sync_directory(dir).map_err(|e| KvError::io(dir, "failed to sync pool directory", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    fn opts(path: &Path, size: u64) -> PoolOptions {
        PoolOptions {
            path: Some(path.to_path_buf()),
            size,
            ..PoolOptions::default()
        }
    }

    #[test]
    fn test_create_then_reopen_keeps_capacity() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("pool");

        let pool = Pool::persistent("stree", &opts(&dir, 16 * MB)).unwrap();
        assert_eq!(pool.capacity(), 16 * MB);
        pool.close();
        drop(pool);

        let pool = Pool::persistent("stree", &opts(&dir, 0)).unwrap();
        assert_eq!(pool.capacity(), 16 * MB);
        assert!(dir.join(META_FILE).exists());
        assert!(dir.join(WAL_DIR).is_dir());
    }

    #[test]
    fn test_new_pool_requires_size() {
        let temp = TempDir::new().unwrap();
        let err = Pool::persistent("stree", &opts(&temp.path().join("p"), 0)).err().unwrap();
        assert_eq!(err.status(), Status::ConfigParsingError);
    }

    #[test]
    fn test_engine_mismatch_rejected() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("pool");
        drop(Pool::persistent("stree", &opts(&dir, 16 * MB)).unwrap());

        let err = Pool::persistent("cmap", &opts(&dir, 0)).err().unwrap();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn test_missing_parent_rejected() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("no/such/parent/pool");
        let err = Pool::persistent("stree", &opts(&dir, 16 * MB)).err().unwrap();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("pool");
        let first = Pool::persistent("stree", &opts(&dir, 16 * MB)).unwrap();

        let err = Pool::persistent("stree", &opts(&dir, 0)).err().unwrap();
        assert!(matches!(err, KvError::PoolLocked { .. }));

        first.close();
        drop(first);
        assert!(Pool::persistent("stree", &opts(&dir, 0)).is_ok());
    }

    #[test]
    fn test_volatile_requires_existing_dir_and_size() {
        let temp = TempDir::new().unwrap();
        assert!(Pool::volatile("vsmap", &opts(temp.path(), 8 * MB)).is_ok());

        let err = Pool::volatile("vsmap", &opts(&temp.path().join("missing"), 8 * MB)).err().unwrap();
        assert_eq!(err.status(), Status::InvalidArgument);

        let err = Pool::volatile("vsmap", &opts(temp.path(), 0)).err().unwrap();
        assert_eq!(err.status(), Status::ConfigParsingError);

        let err = Pool::volatile("vsmap", &PoolOptions::default()).err().unwrap();
        assert_eq!(err.status(), Status::ConfigParsingError);
    }

    #[test]
    fn test_capacity_accounting() {
        let temp = TempDir::new().unwrap();
        let pool = Pool::volatile("vsmap", &opts(temp.path(), 8 * MB)).unwrap();

        pool.adjust(0, 5 * MB).unwrap();
        let err = pool.adjust(0, 4 * MB).unwrap_err();
        assert_eq!(err.status(), Status::OutOfMemory);
        assert_eq!(pool.used(), 5 * MB);

        pool.adjust(5 * MB, MB).unwrap();
        assert_eq!(pool.used(), MB);
        pool.adjust(0, 4 * MB).unwrap();
        assert_eq!(pool.info(2).used, 5 * MB);
    }

    #[test]
    fn test_info_reports_state() {
        let pool = Pool::detached("blackhole");
        assert_eq!(pool.info(0).state, PoolState::Open);
        pool.adjust(0, u64::MAX / 2).unwrap();
        pool.close();
        pool.close();
        let info = pool.info(0);
        assert_eq!(info.state, PoolState::Closed);
        assert_eq!(info.capacity, 0);
        assert!(!info.persistent);
    }
}
