//! Checkpoints and the background checkpointer
//!
//! A checkpoint is a full snapshot of the index plus the number of the
//! first WAL segment it does not cover. It is installed with the atomic
//! rename pattern:
//!
//! 1. Write `checkpoint.kvp.tmp` (header, then one Put record per key)
//! 2. durable_sync the temp file
//! 3. Rename it over `checkpoint.kvp`
//! 4. Sync the pool directory
//!
//! A crash before the rename leaves the previous checkpoint and every
//! segment it needs in place. A crash after it only leaves obsolete
//! segments, which the next open deletes.

use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{KvError, KvResult};
use crate::format::{encode_record, CheckpointHeader, LogRecord, Operation, CHECKPOINT_HEADER_SIZE};
use crate::index::KeyIndex;
use crate::journal::Journal;
use crate::platform_durability::{durable_sync, sync_directory};
use crate::wal::{read_file, scan_records};

pub const CHECKPOINT_FILE: &str = "checkpoint.kvp";

/// Outcome of writing one checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointResult {
    pub path: PathBuf,
    /// First WAL segment not covered
    pub segment: u64,
    pub records: u64,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Snapshot `index` into `dir/checkpoint.kvp`.
///
/// The caller must keep writers out of the index until this returns.
pub fn write_checkpoint(dir: &Path, segment: u64, index: &dyn KeyIndex) -> KvResult<CheckpointResult> {
    let start = Instant::now();
    let tmp_path = dir.join(format!("{}.tmp", CHECKPOINT_FILE));
    let final_path = dir.join(CHECKPOINT_FILE);

    let file = File::create(&tmp_path)
        .map_err(|e| KvError::io(&tmp_path, "failed to create checkpoint", e))?;
    let mut writer = BufWriter::new(file);

    let placeholder = CheckpointHeader { segment, records: 0 };
    writer
        .write_all(&placeholder.to_bytes())
        .map_err(|e| KvError::io(&tmp_path, "failed to write checkpoint header", e))?;

    let mut records = 0u64;
    let mut bytes = CHECKPOINT_HEADER_SIZE as u64;
    index.dump(&mut |key, value| {
        let encoded = encode_record(Operation::Put, key, value)?;
        writer
            .write_all(&encoded)
            .map_err(|e| KvError::io(&tmp_path, "failed to write checkpoint record", e))?;
        records += 1;
        bytes += encoded.len() as u64;
        Ok(())
    })?;

    let mut file = writer
        .into_inner()
        .map_err(|e| KvError::io(&tmp_path, "failed to flush checkpoint", e.into_error()))?;
    let header = CheckpointHeader { segment, records };
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.write_all(&header.to_bytes()))
        .map_err(|e| KvError::io(&tmp_path, "failed to finalize checkpoint header", e))?;
    durable_sync(&file).map_err(|e| KvError::io(&tmp_path, "failed to sync checkpoint", e))?;
    drop(file);

    fs::rename(&tmp_path, &final_path)
        .map_err(|e| KvError::io(&final_path, "failed to install checkpoint", e))?;
    sync_directory(dir).map_err(|e| KvError::io(dir, "failed to sync pool directory", e))?;

    Ok(CheckpointResult {
        path: final_path,
        segment,
        records,
        bytes,
        elapsed: start.elapsed(),
    })
}

/// Load the checkpoint in `dir`, if there is one.
///
/// Unlike WAL replay this is strict: a checkpoint was synced before it was
/// installed, so any damage means lost data and is reported as an error.
pub fn load_checkpoint(dir: &Path) -> KvResult<Option<(CheckpointHeader, Vec<LogRecord>)>> {
    let path = dir.join(CHECKPOINT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let buf = read_file(&path)?;
    let header = CheckpointHeader::from_bytes(&buf, &path)?;
    let body = &buf[CHECKPOINT_HEADER_SIZE..];
    let scan = scan_records(body, &path);

    if scan.skipped > 0 || scan.torn || scan.records.len() as u64 != header.records {
        return Err(KvError::WalCorrupted {
            path,
            offset: (CHECKPOINT_HEADER_SIZE + scan.valid_end) as u64,
            reason: format!(
                "checkpoint holds {} readable records, header says {}",
                scan.records.len(),
                header.records
            ),
        });
    }
    Ok(Some((header, scan.records)))
}

/// Handle to the background checkpoint thread.
/// Dropping it stops the thread.
pub struct CheckpointHandle {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CheckpointHandle {
    /// Signal the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn stop(&mut self) {
        {
            let (flag, wake) = &*self.shutdown;
            *flag.lock() = true;
            wake.notify_all();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CheckpointHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start a thread that checkpoints every `interval` while there are
/// WAL records not yet covered by a checkpoint.
pub fn start_checkpointer(
    journal: Arc<Journal>,
    index: Arc<dyn KeyIndex>,
    interval: Duration,
) -> KvResult<CheckpointHandle> {
    let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
    let shutdown_clone = Arc::clone(&shutdown);

    let thread = thread::Builder::new()
        .name("kvpool-checkpoint".to_string())
        .spawn(move || checkpoint_loop(journal, index, interval, shutdown_clone))
        .map_err(|e| KvError::Io {
            path: None,
            kind: e.kind(),
            message: format!("failed to spawn checkpoint thread: {}", e),
        })?;

    Ok(CheckpointHandle {
        shutdown,
        thread: Some(thread),
    })
}

fn checkpoint_loop(
    journal: Arc<Journal>,
    index: Arc<dyn KeyIndex>,
    interval: Duration,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
) {
    let (flag, wake) = &*shutdown;
    loop {
        {
            let mut stop = flag.lock();
            if !*stop {
                wake.wait_for(&mut stop, interval);
            }
            if *stop {
                return;
            }
        }

        if journal.pending() == 0 {
            continue;
        }
        match journal.checkpoint(index.as_ref()) {
            Ok(()) => {}
            Err(KvError::Stopped) => return,
            Err(e) => tracing::error!(error = %e, "background checkpoint failed"),
        }
    }
}
