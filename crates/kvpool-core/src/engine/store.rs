//! Index-backed engines
//!
//! [`Store`] couples a [`KeyIndex`] with a pool and, for persistent pools,
//! a journal:
//!
//! **Read path**: index only, never touches the WAL
//! **Write path (persistent)**: journal lock, capacity check, WAL append,
//! index update, all before the lock is released
//! **Write path (volatile)**: capacity check and insert under the index
//! write lock

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::checkpoint::{start_checkpointer, CheckpointHandle};
use crate::config::PoolOptions;
use crate::error::{KvError, KvResult};
use crate::format::Operation;
use crate::index::{Cursor, KeyIndex, KeyRange};
use crate::journal::Journal;
use crate::pool::{record_charge, Pool, PoolInfo};

use super::Engine;

pub struct Store<I: KeyIndex> {
    name: String,
    index: Arc<I>,
    pool: Pool,
    journal: Option<Arc<Journal>>,
    checkpointer: Mutex<Option<CheckpointHandle>>,
    max_key_size: usize,
    max_value_size: usize,
}

impl<I: KeyIndex + Default> Store<I> {
    /// An in-memory store. Nothing survives `close`.
    pub fn volatile(name: &str, opts: &PoolOptions) -> KvResult<Self> {
        let pool = Pool::volatile(name, opts)?;
        Ok(Self {
            name: name.to_string(),
            index: Arc::new(I::default()),
            pool,
            journal: None,
            checkpointer: Mutex::new(None),
            max_key_size: opts.max_key_size,
            max_value_size: opts.max_value_size,
        })
    }

    /// Open or create a persistent store and rebuild its index.
    pub fn persistent(name: &str, opts: &PoolOptions) -> KvResult<Self> {
        let pool = Pool::persistent(name, opts)?;
        let dir = pool
            .path()
            .map(Path::to_path_buf)
            .ok_or_else(|| KvError::InvalidArgument("persistent pool has no path".into()))?;

        let (journal, records) = Journal::open(&dir, opts)?;
        let index = Arc::new(I::default());
        for record in records {
            match record.op {
                Operation::Put => {
                    let old = index.value_len(&record.key).map(|len| record_charge(record.key.len(), len));
                    pool.restore(old.unwrap_or(0), record_charge(record.key.len(), record.value.len()));
                    index.upsert(&record.key, &record.value, &mut |_| Ok(()))?;
                }
                Operation::Remove => {
                    if let Some(value) = index.remove(&record.key) {
                        pool.restore(record_charge(record.key.len(), value.len()), 0);
                    }
                }
            }
        }
        tracing::info!(
            engine = name,
            records = index.len(),
            used = pool.used(),
            capacity = pool.capacity(),
            "pool opened"
        );

        let journal = Arc::new(journal);
        let checkpointer = if opts.checkpoint_interval_ms > 0 {
            let shared: Arc<dyn KeyIndex> = index.clone();
            Some(start_checkpointer(
                Arc::clone(&journal),
                shared,
                Duration::from_millis(opts.checkpoint_interval_ms),
            )?)
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            index,
            pool,
            journal: Some(journal),
            checkpointer: Mutex::new(checkpointer),
            max_key_size: opts.max_key_size,
            max_value_size: opts.max_value_size,
        })
    }
}

impl<I: KeyIndex> Store<I> {
    fn ensure_open(&self) -> KvResult<()> {
        if self.pool.is_closed() {
            return Err(KvError::Stopped);
        }
        Ok(())
    }

    fn check_sizes(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        if key.len() > self.max_key_size {
            return Err(KvError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.max_key_size as u64,
                component: "key",
            });
        }
        if value.len() > self.max_value_size {
            return Err(KvError::OversizedEntry {
                entry_size: value.len() as u64,
                max_size: self.max_value_size as u64,
                component: "value",
            });
        }
        Ok(())
    }

    fn stop_checkpointer(&self) {
        if let Some(handle) = self.checkpointer.lock().take() {
            handle.shutdown();
        }
    }
}

impl<I: KeyIndex> Engine for Store<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.ensure_open()?;
        self.check_sizes(key, value)?;
        let charge = record_charge(key.len(), value.len());

        let Some(journal) = &self.journal else {
            return self.index.upsert(key, value, &mut |old| {
                let from = old.map_or(0, |len| record_charge(key.len(), len));
                self.pool.adjust(from, charge)
            });
        };

        let mut txn = journal.begin()?;
        let from = self
            .index
            .value_len(key)
            .map_or(0, |len| record_charge(key.len(), len));
        self.pool.adjust(from, charge)?;
        if let Err(e) = txn.append(Operation::Put, key, value) {
            self.pool.restore(charge, from);
            return Err(e);
        }
        self.index.upsert(key, value, &mut |_| Ok(()))?;

        if txn.should_checkpoint() {
            if let Err(e) = txn.checkpoint(self.index.as_ref()) {
                tracing::warn!(engine = %self.name, error = %e, "automatic checkpoint failed");
            }
        }
        Ok(())
    }

    fn get_with(&self, key: &[u8], f: &mut dyn FnMut(&[u8])) -> KvResult<bool> {
        self.ensure_open()?;
        Ok(self.index.with_value(key, f))
    }

    fn remove(&self, key: &[u8]) -> KvResult<bool> {
        self.ensure_open()?;

        let Some(journal) = &self.journal else {
            return Ok(match self.index.remove(key) {
                Some(value) => {
                    self.pool.adjust(record_charge(key.len(), value.len()), 0)?;
                    true
                }
                None => false,
            });
        };

        let mut txn = journal.begin()?;
        let Some(len) = self.index.value_len(key) else {
            return Ok(false);
        };
        txn.append(Operation::Remove, key, &[])?;
        self.index.remove(key);
        self.pool.adjust(record_charge(key.len(), len), 0)?;

        if txn.should_checkpoint() {
            if let Err(e) = txn.checkpoint(self.index.as_ref()) {
                tracing::warn!(engine = %self.name, error = %e, "automatic checkpoint failed");
            }
        }
        Ok(true)
    }

    fn count(&self, range: &KeyRange) -> KvResult<usize> {
        self.ensure_open()?;
        self.index
            .count(range)
            .ok_or_else(|| KvError::not_supported(range.count_operation(), &self.name))
    }

    fn cursor(&self, range: KeyRange) -> KvResult<Box<dyn Cursor>> {
        self.ensure_open()?;
        let operation = range.scan_operation();
        I::cursor(&self.index, range).ok_or_else(|| KvError::not_supported(operation, &self.name))
    }

    fn sync(&self) -> KvResult<()> {
        self.ensure_open()?;
        match &self.journal {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    fn checkpoint(&self) -> KvResult<()> {
        self.ensure_open()?;
        match &self.journal {
            Some(journal) => journal.checkpoint(self.index.as_ref()),
            None => Err(KvError::not_supported("checkpoint", &self.name)),
        }
    }

    fn info(&self) -> PoolInfo {
        self.pool.info(self.index.len())
    }

    fn close(&self) -> KvResult<()> {
        if self.pool.is_closed() {
            return Ok(());
        }
        self.stop_checkpointer();
        let result = match &self.journal {
            Some(journal) => journal.close(self.index.as_ref()),
            None => Ok(()),
        };
        self.pool.close();
        tracing::debug!(engine = %self.name, "engine closed");
        result
    }
}

impl<I: KeyIndex> Drop for Store<I> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(engine = %self.name, error = %e, "close on drop failed");
        }
    }
}
