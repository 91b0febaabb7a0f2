//! The `Database` handle and its operations
//!
//! A [`Database`] owns one engine instance bound to one pool. Keys and
//! values are arbitrary byte strings; ordering is byte-wise and every
//! range bound is exclusive.
//!
//! Traversals come in two shapes:
//! - visitors (`get_all`, `get_keys_above`, ...) returning
//!   [`ControlFlow::Break`] to stop, which makes the call report
//!   [`KvError::StoppedByCallback`];
//! - lazy iterators (`iter`, `range`, `keys`), where dropping the iterator
//!   is the stop.
//!
//! No lock is held across visits, so a visitor may call back into the same
//! database. Concurrent writers may or may not be observed by a traversal
//! in flight; see [`crate::index::Cursor`].

use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Config;
use crate::engine::{Engine, EngineRegistry};
use crate::error::{KvError, KvResult};
use crate::index::{Cursor, KeyRange};
use crate::pool::PoolInfo;

pub struct Database {
    engine_name: String,
    engine: RwLock<Option<Arc<dyn Engine>>>,
}

impl Database {
    /// Open `engine` from the built-in registry.
    ///
    /// ```
    /// use kvpool_core::{Config, Database};
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let config = Config::new()
    ///     .with_string("path", dir.path().to_str().unwrap())
    ///     .with_uint64("size", 16 * 1024 * 1024);
    /// let db = Database::open("vsmap", config).unwrap();
    /// db.put(b"key1", b"value1").unwrap();
    /// assert_eq!(db.get(b"key1").unwrap(), Some(b"value1".to_vec()));
    /// ```
    pub fn open(engine: &str, config: Config) -> KvResult<Self> {
        Self::open_with(EngineRegistry::global(), engine, config)
    }

    /// Open with a config given as a JSON object.
    pub fn open_json(engine: &str, json: &str) -> KvResult<Self> {
        Self::open(engine, Config::from_json(json)?)
    }

    /// Open `engine` from a caller-supplied registry. The config is consumed.
    pub fn open_with(registry: &EngineRegistry, engine: &str, config: Config) -> KvResult<Self> {
        let instance = registry.open(engine, &config)?;
        tracing::debug!(engine, "database opened");
        Ok(Self {
            engine_name: engine.to_string(),
            engine: RwLock::new(Some(instance)),
        })
    }

    fn engine(&self) -> KvResult<Arc<dyn Engine>> {
        self.engine.read().clone().ok_or(KvError::Stopped)
    }

    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    /// Close the engine and release the pool. Later calls fail with
    /// "database is stopped". Stopping twice is a no-op.
    pub fn stop(&self) -> KvResult<()> {
        let engine = self.engine.write().take();
        match engine {
            Some(engine) => {
                tracing::debug!(engine = %self.engine_name, "stopping database");
                engine.close()
            }
            None => Ok(()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.engine.read().is_none()
    }

    pub fn info(&self) -> KvResult<PoolInfo> {
        Ok(self.engine()?.info())
    }

    /// Insert or replace.
    pub fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.engine()?.put(key, value)
    }

    pub fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        self.engine()?.get(key)
    }

    /// Hand the stored value to `f` without copying it out.
    /// Returns false if the key is absent.
    pub fn get_with<F>(&self, key: &[u8], mut f: F) -> KvResult<bool>
    where
        F: FnMut(&[u8]),
    {
        self.engine()?.get_with(key, &mut f)
    }

    pub fn exists(&self, key: &[u8]) -> KvResult<bool> {
        self.engine()?.exists(key)
    }

    /// Returns true if a record was removed, false if the key was absent.
    pub fn remove(&self, key: &[u8]) -> KvResult<bool> {
        self.engine()?.remove(key)
    }

    pub fn count(&self, range: &KeyRange) -> KvResult<usize> {
        if range.is_empty() {
            self.engine()?;
            return Ok(0);
        }
        self.engine()?.count(range)
    }

    pub fn count_all(&self) -> KvResult<usize> {
        self.count(&KeyRange::All)
    }

    pub fn count_above(&self, key: &[u8]) -> KvResult<usize> {
        self.count(&KeyRange::above(key))
    }

    pub fn count_below(&self, key: &[u8]) -> KvResult<usize> {
        self.count(&KeyRange::below(key))
    }

    pub fn count_between(&self, lo: &[u8], hi: &[u8]) -> KvResult<usize> {
        self.count(&KeyRange::between(lo, hi))
    }

    /// Visit every record in `range` in ascending key order.
    pub fn visit<F>(&self, range: KeyRange, mut visitor: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        let mut cursor = self.engine()?.cursor(range)?;
        while let Some((key, value)) = cursor.next_record() {
            if visitor(&key, &value).is_break() {
                return Err(KvError::StoppedByCallback);
            }
        }
        Ok(())
    }

    /// Visit every key in `range` without copying values.
    pub fn visit_keys<F>(&self, range: KeyRange, mut visitor: F) -> KvResult<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        let mut cursor = self.engine()?.cursor(range)?;
        while let Some(key) = cursor.next_key() {
            if visitor(&key).is_break() {
                return Err(KvError::StoppedByCallback);
            }
        }
        Ok(())
    }

    pub fn get_all<F>(&self, visitor: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.visit(KeyRange::All, visitor)
    }

    pub fn get_above<F>(&self, key: &[u8], visitor: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.visit(KeyRange::above(key), visitor)
    }

    pub fn get_below<F>(&self, key: &[u8], visitor: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.visit(KeyRange::below(key), visitor)
    }

    pub fn get_between<F>(&self, lo: &[u8], hi: &[u8], visitor: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.visit(KeyRange::between(lo, hi), visitor)
    }

    pub fn get_keys<F>(&self, visitor: F) -> KvResult<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        self.visit_keys(KeyRange::All, visitor)
    }

    pub fn get_keys_above<F>(&self, key: &[u8], visitor: F) -> KvResult<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        self.visit_keys(KeyRange::above(key), visitor)
    }

    pub fn get_keys_below<F>(&self, key: &[u8], visitor: F) -> KvResult<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        self.visit_keys(KeyRange::below(key), visitor)
    }

    pub fn get_keys_between<F>(&self, lo: &[u8], hi: &[u8], visitor: F) -> KvResult<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        self.visit_keys(KeyRange::between(lo, hi), visitor)
    }

    /// Lazy ascending sequence of every record.
    pub fn iter(&self) -> KvResult<Records> {
        self.range(KeyRange::All)
    }

    pub fn range(&self, range: KeyRange) -> KvResult<Records> {
        Ok(Records {
            cursor: self.engine()?.cursor(range)?,
        })
    }

    /// Lazy ascending sequence of keys; values are never copied.
    pub fn keys(&self, range: KeyRange) -> KvResult<Keys> {
        Ok(Keys {
            cursor: self.engine()?.cursor(range)?,
        })
    }

    /// Force buffered WAL bytes to stable storage.
    pub fn sync(&self) -> KvResult<()> {
        self.engine()?.sync()
    }

    /// Snapshot the pool and drop the WAL it covers.
    pub fn checkpoint(&self) -> KvResult<()> {
        self.engine()?.checkpoint()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(engine = %self.engine_name, error = %e, "stop on drop failed");
        }
    }
}

/// Records yielded by [`Database::iter`] and [`Database::range`].
pub struct Records {
    cursor: Box<dyn Cursor>,
}

impl Iterator for Records {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next_record()
    }
}

/// Keys yielded by [`Database::keys`].
pub struct Keys {
    cursor: Box<dyn Cursor>,
}

impl Iterator for Keys {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use tempfile::TempDir;

    fn test_db(engine: &str) -> (Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config::new()
            .with_string("path", dir.path().to_str().unwrap())
            .with_uint64("size", 16 * 1024 * 1024);
        (Database::open(engine, config).unwrap(), dir)
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (db, _dir) = test_db("vsmap");
        db.put(b"k", b"v").unwrap();
        assert!(!db.is_stopped());
        db.stop().unwrap();
        db.stop().unwrap();
        assert!(db.is_stopped());

        let err = db.get(b"k").unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
        assert_eq!(err.to_string(), "database is stopped");
        assert!(db.info().is_err());
    }

    #[test]
    fn test_visitor_stop() {
        let (db, _dir) = test_db("vsmap");
        for key in ["a", "b", "c", "d"] {
            db.put(key.as_bytes(), b"x").unwrap();
        }
        let mut seen = Vec::new();
        let result = db.get_all(|k, _| {
            seen.push(k.to_vec());
            if seen.len() == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(Status::of(&result), Status::StoppedByCb);
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_visitor_may_reenter() {
        let (db, _dir) = test_db("vsmap");
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
        db.get_keys(|k| {
            assert!(db.exists(k).unwrap());
            ControlFlow::Continue(())
        })
        .unwrap();
    }

    #[test]
    fn test_lazy_iterators() {
        let (db, _dir) = test_db("vsmap");
        for key in ["a", "b", "c"] {
            db.put(key.as_bytes(), key.to_uppercase().as_bytes()).unwrap();
        }
        let records: Vec<_> = db.iter().unwrap().collect();
        assert_eq!(records[0], (b"a".to_vec(), b"A".to_vec()));
        assert_eq!(records.len(), 3);

        let keys: Vec<Vec<u8>> = db.keys(KeyRange::above("a")).unwrap().collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let first = db.range(KeyRange::below("c")).unwrap().next();
        assert_eq!(first, Some((b"a".to_vec(), b"A".to_vec())));
    }

    #[test]
    fn test_inverted_range_counts_zero_everywhere() {
        let (db, _dir) = test_db("vcmap");
        db.put(b"a", b"1").unwrap();
        assert_eq!(db.count_between(b"z", b"a").unwrap(), 0);
        assert_eq!(db.count_above(b"a").unwrap_err().status(), Status::NotSupported);
    }

    #[test]
    fn test_get_with_borrows_value() {
        let (db, _dir) = test_db("vsmap");
        db.put(b"k", b"value").unwrap();
        let mut len = 0;
        assert!(db.get_with(b"k", |v| len = v.len()).unwrap());
        assert_eq!(len, 5);
        assert!(!db.get_with(b"missing", |_| panic!("absent key visited")).unwrap());
    }

    #[test]
    fn test_open_json() {
        let dir = TempDir::new().unwrap();
        let json = format!(
            r#"{{"path": {:?}, "size": 16777216}}"#,
            dir.path().to_str().unwrap()
        );
        let db = Database::open_json("vcmap", &json).unwrap();
        assert_eq!(db.engine_name(), "vcmap");
        assert_eq!(db.info().unwrap().capacity, 16777216);

        let err = Database::open_json("vcmap", "{not json").err().unwrap();
        assert_eq!(err.status(), Status::ConfigParsingError);
        let err = Database::open_json("vcmap", r#"{"path": 1.5}"#).err().unwrap();
        assert_eq!(err.status(), Status::ConfigTypeError);
    }
}
