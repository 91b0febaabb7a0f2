use std::hash::BuildHasher;
use std::sync::Arc;

use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::{Cursor, KeyIndex, KeyRange};
use crate::error::KvResult;

const SHARDS: usize = 16;

/// Hash index split into independently locked shards.
///
/// Writers to keys in different shards never contend. Range counts and
/// scans other than [`KeyRange::All`] are not supported.
pub struct HashIndex {
    hasher: DefaultHashBuilder,
    shards: Vec<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl Default for HashIndex {
    fn default() -> Self {
        Self {
            hasher: DefaultHashBuilder::default(),
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, key: &[u8]) -> &RwLock<HashMap<Vec<u8>, Vec<u8>>> {
        let hash = self.hasher.hash_one(key);
        &self.shards[(hash as usize) % SHARDS]
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.shard(key).read().get(key).cloned()
    }

    /// Sorted copy of every key, taken one shard at a time.
    fn key_snapshot(&self) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            keys.extend(shard.read().keys().cloned());
        }
        keys.sort_unstable();
        keys
    }
}

impl KeyIndex for HashIndex {
    fn is_ordered(&self) -> bool {
        false
    }

    fn with_value(&self, key: &[u8], f: &mut dyn FnMut(&[u8])) -> bool {
        let shard = self.shard(key).read();
        match shard.get(key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    fn upsert(
        &self,
        key: &[u8],
        value: &[u8],
        admit: &mut dyn FnMut(Option<usize>) -> KvResult<()>,
    ) -> KvResult<()> {
        let mut shard = self.shard(key).write();
        match shard.get_mut(key) {
            Some(existing) => {
                admit(Some(existing.len()))?;
                existing.clear();
                existing.extend_from_slice(value);
            }
            None => {
                admit(None)?;
                shard.insert(key.to_vec(), value.to_vec());
            }
        }
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.shard(key).write().remove(key)
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    fn count(&self, range: &KeyRange) -> Option<usize> {
        match range {
            KeyRange::All => Some(self.len()),
            _ => None,
        }
    }

    fn dump(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> KvResult<()>) -> KvResult<()> {
        for shard in &self.shards {
            let shard = shard.read();
            for (key, value) in shard.iter() {
                f(key, value)?;
            }
        }
        Ok(())
    }

    fn cursor(this: &Arc<Self>, range: KeyRange) -> Option<Box<dyn Cursor>> {
        if range != KeyRange::All {
            return None;
        }
        Some(Box::new(HashCursor {
            keys: this.key_snapshot().into_iter(),
            index: Arc::clone(this),
        }))
    }
}

/// Walks a sorted key snapshot, re-reading each value as it goes.
///
/// Keys removed after the snapshot are skipped; keys added after it are
/// not visited.
pub struct HashCursor {
    index: Arc<HashIndex>,
    keys: std::vec::IntoIter<Vec<u8>>,
}

impl Cursor for HashCursor {
    fn next_record(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        loop {
            let key = self.keys.next()?;
            if let Some(value) = self.index.get(&key) {
                return Some((key, value));
            }
        }
    }

    fn next_key(&mut self) -> Option<Vec<u8>> {
        loop {
            let key = self.keys.next()?;
            if self.index.with_value(&key, &mut |_| {}) {
                return Some(key);
            }
        }
    }
}
