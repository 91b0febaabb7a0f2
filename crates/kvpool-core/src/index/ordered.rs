use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Cursor, KeyIndex, KeyRange};
use crate::error::KvResult;

/// Byte-wise sorted index behind a single reader-writer lock.
#[derive(Default)]
pub struct OrderedIndex {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl OrderedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// First record in `range` strictly after `after`.
    fn seek(&self, range: &KeyRange, after: Option<&[u8]>) -> Option<(Vec<u8>, Vec<u8>)> {
        let bounds = range.bounds_after(after)?;
        let map = self.map.read();
        map.range::<[u8], _>(bounds)
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Like [`OrderedIndex::seek`] but leaves the value where it is.
    fn seek_key(&self, range: &KeyRange, after: Option<&[u8]>) -> Option<Vec<u8>> {
        let bounds = range.bounds_after(after)?;
        let map = self.map.read();
        map.range::<[u8], _>(bounds).next().map(|(k, _)| k.clone())
    }
}

impl KeyIndex for OrderedIndex {
    fn is_ordered(&self) -> bool {
        true
    }

    fn with_value(&self, key: &[u8], f: &mut dyn FnMut(&[u8])) -> bool {
        let map = self.map.read();
        match map.get(key) {
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
        let mut map = self.map.write();
        match map.get_mut(key) {
            Some(existing) => {
                admit(Some(existing.len()))?;
                existing.clear();
                existing.extend_from_slice(value);
            }
            None => {
                admit(None)?;
                map.insert(key.to_vec(), value.to_vec());
            }
        }
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.write().remove(key)
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }

    fn count(&self, range: &KeyRange) -> Option<usize> {
        let Some(bounds) = range.bounds_after(None) else {
            return Some(0);
        };
        let map = self.map.read();
        Some(match range {
            KeyRange::All => map.len(),
            _ => map.range::<[u8], _>(bounds).count(),
        })
    }

    fn dump(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> KvResult<()>) -> KvResult<()> {
        let map = self.map.read();
        for (key, value) in map.iter() {
            f(key, value)?;
        }
        Ok(())
    }

    fn cursor(this: &Arc<Self>, range: KeyRange) -> Option<Box<dyn Cursor>> {
        Some(Box::new(OrderedCursor {
            index: Arc::clone(this),
            range,
            last: None,
            done: false,
        }))
    }
}

/// Ascending cursor that re-seeks past the last yielded key on every step.
pub struct OrderedCursor {
    index: Arc<OrderedIndex>,
    range: KeyRange,
    last: Option<Vec<u8>>,
    done: bool,
}

impl Cursor for OrderedCursor {
    fn next_record(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        if self.done {
            return None;
        }
        match self.index.seek(&self.range, self.last.as_deref()) {
            Some((key, value)) => {
                self.last = Some(key.clone());
                Some((key, value))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    fn next_key(&mut self) -> Option<Vec<u8>> {
        if self.done {
            return None;
        }
        match self.index.seek_key(&self.range, self.last.as_deref()) {
            Some(key) => {
                self.last = Some(key.clone());
                Some(key)
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}
