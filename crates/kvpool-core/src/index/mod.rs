//! In-memory key indexes
//!
//! Every engine keeps its records in one of two indexes: [`OrderedIndex`]
//! (byte-wise sorted, supports range queries) or [`HashIndex`] (sharded,
//! point lookups only). Persistent engines rebuild theirs from the
//! checkpoint and WAL on open.

use std::ops::Bound;
use std::sync::Arc;

use crate::error::KvResult;

mod hashed;
mod ordered;

pub use hashed::{HashCursor, HashIndex};
pub use ordered::{OrderedCursor, OrderedIndex};

/// Which keys a count or traversal covers. All bounds are exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    All,
    /// Keys strictly greater than the bound
    Above(Vec<u8>),
    /// Keys strictly less than the bound
    Below(Vec<u8>),
    /// Keys strictly between the bounds
    Between(Vec<u8>, Vec<u8>),
}

impl KeyRange {
    pub fn above(key: impl Into<Vec<u8>>) -> Self {
        KeyRange::Above(key.into())
    }

    pub fn below(key: impl Into<Vec<u8>>) -> Self {
        KeyRange::Below(key.into())
    }

    pub fn between(lo: impl Into<Vec<u8>>, hi: impl Into<Vec<u8>>) -> Self {
        KeyRange::Between(lo.into(), hi.into())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        match self {
            KeyRange::All => true,
            KeyRange::Above(lo) => key > lo.as_slice(),
            KeyRange::Below(hi) => key < hi.as_slice(),
            KeyRange::Between(lo, hi) => key > lo.as_slice() && key < hi.as_slice(),
        }
    }

    /// True when no key can fall inside the range.
    pub fn is_empty(&self) -> bool {
        match self {
            KeyRange::Between(lo, hi) => lo >= hi,
            KeyRange::Below(hi) => hi.is_empty(),
            _ => false,
        }
    }

    /// Operation name used in "not supported" errors.
    pub(crate) fn count_operation(&self) -> &'static str {
        match self {
            KeyRange::All => "count_all",
            KeyRange::Above(_) => "count_above",
            KeyRange::Below(_) => "count_below",
            KeyRange::Between(..) => "count_between",
        }
    }

    pub(crate) fn scan_operation(&self) -> &'static str {
        match self {
            KeyRange::All => "get_all",
            KeyRange::Above(_) => "get_above",
            KeyRange::Below(_) => "get_below",
            KeyRange::Between(..) => "get_between",
        }
    }

    /// Bounds for a sorted scan resuming after `after`.
    ///
    /// `None` means the scan is exhausted. The returned bounds are always
    /// accepted by `BTreeMap::range`, which panics on inverted or
    /// empty exclusive ranges.
    pub(crate) fn bounds_after<'a>(
        &'a self,
        after: Option<&'a [u8]>,
    ) -> Option<(Bound<&'a [u8]>, Bound<&'a [u8]>)> {
        let (lo, hi) = match self {
            KeyRange::All => (None, None),
            KeyRange::Above(lo) => (Some(lo.as_slice()), None),
            KeyRange::Below(hi) => (None, Some(hi.as_slice())),
            KeyRange::Between(lo, hi) => (Some(lo.as_slice()), Some(hi.as_slice())),
        };
        let lo = match (lo, after) {
            (Some(lo), Some(after)) => Some(lo.max(after)),
            (lo, after) => lo.or(after),
        };
        if let (Some(lo), Some(hi)) = (lo, hi) {
            if lo >= hi {
                return None;
            }
        }
        Some((
            lo.map_or(Bound::Unbounded, Bound::Excluded),
            hi.map_or(Bound::Unbounded, Bound::Excluded),
        ))
    }
}

/// Lazily yields records in index order.
///
/// Cursors hold no lock between calls. A record written after the cursor
/// was created may or may not be seen, and a removed one is never yielded
/// after its removal completes.
pub trait Cursor: Send {
    fn next_record(&mut self) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Next key only. Implementations must not copy the value.
    fn next_key(&mut self) -> Option<Vec<u8>>;
}

/// A cursor over nothing.
pub struct EmptyCursor;

impl Cursor for EmptyCursor {
    fn next_record(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        None
    }

    fn next_key(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// Shared surface of the in-memory indexes.
///
/// Point operations are linearizable per key. `upsert` runs `admit` under
/// the index write lock with the previous value length, so a capacity
/// check and the insert it guards cannot interleave with another writer.
pub trait KeyIndex: Send + Sync + 'static {
    /// Whether keys are kept in byte-wise order (range queries supported).
    fn is_ordered(&self) -> bool;

    /// Run `f` on the stored value. Returns false if the key is absent.
    fn with_value(&self, key: &[u8], f: &mut dyn FnMut(&[u8])) -> bool;

    fn upsert(
        &self,
        key: &[u8],
        value: &[u8],
        admit: &mut dyn FnMut(Option<usize>) -> KvResult<()>,
    ) -> KvResult<()>;

    fn remove(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count keys in `range`, or `None` if the index cannot answer it.
    fn count(&self, range: &KeyRange) -> Option<usize>;

    /// Feed every record to `f`. The caller must block writers meanwhile.
    fn dump(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> KvResult<()>) -> KvResult<()>;

    /// Open a cursor, or `None` if the index cannot scan `range`.
    fn cursor(this: &Arc<Self>, range: KeyRange) -> Option<Box<dyn Cursor>>
    where
        Self: Sized;

    /// Stored length of `key`'s value.
    fn value_len(&self, key: &[u8]) -> Option<usize> {
        let mut len = None;
        self.with_value(key, &mut |value| len = Some(value.len()));
        len
    }
}
