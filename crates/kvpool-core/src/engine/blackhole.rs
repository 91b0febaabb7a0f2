use crate::error::KvResult;
use crate::index::{Cursor, EmptyCursor, KeyRange};
use crate::pool::{Pool, PoolInfo};

use super::Engine;

/// Accepts every write and stores nothing.
pub struct Blackhole {
    pool: Pool,
}

impl Blackhole {
    pub fn new() -> Self {
        Self {
            pool: Pool::detached("blackhole"),
        }
    }
}

impl Default for Blackhole {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Blackhole {
    fn name(&self) -> &str {
        "blackhole"
    }

    fn put(&self, _key: &[u8], _value: &[u8]) -> KvResult<()> {
        Ok(())
    }

    fn get_with(&self, _key: &[u8], _f: &mut dyn FnMut(&[u8])) -> KvResult<bool> {
        Ok(false)
    }

    fn remove(&self, _key: &[u8]) -> KvResult<bool> {
        Ok(true)
    }

    fn count(&self, _range: &KeyRange) -> KvResult<usize> {
        Ok(0)
    }

    fn cursor(&self, _range: KeyRange) -> KvResult<Box<dyn Cursor>> {
        Ok(Box::new(EmptyCursor))
    }

    fn info(&self) -> PoolInfo {
        self.pool.info(0)
    }

    fn close(&self) -> KvResult<()> {
        self.pool.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blackhole_stores_nothing() {
        let engine = Blackhole::new();
        engine.put(b"key1", b"value1").unwrap();
        assert_eq!(engine.get(b"key1").unwrap(), None);
        assert!(!engine.exists(b"key1").unwrap());
        assert!(engine.remove(b"key1").unwrap());
        assert_eq!(engine.count(&KeyRange::between("A", "Z")).unwrap(), 0);
        assert!(engine.cursor(KeyRange::All).unwrap().next_record().is_none());
        assert_eq!(engine.info().engine, "blackhole");
    }
}
