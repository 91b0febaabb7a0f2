//! Crash recovery and pool lifecycle for the persistent engines.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use kvpool_core::checkpoint::CHECKPOINT_FILE;
use kvpool_core::format::{encode_record, Operation};
use kvpool_core::wal::list_segments;
use kvpool_core::{Config, Database, KeyRange, Status};

const PERSISTENT_ENGINES: &[&str] = &["stree", "cmap"];
const MB: u64 = 1024 * 1024;

fn pool_config(path: &Path) -> Config {
    Config::new()
        .with_string("path", path.to_str().unwrap())
        .with_uint64("size", 64 * MB)
}

fn reopen_config(path: &Path) -> Config {
    Config::new().with_string("path", path.to_str().unwrap())
}

fn last_segment(pool: &Path) -> PathBuf {
    let segments = list_segments(&pool.join("wal")).unwrap();
    segments.last().unwrap().1.clone()
}

#[test]
fn test_records_survive_reopen() {
    for engine in PERSISTENT_ENGINES {
        let dir = TempDir::new().unwrap();
        let pool = dir.path().join("pool");
        {
            let db = Database::open(engine, pool_config(&pool)).unwrap();
            db.put(b"survive1", b"yes").unwrap();
            db.put(b"survive2", b"also_yes").unwrap();
            db.put(b"doomed", b"temp").unwrap();
            db.remove(b"doomed").unwrap();
            db.put(b"survive1", b"updated").unwrap();
        }

        let db = Database::open(engine, reopen_config(&pool)).unwrap();
        assert_eq!(db.get(b"survive1").unwrap(), Some(b"updated".to_vec()), "{}", engine);
        assert_eq!(db.get(b"survive2").unwrap(), Some(b"also_yes".to_vec()));
        assert_eq!(db.get(b"doomed").unwrap(), None);
        assert_eq!(db.count_all().unwrap(), 2);
        assert_eq!(db.info().unwrap().capacity, 64 * MB);
    }
}

#[test]
fn test_torn_tail_recovery() {
    for engine in PERSISTENT_ENGINES {
        let dir = TempDir::new().unwrap();
        let pool = dir.path().join("pool");
        {
            let db = Database::open(engine, pool_config(&pool)).unwrap();
            db.put(b"complete", b"entry").unwrap();
        }

        // A crash in the middle of the next append leaves half a record
        let segment = last_segment(&pool);
        let record = encode_record(Operation::Put, b"partial", b"never acknowledged").unwrap();
        let mut data = fs::read(&segment).unwrap();
        data.extend_from_slice(&record[..record.len() / 2]);
        fs::write(&segment, data).unwrap();

        {
            let db = Database::open(engine, reopen_config(&pool)).unwrap();
            assert_eq!(db.get(b"complete").unwrap(), Some(b"entry".to_vec()), "{}", engine);
            assert!(!db.exists(b"partial").unwrap());
            db.put(b"after", b"crash").unwrap();
        }

        let db = Database::open(engine, reopen_config(&pool)).unwrap();
        assert_eq!(db.get(b"after").unwrap(), Some(b"crash".to_vec()), "{}", engine);
        assert_eq!(db.count_all().unwrap(), 2);
    }
}

#[test]
fn test_corrupt_record_is_skipped() {
    let dir = TempDir::new().unwrap();
    let pool = dir.path().join("pool");
    {
        let db = Database::open("stree", pool_config(&pool)).unwrap();
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
        db.put(b"c", b"3").unwrap();
    }

    let segment = last_segment(&pool);
    let one = encode_record(Operation::Put, b"a", b"1").unwrap().len();
    let mut data = fs::read(&segment).unwrap();
    // Last payload byte of the second record
    data[2 * one - 1] ^= 0xFF;
    fs::write(&segment, data).unwrap();

    let db = Database::open("stree", reopen_config(&pool)).unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), None);
    assert_eq!(db.get(b"c").unwrap(), Some(b"3".to_vec()));
}

#[test]
fn test_damaged_length_field_keeps_later_records() {
    let dir = TempDir::new().unwrap();
    let pool = dir.path().join("pool");
    {
        let db = Database::open("stree", pool_config(&pool)).unwrap();
        db.put(b"k1", b"v1").unwrap();
        db.put(b"k2", b"v2").unwrap();
        db.put(b"k3", b"v3").unwrap();
    }

    let segment = last_segment(&pool);
    let one = encode_record(Operation::Put, b"k1", b"v1").unwrap().len();
    let mut data = fs::read(&segment).unwrap();
    let original_len = data.len() as u64;
    // Top bit of the second record's length: it claims to run far past EOF
    data[one + 7] ^= 0x80;
    fs::write(&segment, data).unwrap();

    for _ in 0..2 {
        let db = Database::open("stree", reopen_config(&pool)).unwrap();
        assert_eq!(db.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(db.get(b"k2").unwrap(), None);
        assert_eq!(db.get(b"k3").unwrap(), Some(b"v3".to_vec()));
        assert_eq!(fs::metadata(&segment).unwrap().len(), original_len);
    }
}

#[test]
fn test_checkpoint_then_reopen() {
    for engine in PERSISTENT_ENGINES {
        let dir = TempDir::new().unwrap();
        let pool = dir.path().join("pool");
        {
            let db = Database::open(engine, pool_config(&pool)).unwrap();
            for i in 0..100u32 {
                db.put(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
            }
            db.checkpoint().unwrap();
            for i in 0..10u32 {
                db.remove(&i.to_be_bytes()).unwrap();
            }
        }
        assert!(pool.join(CHECKPOINT_FILE).exists());
        assert_eq!(list_segments(&pool.join("wal")).unwrap().len(), 1);

        let db = Database::open(engine, reopen_config(&pool)).unwrap();
        assert_eq!(db.count_all().unwrap(), 90, "{}", engine);
        assert_eq!(db.get(&50u32.to_be_bytes()).unwrap(), Some(50u32.to_le_bytes().to_vec()));
        assert!(!db.exists(&5u32.to_be_bytes()).unwrap());
    }
}

#[test]
fn test_buffered_mode_persists_on_stop() {
    let dir = TempDir::new().unwrap();
    let pool = dir.path().join("pool");
    {
        let config = pool_config(&pool).with_string("durability", "buffered");
        let db = Database::open("stree", config).unwrap();
        db.put(b"k", b"v").unwrap();
        db.sync().unwrap();
        db.put(b"k2", b"v2").unwrap();
        db.stop().unwrap();
    }
    assert!(pool.join(CHECKPOINT_FILE).exists());

    let db = Database::open("stree", reopen_config(&pool)).unwrap();
    assert_eq!(db.count_all().unwrap(), 2);
    assert_eq!(db.get(b"k2").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_wrong_engine_on_reopen() {
    let dir = TempDir::new().unwrap();
    let pool = dir.path().join("pool");
    drop(Database::open("stree", pool_config(&pool)).unwrap());

    let err = Database::open("cmap", reopen_config(&pool)).err().unwrap();
    assert_eq!(err.status(), Status::InvalidArgument);
    assert!(Database::open("stree", reopen_config(&pool)).is_ok());
}

#[test]
fn test_pool_is_locked_while_open() {
    let dir = TempDir::new().unwrap();
    let pool = dir.path().join("pool");
    let db = Database::open("cmap", pool_config(&pool)).unwrap();

    let err = Database::open("cmap", reopen_config(&pool)).err().unwrap();
    assert_eq!(err.status(), Status::UnknownError);
    assert!(err.to_string().contains("locked"));

    db.stop().unwrap();
    assert!(Database::open("cmap", reopen_config(&pool)).is_ok());
}

#[test]
fn test_new_pool_needs_size() {
    let dir = TempDir::new().unwrap();
    let err = Database::open("stree", reopen_config(&dir.path().join("pool")))
        .err()
        .unwrap();
    assert_eq!(err.status(), Status::ConfigParsingError);
}

#[test]
fn test_damaged_checkpoint_fails_open() {
    let dir = TempDir::new().unwrap();
    let pool = dir.path().join("pool");
    {
        let db = Database::open("stree", pool_config(&pool)).unwrap();
        db.put(b"a", b"1").unwrap();
        db.checkpoint().unwrap();
    }
    let path = pool.join(CHECKPOINT_FILE);
    let mut data = fs::read(&path).unwrap();
    data[10] ^= 0xFF;
    fs::write(&path, data).unwrap();

    let err = Database::open("stree", reopen_config(&pool)).err().unwrap();
    assert_eq!(err.status(), Status::UnknownError);
}

#[test]
fn test_many_segments_trigger_checkpoint() {
    let dir = TempDir::new().unwrap();
    let pool = dir.path().join("pool");
    let config = pool_config(&pool).with_uint64("wal_segment_size", MB);
    let value = vec![3u8; 256 * 1024];
    {
        let db = Database::open("stree", config).unwrap();
        for i in 0..64u32 {
            db.put(format!("key{:02}", i % 16).as_bytes(), &value).unwrap();
        }
        assert!(list_segments(&pool.join("wal")).unwrap().len() <= 5);
    }
    assert!(pool.join(CHECKPOINT_FILE).exists());

    let db = Database::open("stree", reopen_config(&pool)).unwrap();
    assert_eq!(db.count(&KeyRange::All).unwrap(), 16);
    assert_eq!(db.get(b"key07").unwrap(), Some(value));
}
