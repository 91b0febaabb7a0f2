//! Property-based tests: engines against a `BTreeMap` model.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use proptest::prelude::*;
use tempfile::TempDir;

use kvpool_core::{Config, Database, KeyRange};

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
}

/// Short keys over a small alphabet so operations collide often.
fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'c', 0u8, 0xFF]), 0..4)
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (arb_key(), prop::collection::vec(any::<u8>(), 0..16)).prop_map(|(k, v)| Op::Put(k, v)),
        1 => arb_key().prop_map(Op::Remove),
    ]
}

fn arb_range() -> impl Strategy<Value = KeyRange> {
    prop_oneof![
        Just(KeyRange::All),
        arb_key().prop_map(KeyRange::Above),
        arb_key().prop_map(KeyRange::Below),
        (arb_key(), arb_key()).prop_map(|(lo, hi)| KeyRange::Between(lo, hi)),
    ]
}

fn open(engine: &str, dir: &TempDir) -> Database {
    let path = if engine == "stree" {
        dir.path().join("pool")
    } else {
        dir.path().to_path_buf()
    };
    let config = Config::new()
        .with_string("path", path.to_str().unwrap())
        .with_uint64("size", 16 * 1024 * 1024)
        .with_string("durability", "buffered");
    Database::open(engine, config).unwrap()
}

fn apply(db: &Database, model: &mut BTreeMap<Vec<u8>, Vec<u8>>, op: &Op) {
    match op {
        Op::Put(k, v) => {
            db.put(k, v).unwrap();
            model.insert(k.clone(), v.clone());
        }
        Op::Remove(k) => {
            let removed = db.remove(k).unwrap();
            assert_eq!(removed, model.remove(k).is_some());
        }
    }
}

fn model_keys(model: &BTreeMap<Vec<u8>, Vec<u8>>, range: &KeyRange) -> Vec<Vec<u8>> {
    model.keys().filter(|k| range.contains(k)).cloned().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_sorted_engine_matches_model(
        ops in prop::collection::vec(arb_op(), 0..80),
        ranges in prop::collection::vec(arb_range(), 1..6),
    ) {
        let dir = TempDir::new().unwrap();
        let db = open("vsmap", &dir);
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&db, &mut model, op);
        }

        prop_assert_eq!(db.count_all().unwrap(), model.len());
        for (k, v) in &model {
            let got = db.get(k).unwrap();
            prop_assert_eq!(got.as_ref(), Some(v));
            prop_assert!(db.exists(k).unwrap());
        }

        for range in &ranges {
            let expected = model_keys(&model, range);
            prop_assert_eq!(db.count(range).unwrap(), expected.len());

            let mut visited = Vec::new();
            db.visit_keys(range.clone(), |k| {
                visited.push(k.to_vec());
                ControlFlow::Continue(())
            })
            .unwrap();
            prop_assert_eq!(&visited, &expected);

            let lazy: Vec<Vec<u8>> = db.range(range.clone()).unwrap().map(|(k, _)| k).collect();
            prop_assert_eq!(&lazy, &expected);
        }
    }

    #[test]
    fn prop_hashed_engine_matches_model(ops in prop::collection::vec(arb_op(), 0..80)) {
        let dir = TempDir::new().unwrap();
        let db = open("vcmap", &dir);
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&db, &mut model, op);
        }

        prop_assert_eq!(db.count_all().unwrap(), model.len());
        let records: Vec<(Vec<u8>, Vec<u8>)> = db.iter().unwrap().collect();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
        prop_assert_eq!(records, expected);
    }

    #[test]
    fn prop_visitor_stop_after_n(n in 1usize..10, total in 0usize..15) {
        let dir = TempDir::new().unwrap();
        let db = open("vsmap", &dir);
        for i in 0..total {
            db.put(&[i as u8], b"v").unwrap();
        }
        let mut visits = 0;
        let result = db.get_all(|_, _| {
            visits += 1;
            if visits == n { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
        });
        if total >= n {
            prop_assert!(result.is_err());
            prop_assert_eq!(visits, n);
        } else {
            prop_assert!(result.is_ok());
            prop_assert_eq!(visits, total);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_persistent_engine_survives_reopen(ops in prop::collection::vec(arb_op(), 0..60)) {
        let dir = TempDir::new().unwrap();
        let mut model = BTreeMap::new();
        {
            let db = open("stree", &dir);
            for op in &ops {
                apply(&db, &mut model, op);
            }
        }

        let db = open("stree", &dir);
        let records: Vec<(Vec<u8>, Vec<u8>)> = db.iter().unwrap().collect();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
        prop_assert_eq!(records, expected);
    }
}
