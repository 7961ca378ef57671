//! Property Tests for Maps
//!
//! These tests verify:
//! - Random put/remove/commit sequences behave like a BTreeMap
//! - Navigation (ceiling, floor, key_at) agrees with the model
//! - Skipping n entries lands where n single steps would
//! - Committed state survives a reopen unchanged

use std::collections::BTreeMap;

use atlasmv::{Config, LongType, MvMap, MvStore};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Put(u64, u64),
    Remove(u64),
    Commit,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn arb_op() -> impl Strategy<Value = Op> {
    // a small key space keeps overwrites and removes of present keys common
    prop_oneof![
        6 => (0u64..300, any::<u64>()).prop_map(|(k, v)| Op::Put(k, v)),
        3 => (0u64..300).prop_map(Op::Remove),
        1 => Just(Op::Commit),
    ]
}

fn setup_temp_store() -> MvStore {
    let config = Config::builder()
        .auto_commit_disabled()
        .keys_per_page(4)
        .build();
    MvStore::open(config).unwrap()
}

fn apply(store: &MvStore, map: &MvMap<LongType, LongType>, model: &mut BTreeMap<u64, u64>, ops: &[Op]) {
    for op in ops {
        match *op {
            Op::Put(k, v) => {
                assert_eq!(map.put(k, v).unwrap(), model.insert(k, v));
            }
            Op::Remove(k) => {
                assert_eq!(map.remove(&k).unwrap(), model.remove(&k));
            }
            Op::Commit => {
                store.commit().unwrap();
            }
        }
    }
}

fn model_entries(model: &BTreeMap<u64, u64>) -> Vec<(u64, u64)> {
    model.iter().map(|(k, v)| (*k, *v)).collect()
}

fn map_entries(map: &MvMap<LongType, LongType>) -> Vec<(u64, u64)> {
    map.cursor(None).unwrap().map(|e| e.unwrap()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The map and the model hold the same entries after any sequence
    #[test]
    fn prop_map_matches_model(ops in proptest::collection::vec(arb_op(), 1..400)) {
        let store = setup_temp_store();
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        let mut model = BTreeMap::new();

        apply(&store, &map, &mut model, &ops);

        prop_assert_eq!(map.size(), model.len() as u64);
        prop_assert_eq!(map_entries(&map), model_entries(&model));
        prop_assert_eq!(map.validate_tree().unwrap(), model.len() as u64);
    }

    /// Navigation answers agree with BTreeMap ranges
    #[test]
    fn prop_navigation_matches_model(
        ops in proptest::collection::vec(arb_op(), 1..300),
        probes in proptest::collection::vec(0u64..320, 1..30),
    ) {
        let store = setup_temp_store();
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        let mut model = BTreeMap::new();
        apply(&store, &map, &mut model, &ops);

        for probe in probes {
            prop_assert_eq!(map.ceiling_key(&probe).unwrap(), model.range(probe..).next().map(|(k, _)| *k));
            prop_assert_eq!(map.floor_key(&probe).unwrap(), model.range(..=probe).next_back().map(|(k, _)| *k));
            prop_assert_eq!(map.higher_key(&probe).unwrap(), model.range(probe + 1..).next().map(|(k, _)| *k));

            let index = probe as usize;
            prop_assert_eq!(map.key_at(index as i64).unwrap(), model.keys().nth(index).copied());
        }
        prop_assert_eq!(map.first_key().unwrap(), model.keys().next().copied());
        prop_assert_eq!(map.last_key().unwrap(), model.keys().next_back().copied());
    }

    /// skip_entries(n) then next() yields the key n + 1 steps would
    #[test]
    fn prop_cursor_skip_matches_stepping(
        count in 1u64..600,
        from in 0u64..700,
        n in 0u64..650,
    ) {
        let store = setup_temp_store();
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        for i in 0..count {
            map.put(i, i).unwrap();
        }

        let mut skipped = map.cursor(Some(&from)).unwrap();
        skipped.skip_entries(n).unwrap();
        let expected = map.cursor(Some(&from)).unwrap().nth(n as usize).map(|e| e.unwrap().0);
        prop_assert_eq!(skipped.next().map(|e| e.unwrap().0), expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// What was committed before close is exactly what a reopen sees
    #[test]
    fn prop_committed_state_survives_reopen(ops in proptest::collection::vec(arb_op(), 1..300)) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("prop.mv");
        let config = || Config::builder().file_path(&path).auto_commit_disabled().keys_per_page(4).build();
        let mut model = BTreeMap::new();
        {
            let store = MvStore::open(config()).unwrap();
            let map = store.open_map::<LongType, LongType>("data").unwrap();
            apply(&store, &map, &mut model, &ops);
            store.close().unwrap();
        }

        let store = MvStore::open(config()).unwrap();
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        prop_assert_eq!(map_entries(&map), model_entries(&model));
        store.close().unwrap();
    }
}
