//! Tests for Cursor
//!
//! These tests verify:
//! - Full scans return every entry in key order
//! - Starting keys that are present, absent or out of range
//! - Inclusive upper bounds and reverse iteration
//! - Skipping by stepping and by index
//! - Cursors keep reading the snapshot they were opened on

use atlasmv::{Config, LongType, MvMap, MvStore, StringType};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store() -> MvStore {
    let config = Config::builder()
        .auto_commit_disabled()
        .keys_per_page(4)
        .build();
    MvStore::open(config).unwrap()
}

/// Keys 0, 2, 4, ..., 2 * (count - 1)
fn even_keys(store: &MvStore, count: u64) -> MvMap<LongType, LongType> {
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    for i in 0..count {
        map.put(i * 2, i).unwrap();
    }
    map
}

fn collect_keys(map: &MvMap<LongType, LongType>, from: Option<u64>, to: Option<u64>, reverse: bool) -> Vec<u64> {
    map.cursor_range(from.as_ref(), to, reverse)
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect()
}

// =============================================================================
// Scan Tests
// =============================================================================

#[test]
fn test_empty_map_yields_nothing() {
    let store = setup_temp_store();
    let map = store.open_map::<LongType, LongType>("data").unwrap();

    assert_eq!(map.cursor(None).unwrap().count(), 0);
    assert!(collect_keys(&map, None, None, true).is_empty());
}

#[test]
fn test_full_scan_in_order() {
    let store = setup_temp_store();
    let map = even_keys(&store, 200);

    let entries: Vec<(u64, u64)> = map.cursor(None).unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(entries.len(), 200);
    for (i, (key, value)) in entries.iter().enumerate() {
        assert_eq!(*key, i as u64 * 2);
        assert_eq!(*value, i as u64);
    }
}

#[test]
fn test_keys_iterator() {
    let store = setup_temp_store();
    let map = store.open_map::<StringType, LongType>("names").unwrap();
    for name in ["carol", "alice", "bob"] {
        map.put(name.to_string(), 1).unwrap();
    }

    let keys: Vec<String> = map.keys().unwrap().map(|k| k.unwrap()).collect();
    assert_eq!(keys, vec!["alice", "bob", "carol"]);
}

// =============================================================================
// Range Tests
// =============================================================================

#[test]
fn test_from_present_key() {
    let store = setup_temp_store();
    let map = even_keys(&store, 50);

    let keys = collect_keys(&map, Some(90), None, false);
    assert_eq!(keys, vec![90, 92, 94, 96, 98]);
}

#[test]
fn test_from_absent_key_starts_at_next_key() {
    let store = setup_temp_store();
    let map = even_keys(&store, 50);

    let keys = collect_keys(&map, Some(91), None, false);
    assert_eq!(keys, vec![92, 94, 96, 98]);
    assert!(collect_keys(&map, Some(99), None, false).is_empty());
}

#[test]
fn test_upper_bound_is_inclusive() {
    let store = setup_temp_store();
    let map = even_keys(&store, 50);

    assert_eq!(collect_keys(&map, Some(10), Some(16), false), vec![10, 12, 14, 16]);
    assert_eq!(collect_keys(&map, Some(10), Some(17), false), vec![10, 12, 14, 16]);
}

#[test]
fn test_reverse_scan() {
    let store = setup_temp_store();
    let map = even_keys(&store, 50);

    let all = collect_keys(&map, None, None, true);
    assert_eq!(all.len(), 50);
    assert_eq!(all[0], 98);
    assert_eq!(all[49], 0);

    // reversed: start at or below `from`, stop below `to`
    assert_eq!(collect_keys(&map, Some(15), Some(8), true), vec![14, 12, 10, 8]);
}

// =============================================================================
// Skip Tests
// =============================================================================

#[test]
fn test_skip_by_stepping() {
    let store = setup_temp_store();
    let map = even_keys(&store, 100);

    let mut cursor = map.cursor(None).unwrap();
    cursor.skip_entries(3).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().0, 6);
    assert_eq!(cursor.key(), Some(&6));
    assert_eq!(cursor.value(), Some(&3));
}

#[test]
fn test_skip_by_index() {
    let store = setup_temp_store();
    let map = even_keys(&store, 100);

    let mut cursor = map.cursor(Some(&20)).unwrap();
    cursor.skip_entries(50).unwrap();
    // key 20 is entry 10, so the next one is entry 60
    assert_eq!(cursor.next().unwrap().unwrap().0, 120);

    let mut cursor = map.cursor(None).unwrap();
    cursor.skip_entries(1000).unwrap();
    assert!(cursor.next().is_none());
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_cursor_reads_its_snapshot() {
    let store = setup_temp_store();
    let map = even_keys(&store, 20);

    let cursor = map.cursor(None).unwrap();
    for i in 0..20u64 {
        map.remove(&(i * 2)).unwrap();
    }
    map.put(1, 1).unwrap();

    // the cursor still walks the tree it started on
    let keys: Vec<u64> = cursor.map(|e| e.unwrap().0).collect();
    assert_eq!(keys.len(), 20);
    assert_eq!(map.size(), 1);
}

#[test]
fn test_cursor_over_committed_pages() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("cursor.mv");
    {
        let store = MvStore::open(Config::builder().file_path(&path).keys_per_page(4).build()).unwrap();
        even_keys(&store, 300);
        store.close().unwrap();
    }

    let store = MvStore::open(Config::builder().file_path(&path).keys_per_page(4).build()).unwrap();
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    let keys = collect_keys(&map, Some(500), Some(510), false);
    assert_eq!(keys, vec![500, 502, 504, 506, 508, 510]);
    assert_eq!(map.cursor(None).unwrap().count(), 300);
    store.close().unwrap();
}
