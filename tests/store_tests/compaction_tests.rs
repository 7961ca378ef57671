//! Tests for Compaction and Space Reuse
//!
//! These tests verify:
//! - compact is a no-op on an empty store or with a zero target
//! - Sparse chunks are rewritten and the data stays intact
//! - Dead chunks are released once retention allows it
//! - compact_file, compact_move_chunks and close_with_compaction keep all data

use std::path::PathBuf;

use atlasmv::{Config, LongType, MvStore, StringType};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("compact.mv");
    (temp_dir, path)
}

fn open(path: &PathBuf) -> MvStore {
    MvStore::open(Config::builder().file_path(path).auto_commit_disabled().build()).unwrap()
}

/// 2000 committed entries, of which the first 1500 are then removed
fn sparse_store(path: &PathBuf) -> MvStore {
    let store = open(path);
    let map = store.open_map::<LongType, StringType>("data").unwrap();
    for i in 0..2000u64 {
        map.put(i, format!("value-{:06}", i)).unwrap();
    }
    store.commit().unwrap();
    for i in 0..1500u64 {
        map.remove(&i).unwrap();
    }
    store.commit().unwrap();
    store.set_retention_time(0);
    store
}

fn assert_remaining(store: &MvStore) {
    let map = store.open_map::<LongType, StringType>("data").unwrap();
    assert_eq!(map.size(), 500);
    assert_eq!(map.get(&1499).unwrap(), None);
    assert_eq!(map.get(&1500).unwrap(), Some("value-001500".to_string()));
    assert_eq!(map.get(&1999).unwrap(), Some("value-001999".to_string()));
    assert_eq!(map.validate_tree().unwrap(), 500);
}

// =============================================================================
// Rewrite Tests
// =============================================================================

#[test]
fn test_compact_on_empty_store_does_nothing() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    assert!(!store.compact(100, u64::MAX).unwrap());
    store.close().unwrap();
}

#[test]
fn test_compact_with_zero_target_does_nothing() {
    let (_temp, path) = setup_temp_store();
    let store = sparse_store(&path);
    assert!(!store.compact(0, u64::MAX).unwrap());
    store.close().unwrap();
}

#[test]
fn test_compact_rewrites_sparse_chunks() {
    let (_temp, path) = setup_temp_store();
    {
        let store = sparse_store(&path);
        assert!(store.chunks_fill_rate() < 100);

        assert!(store.compact(100, u64::MAX).unwrap());
        store.commit().unwrap();
        assert_remaining(&store);
        store.close().unwrap();
    }

    let store = open(&path);
    assert_remaining(&store);
    store.close().unwrap();
}

#[test]
fn test_dead_chunks_are_released() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    store.set_retention_time(0);
    let map = store.open_map::<LongType, LongType>("data").unwrap();

    for round in 0..50u64 {
        for i in 0..20u64 {
            map.put(i, round).unwrap();
        }
        store.commit().unwrap();
    }

    // without reuse every commit would still own its chunk
    assert!(store.chunk_count() < 25);
    assert_eq!(map.get(&7).unwrap(), Some(49));
    store.close().unwrap();
}

// =============================================================================
// File Compaction Tests
// =============================================================================

#[test]
fn test_compact_file_keeps_data() {
    let (_temp, path) = setup_temp_store();
    {
        let store = sparse_store(&path);
        store.compact_file(1000).unwrap();
        assert_remaining(&store);
        store.close().unwrap();
    }

    let store = open(&path);
    assert_remaining(&store);
    store.close().unwrap();
}

#[test]
fn test_compact_move_chunks_keeps_data() {
    let (_temp, path) = setup_temp_store();
    {
        let store = sparse_store(&path);
        store.compact(100, u64::MAX).unwrap();
        store.commit().unwrap();
        store.compact_move_chunks().unwrap();
        assert_remaining(&store);
        store.close().unwrap();
    }

    let store = open(&path);
    assert_remaining(&store);
    store.close().unwrap();
}

#[test]
fn test_close_with_compaction_keeps_data() {
    let (_temp, path) = setup_temp_store();
    {
        let store = sparse_store(&path);
        store.close_with_compaction(1000).unwrap();
    }

    let store = open(&path);
    assert!(store.store_header().clean_shutdown);
    assert_remaining(&store);
    store.close().unwrap();
}
