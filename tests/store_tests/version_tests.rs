//! Tests for Versions and Rollback
//!
//! These tests verify:
//! - open_version returns read-only snapshots of retained versions
//! - Versions before a map was created are rejected
//! - Registered version usage holds back the oldest version to keep
//! - rollback discards uncommitted changes
//! - rollback_to restores an earlier committed state, also across reopen

use std::path::PathBuf;

use atlasmv::{Config, LongType, MvStore, StringType};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("versions.mv");
    (temp_dir, path)
}

fn open(path: &PathBuf) -> MvStore {
    let config = Config::builder()
        .file_path(path)
        .auto_commit_disabled()
        .versions_to_keep(10)
        .build();
    MvStore::open(config).unwrap()
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_open_version_sees_old_state() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let map = store.open_map::<LongType, StringType>("data").unwrap();

    // writes made while the current version is 0 form snapshot 0
    map.put(1, "a".into()).unwrap();
    assert_eq!(store.commit().unwrap(), 1);
    map.put(1, "b".into()).unwrap();
    map.put(2, "c".into()).unwrap();
    assert_eq!(store.commit().unwrap(), 2);

    let old = map.open_version(0).unwrap();
    assert_eq!(old.get(&1).unwrap(), Some("a".to_string()));
    assert_eq!(old.get(&2).unwrap(), None);
    assert!(old.is_read_only());
    assert!(old.put(3, "x".into()).is_err());

    let newer = map.open_version(1).unwrap();
    assert_eq!(newer.get(&1).unwrap(), Some("b".to_string()));
    assert_eq!(newer.size(), 2);
    store.close().unwrap();
}

#[test]
fn test_snapshot_unaffected_by_later_writes() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    for i in 0..100 {
        map.put(i, i).unwrap();
    }
    store.commit().unwrap();

    let snapshot = map.open_version(0).unwrap();
    for i in 0..100 {
        map.remove(&i).unwrap();
    }
    store.commit().unwrap();

    assert_eq!(snapshot.size(), 100);
    assert_eq!(snapshot.cursor(None).unwrap().count(), 100);
    assert!(map.is_empty());
    store.close().unwrap();
}

#[test]
fn test_version_before_map_creation_is_rejected() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let early = store.open_map::<LongType, LongType>("early").unwrap();
    early.put(1, 1).unwrap();
    store.commit().unwrap();
    early.put(2, 2).unwrap();
    store.commit().unwrap();

    let late = store.open_map::<LongType, LongType>("late").unwrap();
    late.put(1, 1).unwrap();
    store.commit().unwrap();

    assert!(late.open_version(0).is_err());
    assert!(late.open_version(store.current_version()).is_ok());
    store.close().unwrap();
}

// =============================================================================
// Version Usage Tests
// =============================================================================

#[test]
fn test_version_usage_holds_back_oldest_version() {
    let (_temp, path) = setup_temp_store();
    let store = MvStore::open(Config::builder().file_path(&path).auto_commit_disabled().build()).unwrap();
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    map.put(1, 1).unwrap();
    store.commit().unwrap();

    let usage = store.register_version_usage();
    assert_eq!(usage.version(), store.current_version());

    for i in 2..6 {
        map.put(i, i).unwrap();
        store.commit().unwrap();
    }
    assert!(store.oldest_version_to_keep() <= usage.version());
    let pinned = map.open_version(usage.version()).unwrap();
    assert_eq!(pinned.get(&1).unwrap(), Some(1));

    drop(usage);
    map.put(100, 100).unwrap();
    store.commit().unwrap();
    map.put(101, 101).unwrap();
    store.commit().unwrap();
    assert!(store.oldest_version_to_keep() > 1);
    store.close().unwrap();
}

// =============================================================================
// Rollback Tests
// =============================================================================

#[test]
fn test_rollback_discards_uncommitted_changes() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    map.put(1, 1).unwrap();
    store.commit().unwrap();

    map.put(1, 100).unwrap();
    map.put(2, 200).unwrap();
    store.rollback().unwrap();

    assert_eq!(map.get(&1).unwrap(), Some(1));
    assert_eq!(map.get(&2).unwrap(), None);
    assert!(!store.has_unsaved_changes());
    store.close().unwrap();
}

#[test]
fn test_rollback_to_committed_version() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let map = store.open_map::<LongType, StringType>("data").unwrap();
    map.put(1, "a".into()).unwrap();
    let first = store.commit().unwrap();
    map.put(1, "b".into()).unwrap();
    map.put(2, "c".into()).unwrap();
    store.commit().unwrap();
    let chunks_before = store.chunk_count();

    store.rollback_to(first).unwrap();

    assert_eq!(store.current_version(), first);
    assert_eq!(map.get(&1).unwrap(), Some("a".to_string()));
    assert_eq!(map.get(&2).unwrap(), None);
    assert!(store.chunk_count() < chunks_before);
    store.close().unwrap();

    let store = open(&path);
    let map = store.open_map::<LongType, StringType>("data").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some("a".to_string()));
    assert_eq!(map.get(&2).unwrap(), None);
    store.close().unwrap();
}

#[test]
fn test_rollback_closes_maps_created_later() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let kept = store.open_map::<LongType, LongType>("kept").unwrap();
    kept.put(1, 1).unwrap();
    let first = store.commit().unwrap();

    let later = store.open_map::<LongType, LongType>("later").unwrap();
    later.put(1, 1).unwrap();
    store.commit().unwrap();

    store.rollback_to(first).unwrap();
    assert!(later.is_closed());
    assert!(!store.has_map("later").unwrap());
    assert!(store.has_map("kept").unwrap());
    store.close().unwrap();
}

#[test]
fn test_rollback_to_unknown_version_fails() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    map.put(1, 1).unwrap();
    store.commit().unwrap();

    assert!(store.rollback_to(store.current_version() + 5).is_err());
    store.close().unwrap();
}

#[test]
fn test_rollback_to_zero_empties_store() {
    let store = MvStore::open(Config::builder().auto_commit_disabled().build()).unwrap();
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    map.put(1, 1).unwrap();
    store.commit().unwrap();

    store.rollback_to(0).unwrap();
    assert_eq!(store.current_version(), 0);
    assert!(store.map_names().unwrap().is_empty());
    assert!(map.is_closed());
    assert_eq!(store.chunk_count(), 0);
    store.close().unwrap();
}
