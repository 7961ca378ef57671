//! Tests for Crash Recovery
//!
//! These tests verify:
//! - Committed data survives a close without shutdown (simulated crash)
//! - Uncommitted changes are lost after a crash
//! - A torn last chunk falls back to the previous chunk
//! - A single damaged header copy is tolerated
//! - Two damaged header copies are reported as corruption
//! - Recovery mode reopens the same consistent state

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use atlasmv::{Config, ErrorCode, LongType, MvStore, StringType};
use tempfile::TempDir;

const BLOCK_SIZE: u64 = 4096;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("recovery.mv");
    (temp_dir, path)
}

fn open(path: &PathBuf) -> MvStore {
    MvStore::open(Config::builder().file_path(path).auto_commit_disabled().build()).unwrap()
}

/// Overwrite `len` bytes at `pos` with `byte`
fn damage(path: &PathBuf, pos: u64, len: usize, byte: u8) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(pos)).unwrap();
    file.write_all(&vec![byte; len]).unwrap();
    file.sync_all().unwrap();
}

/// Commit twice, then crash; returns (block, blocks) of the newest chunk
fn two_commits_then_crash(path: &PathBuf) -> (u64, u64) {
    let store = open(path);
    let map = store.open_map::<LongType, StringType>("data").unwrap();
    map.put(1, "first".into()).unwrap();
    store.commit().unwrap();
    map.put(2, "second".into()).unwrap();
    store.commit().unwrap();

    let last = store
        .chunks()
        .into_iter()
        .max_by_key(|c| c.version)
        .unwrap();
    store.close_immediately();
    (last.block, last.len as u64)
}

// =============================================================================
// Crash Tests
// =============================================================================

#[test]
fn test_committed_data_survives_crash() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        for i in 0..1000 {
            map.put(i, i * i).unwrap();
        }
        store.commit().unwrap();
        store.close_immediately();
    }

    let store = open(&path);
    assert!(!store.store_header().clean_shutdown);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    assert_eq!(map.size(), 1000);
    assert_eq!(map.get(&999).unwrap(), Some(999 * 999));
    assert_eq!(map.validate_tree().unwrap(), 1000);
    store.close().unwrap();
}

#[test]
fn test_uncommitted_changes_are_lost() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        map.put(1, 1).unwrap();
        store.commit().unwrap();
        map.put(2, 2).unwrap();
        store.close_immediately();
    }

    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(1));
    assert_eq!(map.get(&2).unwrap(), None);
    store.close().unwrap();
}

#[test]
fn test_many_commits_then_crash() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        for round in 0..30u64 {
            for i in 0..50u64 {
                map.put(i, round).unwrap();
            }
            store.commit().unwrap();
        }
        store.close_immediately();
    }

    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    assert_eq!(map.get(&0).unwrap(), Some(29));
    assert_eq!(map.get(&49).unwrap(), Some(29));
    assert_eq!(store.current_version(), 30);
    store.close().unwrap();
}

// =============================================================================
// Torn Chunk Tests
// =============================================================================

#[test]
fn test_torn_last_chunk_falls_back() {
    let (_temp, path) = setup_temp_store();
    let (block, blocks) = two_commits_then_crash(&path);

    // wipe the footer, as if the write stopped short
    let footer_end = (block + blocks) * BLOCK_SIZE;
    damage(&path, footer_end - 24, 24, 0);

    let store = open(&path);
    assert_eq!(store.current_version(), 1);
    let map = store.open_map::<LongType, StringType>("data").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some("first".to_string()));
    assert_eq!(map.get(&2).unwrap(), None);

    // the recovered store keeps working
    map.put(3, "third".into()).unwrap();
    store.commit().unwrap();
    store.close().unwrap();

    let store = open(&path);
    let map = store.open_map::<LongType, StringType>("data").unwrap();
    assert_eq!(map.get(&3).unwrap(), Some("third".to_string()));
    assert_eq!(map.get(&1).unwrap(), Some("first".to_string()));
    store.close().unwrap();
}

#[test]
fn test_damaged_last_chunk_header_falls_back() {
    let (_temp, path) = setup_temp_store();
    let (block, _) = two_commits_then_crash(&path);

    damage(&path, block * BLOCK_SIZE, 16, 0xAB);

    let store = open(&path);
    let map = store.open_map::<LongType, StringType>("data").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some("first".to_string()));
    assert_eq!(map.get(&2).unwrap(), None);
    store.close().unwrap();
}

// =============================================================================
// Store Header Tests
// =============================================================================

#[test]
fn test_one_damaged_header_copy_is_tolerated() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        map.put(1, 1).unwrap();
        store.close().unwrap();
    }

    damage(&path, 0, 64, 0xFF);

    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(1));
    store.close().unwrap();
}

#[test]
fn test_both_header_copies_damaged_is_corruption() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        map.put(1, 1).unwrap();
        store.close().unwrap();
    }

    damage(&path, 0, 2 * BLOCK_SIZE as usize, 0);

    let err = MvStore::open(Config::builder().file_path(&path).build()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::FileCorrupt));
}

#[test]
fn test_garbage_file_is_rejected() {
    let (_temp, path) = setup_temp_store();
    std::fs::write(&path, vec![0x5Au8; 3 * BLOCK_SIZE as usize]).unwrap();

    let err = MvStore::open(Config::builder().file_path(&path).build()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::FileCorrupt));
}

// =============================================================================
// Recovery Mode Tests
// =============================================================================

#[test]
fn test_recovery_mode_finds_same_state() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        for i in 0..200 {
            map.put(i, i).unwrap();
            if i % 50 == 49 {
                store.commit().unwrap();
            }
        }
        store.close_immediately();
    }

    let config = Config::builder()
        .file_path(&path)
        .auto_commit_disabled()
        .recovery_mode()
        .build();
    let store = MvStore::open(config).unwrap();
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    assert_eq!(map.size(), 200);
    assert_eq!(map.validate_tree().unwrap(), 200);
    store.close().unwrap();
}
