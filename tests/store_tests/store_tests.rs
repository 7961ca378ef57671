//! Tests for MvStore
//!
//! These tests verify:
//! - Opening new and existing files, in memory and read-only
//! - Commit numbering and unsaved-change tracking
//! - Persistence across close and reopen
//! - Map registry: rename, remove, has_map, has_data
//! - Closed stores reject further use
//! - A failed write closes the store and keeps the cause
//! - The file lock keeps a second writer out

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use atlasmv::{
    AtlasError, BytesType, Config, ErrorCode, LongType, MvStore, StoreState, StringType,
};
use atlasmv::storage::{BlockFile, MemoryFile};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.mv");
    (temp_dir, path)
}

fn open(path: &PathBuf) -> MvStore {
    MvStore::open(Config::builder().file_path(path).auto_commit_disabled().build()).unwrap()
}

/// In-memory file whose writes start failing once `fail_writes` is set
struct FailingFile {
    inner: MemoryFile,
    fail_writes: Arc<AtomicBool>,
}

impl BlockFile for FailingFile {
    fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        self.inner.read_at(buf, pos)
    }

    fn write_at(&self, data: &[u8], pos: u64) -> io::Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
        }
        self.inner.write_at(data, pos)
    }

    fn size(&self) -> io::Result<u64> {
        self.inner.size()
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.inner.truncate(size)
    }

    fn sync(&self) -> io::Result<()> {
        self.inner.sync()
    }

    fn try_lock(&self, exclusive: bool) -> io::Result<bool> {
        self.inner.try_lock(exclusive)
    }
}

fn open_read_only(path: &PathBuf) -> MvStore {
    MvStore::open(
        Config::builder()
            .file_path(path)
            .auto_commit_disabled()
            .read_only()
            .build(),
    )
    .unwrap()
}

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_open_new_file() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);

    assert!(path.exists());
    assert_eq!(store.current_version(), 0);
    assert_eq!(store.state(), StoreState::Open);
    assert!(store.map_names().unwrap().is_empty());
    assert_eq!(store.chunk_count(), 0);
    store.close().unwrap();
}

#[test]
fn test_open_in_memory() {
    let store = MvStore::open_in_memory().unwrap();
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    map.put(1, 2).unwrap();
    store.commit().unwrap();

    assert_eq!(map.get(&1).unwrap(), Some(2));
    assert!(store.chunk_count() > 0);
    store.close().unwrap();
}

#[test]
fn test_header_of_new_file() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let header = store.store_header();

    assert_eq!(header.block_size, 4096);
    assert_eq!(header.format, atlasmv::store::FORMAT_WRITE);
    assert!(header.creation_time > 0);
    store.close().unwrap();
}

// =============================================================================
// Commit Tests
// =============================================================================

#[test]
fn test_commit_advances_version() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();

    map.put(1, 1).unwrap();
    assert!(store.has_unsaved_changes());
    assert_eq!(store.commit().unwrap(), 1);
    assert!(!store.has_unsaved_changes());
    assert_eq!(store.last_stored_version(), 1);

    map.put(2, 2).unwrap();
    assert_eq!(store.commit().unwrap(), 2);
    store.close().unwrap();
}

#[test]
fn test_commit_without_changes_keeps_version() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    map.put(1, 1).unwrap();
    let version = store.commit().unwrap();

    assert_eq!(store.commit().unwrap(), version);
    assert_eq!(store.current_version(), version);
    store.close().unwrap();
}

#[test]
fn test_unsaved_memory_is_tracked() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let map = store.open_map::<LongType, StringType>("data").unwrap();

    for i in 0..100 {
        map.put(i, "x".repeat(100)).unwrap();
    }
    let before = store.unsaved_memory();
    assert!(before > 0);
    store.commit().unwrap();
    assert!(store.unsaved_memory() < before);
    store.close().unwrap();
}

#[test]
fn test_auto_commit_on_buffer_size() {
    let (_temp, path) = setup_temp_store();
    let config = Config::builder()
        .file_path(&path)
        .auto_commit_delay_ms(0)
        .auto_commit_buffer_size(16 * 1024)
        .build();
    let store = MvStore::open(config).unwrap();
    let map = store.open_map::<LongType, StringType>("data").unwrap();

    for i in 0..2000 {
        map.put(i, "y".repeat(64)).unwrap();
    }
    // writes committed on their own once the buffer filled up
    assert!(store.current_version() > 0);
    store.close().unwrap();
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_data_survives_reopen() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let map = store.open_map::<StringType, StringType>("users").unwrap();
        for i in 0..1000 {
            map.put(format!("user{:04}", i), format!("name{}", i)).unwrap();
        }
        store.close().unwrap();
    }

    let store = open(&path);
    let map = store.open_map::<StringType, StringType>("users").unwrap();
    assert_eq!(map.size(), 1000);
    assert_eq!(map.get(&"user0500".to_string()).unwrap(), Some("name500".to_string()));
    assert_eq!(map.validate_tree().unwrap(), 1000);
    assert!(store.store_header().clean_shutdown);
    store.close().unwrap();
}

#[test]
fn test_version_continues_after_reopen() {
    let (_temp, path) = setup_temp_store();
    let version = {
        let store = open(&path);
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        map.put(1, 1).unwrap();
        store.commit().unwrap();
        map.put(2, 2).unwrap();
        let version = store.commit().unwrap();
        store.close().unwrap();
        version
    };

    let store = open(&path);
    assert_eq!(store.current_version(), version);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    map.put(3, 3).unwrap();
    assert_eq!(store.commit().unwrap(), version + 1);
    store.close().unwrap();
}

#[test]
fn test_several_maps_persist() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let longs = store.open_map::<LongType, LongType>("longs").unwrap();
        let bytes = store.open_map::<BytesType, BytesType>("bytes").unwrap();
        longs.put(7, 49).unwrap();
        bytes.put(b"key".to_vec(), b"value".to_vec()).unwrap();
        store.close().unwrap();
    }

    let store = open(&path);
    assert_eq!(store.map_names().unwrap(), vec!["bytes".to_string(), "longs".to_string()]);
    let longs = store.open_map::<LongType, LongType>("longs").unwrap();
    let bytes = store.open_map::<BytesType, BytesType>("bytes").unwrap();
    assert_eq!(longs.get(&7).unwrap(), Some(49));
    assert_eq!(bytes.get(&b"key".to_vec()).unwrap(), Some(b"value".to_vec()));
    store.close().unwrap();
}

#[test]
fn test_compressed_store_round_trips() {
    let (_temp, path) = setup_temp_store();
    let config = || {
        Config::builder()
            .file_path(&path)
            .auto_commit_disabled()
            .compression_level(3)
            .build()
    };
    {
        let store = MvStore::open(config()).unwrap();
        let map = store.open_map::<LongType, StringType>("data").unwrap();
        for i in 0..500 {
            map.put(i, "compressible ".repeat(20)).unwrap();
        }
        store.close().unwrap();
    }

    let store = MvStore::open(config()).unwrap();
    let map = store.open_map::<LongType, StringType>("data").unwrap();
    assert_eq!(map.get(&499).unwrap(), Some("compressible ".repeat(20)));
    store.close().unwrap();
}

// =============================================================================
// Registry Tests
// =============================================================================

#[test]
fn test_rename_map() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let map = store.open_map::<LongType, LongType>("old").unwrap();
        map.put(1, 1).unwrap();
        store.rename_map(&map, "new").unwrap();

        assert!(!store.has_map("old").unwrap());
        assert!(store.has_map("new").unwrap());
        assert_eq!(map.name(), Some("new".to_string()));
        store.close().unwrap();
    }

    let store = open(&path);
    assert_eq!(store.map_names().unwrap(), vec!["new".to_string()]);
    let map = store.open_map::<LongType, LongType>("new").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(1));
    store.close().unwrap();
}

#[test]
fn test_rename_to_taken_name_fails() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let a = store.open_map::<LongType, LongType>("a").unwrap();
    store.open_map::<LongType, LongType>("b").unwrap();

    let err = store.rename_map(&a, "b").unwrap_err();
    assert!(matches!(err, AtlasError::IllegalArgument(_)));
    // renaming to its own name is fine
    store.rename_map(&a, "a").unwrap();
    store.close().unwrap();
}

#[test]
fn test_remove_map() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let map = store.open_map::<LongType, LongType>("gone").unwrap();
        map.put(1, 1).unwrap();
        store.commit().unwrap();

        store.remove_map(&map).unwrap();
        assert!(map.is_closed());
        assert!(!store.has_map("gone").unwrap());
        assert!(map.put(2, 2).is_err());
        store.close().unwrap();
    }

    let store = open(&path);
    assert!(store.map_names().unwrap().is_empty());
    // a new map of the same name starts empty
    let map = store.open_map::<LongType, LongType>("gone").unwrap();
    assert!(map.is_empty());
    store.close().unwrap();
}

#[test]
fn test_has_data() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    assert!(!store.has_data("data").unwrap());
    assert!(!store.has_data("missing").unwrap());

    map.put(1, 1).unwrap();
    store.commit().unwrap();
    assert!(store.has_data("data").unwrap());
    store.close().unwrap();
}

#[test]
fn test_meta_maps_are_readable() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    map.put(1, 1).unwrap();
    store.commit().unwrap();

    let meta = store.meta_map().unwrap();
    let entry = meta.get(&"data".to_string()).unwrap().unwrap();
    assert_eq!(entry.id, map.id());

    let layout = store.layout_map().unwrap();
    assert!(layout.get(&(map.id() as u64)).unwrap().is_some());
    assert!(meta.put("x".to_string(), entry).is_err());
    store.close().unwrap();
}

// =============================================================================
// Read-Only Tests
// =============================================================================

#[test]
fn test_read_only_store() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        map.put(1, 10).unwrap();
        store.close().unwrap();
    }

    let store = open_read_only(&path);
    assert!(store.is_read_only());
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(10));
    assert!(map.put(2, 20).is_err());
    assert!(store.open_map::<LongType, LongType>("other").is_err());
    store.close().unwrap();
}

#[test]
fn test_second_writer_is_locked_out() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);

    let err = MvStore::open(Config::builder().file_path(&path).build()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::FileLocked));
    store.close().unwrap();

    // released on close
    let store = open(&path);
    store.close().unwrap();
}

// =============================================================================
// Close Tests
// =============================================================================

#[test]
fn test_closed_store_rejects_use() {
    let (_temp, path) = setup_temp_store();
    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    store.close().unwrap();

    assert!(store.is_closed());
    assert_eq!(store.state(), StoreState::Closed);
    let err = store.commit().unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::Closed));
    assert_eq!(map.put(1, 1).unwrap_err().code(), Some(ErrorCode::Closed));
    assert!(store.open_map::<LongType, LongType>("data").is_err());
    // closing twice is harmless
    store.close().unwrap();
}

#[test]
fn test_drop_closes_store() {
    let (_temp, path) = setup_temp_store();
    {
        let store = open(&path);
        let map = store.open_map::<LongType, LongType>("data").unwrap();
        map.put(5, 25).unwrap();
    }

    let store = open(&path);
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    assert_eq!(map.get(&5).unwrap(), Some(25));
    store.close().unwrap();
}

#[test]
fn test_failed_write_closes_store() {
    let fail_writes = Arc::new(AtomicBool::new(false));
    let reported = Arc::new(AtomicUsize::new(0));
    let file = FailingFile {
        inner: MemoryFile::new(),
        fail_writes: fail_writes.clone(),
    };
    let counter = reported.clone();
    let config = Config::builder()
        .auto_commit_disabled()
        .background_error_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let store = MvStore::open_with_file(config, Box::new(file)).unwrap();
    let map = store.open_map::<LongType, LongType>("data").unwrap();
    map.put(1, 1).unwrap();
    store.commit().unwrap();
    assert!(store.panic_error().is_none());

    fail_writes.store(true, Ordering::Release);
    map.put(2, 2).unwrap();
    let err = store.commit().unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::WritingFailed));

    // the store closed itself and remembers why
    assert!(store.is_closed());
    assert_eq!(store.state(), StoreState::Closed);
    let cause = store.panic_error().unwrap();
    assert_eq!(cause.code(), Some(ErrorCode::WritingFailed));
    assert!(reported.load(Ordering::SeqCst) >= 1);

    let err = map.put(3, 3).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::Closed));
    assert_eq!(store.commit().unwrap_err().code(), Some(ErrorCode::Closed));
    store.close().unwrap();
}
