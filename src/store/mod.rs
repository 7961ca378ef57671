//! Store Module
//!
//! The store owns the file, the chunks written to it and every open map.
//!
//! ## Responsibilities
//! - Map registry (names, ids, creation versions) kept in the map-name map
//! - Commit: collect changed roots, serialize them into a chunk, place it
//! - Version tracking so old roots stay readable while in use
//! - Space reclamation: dead chunks, compaction, chunk moves
//! - Crash recovery on open
//!
//! ## Architecture
//! ```text
//!  ┌──────────┐ ┌──────────┐        ┌───────────────────────────────────┐
//!  │ MvMap 5  │ │ MvMap 6  │  ...   │ meta maps                         │
//!  └────┬─────┘ └────┬─────┘        │  0: map names  → MapMetadata      │
//!       │ roots      │              │  1: layout     map id → root pos  │
//!       ▼            ▼              │  2: chunk map  chunk id → Chunk   │
//!  ┌────────────────────────────┐   └─────────────────┬─────────────────┘
//!  │ commit: collect + serialize│◄────────────────────┘
//!  └──────────────┬─────────────┘
//!                 ▼
//!  ┌────────────────────────────┐   ┌────────────────────────────┐
//!  │ FileStore (blocks, bitmap) │◄──│ page caches (leaf/non-leaf)│
//!  └────────────────────────────┘   └────────────────────────────┘
//! ```
//!
//! ## Locks
//! `store_lock` → `serialization_lock` → `save_chunk_lock`, always taken in
//! this order. All three are reentrant.

mod cache;
mod commit;
mod compact;
pub mod header;
mod reader;
mod recovery;
mod registry;
mod serializer;
pub mod versions;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::codec::compress::{self, Compressor, ZstdCompressor};
use crate::config::Config;
use crate::error::{AtlasError, ErrorCode, Result};
use crate::map::{MapCore, MapHandle, MapSettings, MvMap};
use crate::page::RemovedPageInfo;
use crate::storage::{BlockFile, Chunk, FileStore};
use crate::types::{BytesType, DataType, KeyType, LongType, SerdeType, StringType};

use cache::PageCache;
use serializer::{BackgroundWriter, Serializer};
use versions::TxCounter;

pub use header::{StoreHeader, FORMAT_READ, FORMAT_WRITE};
pub use versions::VersionUsage;

/// Map-name map: name → [`MapMetadata`]
pub const NAME_MAP_ID: u32 = 0;
/// Layout map: map id → root page position
pub const LAYOUT_MAP_ID: u32 = 1;
/// Chunk map: chunk id → chunk metadata
pub const CHUNK_MAP_ID: u32 = 2;
/// First id handed out to user maps
pub const MIN_USER_MAP_ID: u32 = 5;

const CACHE_MB: usize = 1024 * 1024;

/// Lifecycle of a store; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum StoreState {
    Open = 0,
    Stopping = 1,
    Closing = 2,
    Closed = 3,
}

impl StoreState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StoreState::Open,
            1 => StoreState::Stopping,
            2 => StoreState::Closing,
            _ => StoreState::Closed,
        }
    }
}

/// Registry entry of a user map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapMetadata {
    pub id: u32,
    /// Store version current when the map was created
    pub create_version: u64,
}

pub(crate) type NameMap = MapCore<StringType, SerdeType<MapMetadata>>;
pub(crate) type LayoutMap = MapCore<LongType, LongType>;
pub(crate) type ChunkMap = MapCore<LongType, BytesType>;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Store Core
// =============================================================================

/// Shared state of an open store
///
/// Maps hold a `Weak` reference to it; [`MvStore`] is the owning handle.
pub(crate) struct StoreCore {
    weak_self: Weak<StoreCore>,
    config: Config,
    file: FileStore,
    state: AtomicU8,

    // -------------------------------------------------------------------------
    // Locks
    // -------------------------------------------------------------------------
    /// Commit, close, rollback, registry changes and chunk moves
    store_lock: ReentrantMutex<()>,
    /// Building a chunk and the chunk bookkeeping around it
    serialization_lock: ReentrantMutex<()>,
    /// File placement and free space
    save_chunk_lock: ReentrantMutex<()>,

    // -------------------------------------------------------------------------
    // Header and Maps
    // -------------------------------------------------------------------------
    header: Mutex<StoreHeader>,
    /// Copy of the header creation time, read on every commit
    creation_time: AtomicU64,
    name_map: Arc<NameMap>,
    layout: Arc<LayoutMap>,
    chunk_map: Arc<ChunkMap>,
    maps: RwLock<HashMap<u32, Arc<dyn MapHandle>>>,
    last_map_id: AtomicU32,
    /// The registry changed in a way the map-name map alone does not show
    meta_changed: AtomicBool,

    // -------------------------------------------------------------------------
    // Chunks
    // -------------------------------------------------------------------------
    chunks: RwLock<HashMap<u32, Chunk>>,
    last_chunk_id: Mutex<Option<u32>>,
    /// Version of the last chunk, 0 when there is none
    last_chunk_version: AtomicU64,
    /// Counter for new chunk ids
    chunk_id_counter: AtomicU32,
    dead_chunks: Mutex<VecDeque<u32>>,
    removed_pages: Mutex<Vec<RemovedPageInfo>>,
    tocs: Mutex<HashMap<u32, Arc<Vec<u64>>>>,

    // -------------------------------------------------------------------------
    // Pages
    // -------------------------------------------------------------------------
    leaf_cache: PageCache,
    non_leaf_cache: PageCache,
    compressor: Box<dyn Compressor>,
    decompressor: ZstdCompressor,

    // -------------------------------------------------------------------------
    // Versions
    // -------------------------------------------------------------------------
    current_version: AtomicU64,
    oldest_version_to_keep: AtomicU64,
    versions: Mutex<VecDeque<Arc<TxCounter>>>,
    current_tx_counter: ArcSwap<TxCounter>,

    // -------------------------------------------------------------------------
    // Commit State
    // -------------------------------------------------------------------------
    unsaved_memory: AtomicI64,
    save_needed: AtomicBool,
    store_in_progress: AtomicBool,
    /// Milliseconds since creation
    last_commit_time: AtomicU64,
    retention_time: AtomicI64,
    reuse_space: AtomicBool,
    auto_compact_last_file_op_count: AtomicU64,

    // -------------------------------------------------------------------------
    // Background
    // -------------------------------------------------------------------------
    serializer: Mutex<Option<Arc<Serializer>>>,
    /// Jobs submitted to the serializer and not yet finished
    serializer_busy: AtomicUsize,
    writer: Mutex<Option<BackgroundWriter>>,
    panic_error: Mutex<Option<AtlasError>>,
}

impl StoreCore {
    fn new(weak_self: Weak<StoreCore>, config: Config, file: FileStore) -> Self {
        let settings = MapSettings::from_config(&config);
        let name_map = Arc::new(NameMap::new(
            weak_self.clone(),
            NAME_MAP_ID,
            0,
            settings,
            false,
            false,
        ));
        let layout = Arc::new(LayoutMap::new(
            weak_self.clone(),
            LAYOUT_MAP_ID,
            0,
            settings,
            false,
            false,
        ));
        let chunk_map = Arc::new(ChunkMap::new(
            weak_self.clone(),
            CHUNK_MAP_ID,
            0,
            settings,
            false,
            false,
        ));
        let compression_level = config.compression_level;
        let leaf_cache = PageCache::new(config.leaf_cache_size_mb.saturating_mul(CACHE_MB));
        let non_leaf_cache = PageCache::new(config.non_leaf_cache_size_mb.saturating_mul(CACHE_MB));
        let retention_time = config.retention_time_ms;
        let reuse_space = config.reuse_space;

        Self {
            weak_self,
            config,
            file,
            state: AtomicU8::new(StoreState::Open as u8),
            store_lock: ReentrantMutex::new(()),
            serialization_lock: ReentrantMutex::new(()),
            save_chunk_lock: ReentrantMutex::new(()),
            header: Mutex::new(StoreHeader::new(0)),
            creation_time: AtomicU64::new(0),
            name_map,
            layout,
            chunk_map,
            maps: RwLock::new(HashMap::new()),
            last_map_id: AtomicU32::new(MIN_USER_MAP_ID - 1),
            meta_changed: AtomicBool::new(false),
            chunks: RwLock::new(HashMap::new()),
            last_chunk_id: Mutex::new(None),
            last_chunk_version: AtomicU64::new(0),
            chunk_id_counter: AtomicU32::new(0),
            dead_chunks: Mutex::new(VecDeque::new()),
            removed_pages: Mutex::new(Vec::new()),
            tocs: Mutex::new(HashMap::new()),
            leaf_cache,
            non_leaf_cache,
            compressor: compress::for_level(compression_level),
            decompressor: ZstdCompressor::new(compression_level.max(1)),
            current_version: AtomicU64::new(0),
            oldest_version_to_keep: AtomicU64::new(0),
            versions: Mutex::new(VecDeque::new()),
            current_tx_counter: ArcSwap::from_pointee(TxCounter::new(0)),
            unsaved_memory: AtomicI64::new(0),
            save_needed: AtomicBool::new(false),
            store_in_progress: AtomicBool::new(false),
            last_commit_time: AtomicU64::new(0),
            retention_time: AtomicI64::new(retention_time),
            reuse_space: AtomicBool::new(reuse_space),
            auto_compact_last_file_op_count: AtomicU64::new(0),
            serializer: Mutex::new(None),
            serializer_busy: AtomicUsize::new(0),
            writer: Mutex::new(None),
            panic_error: Mutex::new(None),
        }
    }

    /// Open (or create) the store described by `config`
    pub(crate) fn open(config: Config) -> Result<Arc<StoreCore>> {
        // Step 1: Open and lock the file
        let file = FileStore::open(config.file_path.as_deref(), config.read_only)?;
        Self::open_with(config, file)
    }

    pub(crate) fn open_with(config: Config, file: FileStore) -> Result<Arc<StoreCore>> {
        // Step 2: Build the store around its meta maps
        let core = Arc::new_cyclic(|weak| StoreCore::new(weak.clone(), config, file));

        // Step 3: Read the header, recovering the newest consistent state
        core.load()?;

        // Step 4: Background serializer and writer
        if !core.file.is_read_only() && core.config.auto_commit_delay_ms > 0 {
            core.start_background()?;
        }

        info!(
            path = ?core.file.path(),
            version = core.current_version(),
            chunks = core.chunks.read().len(),
            maps = core.last_map_id.load(Ordering::Acquire).saturating_sub(MIN_USER_MAP_ID - 1),
            "Opened store"
        );
        Ok(core)
    }

    fn load(&self) -> Result<()> {
        let _guard = self.store_lock.lock();
        if self.file.size() == 0 {
            self.set_header(StoreHeader::new(now_ms()));
            self.layout.set_root_page_info(0, 0)?;
            self.chunk_map.set_root_page_info(0, 0)?;
            if !self.file.is_read_only() {
                let _save = self.save_chunk_lock.lock();
                self.write_store_header()?;
            }
        } else {
            self.read_store_header()?;
        }
        self.last_commit_time
            .store(self.time_since_creation(), Ordering::Release);

        let current = self.current_version();
        let name_root = self.layout.get(&(NAME_MAP_ID as u64))?.unwrap_or(0);
        self.name_map
            .set_root_page_info(name_root, current.saturating_sub(1))?;
        self.scrub_name_map()?;
        self.scrub_layout_map()?;
        self.on_version_change(current);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    pub(crate) fn state(&self) -> StoreState {
        StoreState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StoreState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == StoreState::Open
    }

    pub(crate) fn is_open_or_stopping(&self) -> bool {
        self.state() <= StoreState::Stopping
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == StoreState::Closed
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_open_or_stopping() {
            return Ok(());
        }
        let message = match &*self.panic_error.lock() {
            Some(cause) => format!("This store is closed: {}", cause),
            None => "This store is closed".to_string(),
        };
        Err(AtlasError::store(ErrorCode::Closed, message))
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.file.is_read_only()
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn file(&self) -> &FileStore {
        &self.file
    }

    pub(crate) fn current_version(&self) -> u64 {
        self.current_version.load(Ordering::Acquire)
    }

    pub(crate) fn store_header(&self) -> StoreHeader {
        self.header.lock().clone()
    }

    fn set_header(&self, header: StoreHeader) {
        self.creation_time
            .store(header.creation_time, Ordering::Release);
        *self.header.lock() = header;
    }

    pub(crate) fn time_since_creation(&self) -> u64 {
        now_ms().saturating_sub(self.creation_time.load(Ordering::Acquire))
    }

    pub(crate) fn retention_time(&self) -> i64 {
        self.retention_time.load(Ordering::Acquire)
    }

    pub(crate) fn set_retention_time(&self, ms: i64) {
        self.retention_time.store(ms, Ordering::Release);
    }

    pub(crate) fn reuse_space(&self) -> bool {
        self.reuse_space.load(Ordering::Acquire)
    }

    pub(crate) fn set_reuse_space(&self, reuse: bool) {
        self.reuse_space.store(reuse, Ordering::Release);
    }

    pub(crate) fn unsaved_memory(&self) -> i64 {
        self.unsaved_memory.load(Ordering::Acquire)
    }

    fn mark_meta_changed(&self) {
        self.meta_changed.store(true, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Chunk Registry
    // -------------------------------------------------------------------------

    pub(crate) fn last_chunk(&self) -> Option<Chunk> {
        let id = (*self.last_chunk_id.lock())?;
        self.chunks.read().get(&id).cloned()
    }

    fn set_last_chunk_ref(&self, chunk: Option<&Chunk>) {
        *self.last_chunk_id.lock() = chunk.map(|c| c.id);
        self.last_chunk_version
            .store(chunk.map_or(0, |c| c.version), Ordering::Release);
    }

    /// Snapshot of every known chunk, ordered by id
    pub(crate) fn chunk_list(&self) -> Vec<Chunk> {
        let mut list: Vec<Chunk> = self.chunks.read().values().cloned().collect();
        list.sort_by_key(|c| c.id);
        list
    }

    /// Store the metadata of `chunk` in the chunk map
    fn put_chunk_metadata(&self, chunk: &Chunk) -> Result<()> {
        self.chunk_map.put(chunk.id as u64, chunk.to_metadata()?)?;
        Ok(())
    }

    /// Meta map or open user map with this id
    fn map_handle(&self, id: u32) -> Option<Arc<dyn MapHandle>> {
        match id {
            NAME_MAP_ID => Some(self.name_map.clone() as Arc<dyn MapHandle>),
            LAYOUT_MAP_ID => Some(self.layout.clone() as Arc<dyn MapHandle>),
            CHUNK_MAP_ID => Some(self.chunk_map.clone() as Arc<dyn MapHandle>),
            _ => self.maps.read().get(&id).cloned(),
        }
    }

    fn open_maps(&self) -> Vec<Arc<dyn MapHandle>> {
        self.maps.read().values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Panic Handling
    // -------------------------------------------------------------------------

    /// Record a fatal error; the store closes once the store lock is released
    pub(crate) fn panic(&self, err: AtlasError) -> AtlasError {
        if self.is_open() {
            error!(error = %err, "Store panic, closing");
            self.handle_error(&err);
            let mut recorded = self.panic_error.lock();
            if recorded.is_none() {
                *recorded = Some(err.clone());
            }
        }
        err
    }

    pub(crate) fn panic_error(&self) -> Option<AtlasError> {
        self.panic_error.lock().clone()
    }

    /// Hand an error to the configured background error handler
    pub(crate) fn handle_error(&self, err: &AtlasError) {
        if let Some(handler) = &self.config.background_error_handler {
            handler.notify(err);
        }
    }

    /// Run `f` under the store lock, closing the store afterwards if it panicked
    pub(crate) fn with_store_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let result = {
            let _guard = self.store_lock.lock();
            f()
        };
        self.check_panic_after_unlock();
        result
    }

    fn check_panic_after_unlock(&self) {
        if self.store_lock.is_owned_by_current_thread() {
            return;
        }
        let panicked = self.panic_error.lock().is_some();
        if panicked {
            self.close_immediately();
        }
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    pub(crate) fn close_immediately(&self) {
        if let Err(e) = self.close_store(false, 0) {
            warn!(error = %e, "Error while closing store");
        }
    }

    /// Close the store; a normal close commits and writes a clean header first
    ///
    /// `compact_ms > 0` compacts the file for up to that long, a negative
    /// value runs one maintenance pass instead.
    pub(crate) fn close_store(&self, normal: bool, compact_ms: i64) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.stop_background();
        let _guard = self.store_lock.lock();
        if !self.is_open() {
            // closed by another thread meanwhile, or we are inside that close
            return Ok(());
        }
        self.set_state(StoreState::Stopping);

        let result = if normal && !self.file.is_read_only() {
            self.close_normally(compact_ms)
        } else {
            Ok(())
        };

        self.set_state(StoreState::Closing);
        self.leaf_cache.clear();
        self.non_leaf_cache.clear();
        for map in self.open_maps() {
            map.close();
        }
        self.maps.write().clear();
        self.chunks.write().clear();
        self.tocs.lock().clear();
        self.dead_chunks.lock().clear();
        self.removed_pages.lock().clear();
        self.file.release();
        self.set_state(StoreState::Closed);
        info!(path = ?self.file.path(), normal, "Closed store");
        result
    }

    fn close_normally(&self, compact_ms: i64) -> Result<()> {
        // Step 1: Forget the roots of maps closed by their users
        for map in self.open_maps() {
            if map.is_closed() {
                self.deregister_map_root(map.id())?;
            }
        }

        // Step 2: Final commit, freeing everything that is free
        self.set_retention_time(0);
        self.commit()?;

        // Step 3: Optional compaction
        if compact_ms > 0 {
            self.compact_file(compact_ms as u64)?;
        } else if compact_ms < 0 {
            self.do_maintenance(self.config.auto_compact_fill_rate)?;
        }

        // Step 4: Clean-shutdown header
        let _save = self.save_chunk_lock.lock();
        self.shrink_file_if_possible(0)?;
        self.header.lock().clean_shutdown = true;
        self.write_store_header()?;
        self.file.sync()
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    pub(crate) fn page_count(&self) -> u64 {
        self.chunks.read().values().map(|c| c.page_count as u64).sum()
    }

    pub(crate) fn live_page_count(&self) -> u64 {
        self.chunks
            .read()
            .values()
            .map(|c| c.page_count_live as u64)
            .sum()
    }
}

impl std::fmt::Debug for StoreCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCore")
            .field("file", &self.file)
            .field("state", &self.state())
            .field("version", &self.current_version())
            .finish()
    }
}

// =============================================================================
// Public Store Handle
// =============================================================================

/// An open multi-version store
///
/// Dropping the handle closes the store as [`MvStore::close`] would.
pub struct MvStore {
    core: Arc<StoreCore>,
}

impl MvStore {
    /// Open (or create) a store
    pub fn open(config: Config) -> Result<Self> {
        Ok(Self {
            core: StoreCore::open(config)?,
        })
    }

    /// Open a store on a caller-supplied block file
    ///
    /// `config.file_path` only names the store in logs; the file is not locked.
    pub fn open_with_file(config: Config, file: Box<dyn BlockFile>) -> Result<Self> {
        let file = FileStore::with_file(file, config.file_path.clone(), config.read_only)?;
        Ok(Self {
            core: StoreCore::open_with(config, file)?,
        })
    }

    /// Open a store kept entirely in memory
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Config::default())
    }

    // -------------------------------------------------------------------------
    // Maps
    // -------------------------------------------------------------------------

    /// Open a map, creating it if needed
    pub fn open_map<K: KeyType, V: DataType>(&self, name: &str) -> Result<MvMap<K, V>> {
        self.core.open_map(name, false)
    }

    /// Open a single-writer map whose appends are buffered
    pub fn open_append_map<K: KeyType, V: DataType>(&self, name: &str) -> Result<MvMap<K, V>> {
        self.core.open_map(name, true)
    }

    pub fn rename_map<K: KeyType, V: DataType>(&self, map: &MvMap<K, V>, new_name: &str) -> Result<()> {
        self.core.rename_map(map.id(), new_name)
    }

    /// Remove a map and all its data
    pub fn remove_map<K: KeyType, V: DataType>(&self, map: &MvMap<K, V>) -> Result<()> {
        self.core.remove_map(map.id())
    }

    pub fn map_names(&self) -> Result<Vec<String>> {
        self.core.map_names()
    }

    pub fn has_map(&self, name: &str) -> Result<bool> {
        self.core.has_map(name)
    }

    /// Whether the map exists and has stored data
    pub fn has_data(&self, name: &str) -> Result<bool> {
        self.core.has_data(name)
    }

    pub fn map_name(&self, id: u32) -> Option<String> {
        self.core.map_name(id)
    }

    /// Read-only view of the map-name map
    pub fn meta_map(&self) -> Result<MvMap<StringType, SerdeType<MapMetadata>>> {
        self.core.check_open()?;
        let version = self.core.current_version();
        Ok(MvMap::from_core(Arc::new(self.core.name_map.open_version(version)?)))
    }

    /// Read-only view of the layout map
    pub fn layout_map(&self) -> Result<MvMap<LongType, LongType>> {
        self.core.check_open()?;
        let version = self.core.current_version();
        Ok(MvMap::from_core(Arc::new(self.core.layout.open_version(version)?)))
    }

    /// Read-only view of the chunk map
    pub fn chunk_map(&self) -> Result<MvMap<LongType, BytesType>> {
        self.core.check_open()?;
        let version = self.core.current_version();
        Ok(MvMap::from_core(Arc::new(self.core.chunk_map.open_version(version)?)))
    }

    // -------------------------------------------------------------------------
    // Commit and Versions
    // -------------------------------------------------------------------------

    /// Store all changes, returning the new current version
    pub fn commit(&self) -> Result<u64> {
        self.core.commit()
    }

    /// Like `commit`, but gives up instead of waiting for the store lock
    pub fn try_commit(&self) -> Result<u64> {
        self.core.try_commit()
    }

    pub fn current_version(&self) -> u64 {
        self.core.current_version()
    }

    /// Version of the newest chunk written, 0 if none
    pub fn last_stored_version(&self) -> u64 {
        self.core.last_chunk_version.load(Ordering::Acquire)
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.core.has_unsaved_changes()
    }

    /// Keep the current version reachable until the guard is dropped
    pub fn register_version_usage(&self) -> VersionUsage {
        self.core.register_version_usage()
    }

    pub fn oldest_version_to_keep(&self) -> u64 {
        self.core.oldest_version_to_keep()
    }

    /// Discard uncommitted changes
    pub fn rollback(&self) -> Result<()> {
        self.core.rollback_to(self.core.current_version())
    }

    /// Revert to the state at the start of `version`
    pub fn rollback_to(&self, version: u64) -> Result<()> {
        self.core.rollback_to(version)
    }

    // -------------------------------------------------------------------------
    // Compaction
    // -------------------------------------------------------------------------

    /// Rewrite live pages of sparse chunks; returns whether anything was rewritten
    pub fn compact(&self, target_fill_rate: u32, write_limit: u64) -> Result<bool> {
        self.core.compact(target_fill_rate, write_limit)
    }

    /// Move chunks towards the start of the file, then shrink it
    pub fn compact_move_chunks(&self) -> Result<bool> {
        self.core.compact_move_chunks(100, u64::MAX)
    }

    /// Compact and defragment the file for up to `max_ms` milliseconds
    pub fn compact_file(&self, max_ms: u64) -> Result<()> {
        self.core.compact_file(max_ms)
    }

    /// One round of background maintenance towards `target_fill_rate`
    pub fn do_maintenance(&self, target_fill_rate: u32) -> Result<()> {
        self.core.do_maintenance(target_fill_rate)
    }

    // -------------------------------------------------------------------------
    // Settings
    // -------------------------------------------------------------------------

    pub fn set_retention_time(&self, ms: i64) {
        self.core.set_retention_time(ms)
    }

    pub fn retention_time(&self) -> i64 {
        self.core.retention_time()
    }

    pub fn set_reuse_space(&self, reuse: bool) {
        self.core.set_reuse_space(reuse)
    }

    /// Flush the file to disk
    pub fn sync(&self) -> Result<()> {
        self.core.check_open()?;
        self.core.file.sync()
    }

    // -------------------------------------------------------------------------
    // Info and Statistics
    // -------------------------------------------------------------------------

    pub fn store_header(&self) -> StoreHeader {
        self.core.store_header()
    }

    pub fn state(&self) -> StoreState {
        self.core.state()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn is_read_only(&self) -> bool {
        self.core.is_read_only()
    }

    /// The error that closed the store, if any
    pub fn panic_error(&self) -> Option<AtlasError> {
        self.core.panic_error()
    }

    /// Percentage of used blocks in the file
    pub fn fill_rate(&self) -> u32 {
        self.core.file.fill_rate()
    }

    /// Percentage of live bytes over all chunks
    pub fn chunks_fill_rate(&self) -> u32 {
        self.core.chunks_fill_rate(false)
    }

    /// Percentage of live bytes over the chunks compaction could rewrite
    pub fn rewritable_chunks_fill_rate(&self) -> u32 {
        self.core.chunks_fill_rate(true)
    }

    pub fn chunk_count(&self) -> usize {
        self.core.chunks.read().len()
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.core.chunk_list()
    }

    pub fn page_count(&self) -> u64 {
        self.core.page_count()
    }

    pub fn live_page_count(&self) -> u64 {
        self.core.live_page_count()
    }

    /// Estimated memory of pages changed since the last commit
    pub fn unsaved_memory(&self) -> i64 {
        self.core.unsaved_memory()
    }

    pub fn file_size(&self) -> u64 {
        self.core.file.size()
    }

    /// Cache hits and misses, leaf and non-leaf combined
    pub fn cache_hits_and_misses(&self) -> (u64, u64) {
        let core = &self.core;
        (
            core.leaf_cache.hits() + core.non_leaf_cache.hits(),
            core.leaf_cache.misses() + core.non_leaf_cache.misses(),
        )
    }

    /// Pages and summed memory held by the page caches
    pub fn cache_usage(&self) -> (usize, usize) {
        let core = &self.core;
        (
            core.leaf_cache.len() + core.non_leaf_cache.len(),
            core.leaf_cache.used() + core.non_leaf_cache.used(),
        )
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Commit, write a clean-shutdown header and release the file
    pub fn close(&self) -> Result<()> {
        self.core.close_store(true, 0)
    }

    /// Close after compacting the file for up to `max_compact_ms`
    pub fn close_with_compaction(&self, max_compact_ms: u64) -> Result<()> {
        self.core.close_store(true, max_compact_ms as i64)
    }

    /// Close without writing anything
    pub fn close_immediately(&self) {
        self.core.close_immediately()
    }
}

impl Drop for MvStore {
    fn drop(&mut self) {
        if !self.core.is_closed() {
            if let Err(e) = self.core.close_store(true, 0) {
                warn!(error = %e, "Failed to close store on drop");
            }
        }
    }
}

impl std::fmt::Debug for MvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.core.fmt(f)
    }
}
