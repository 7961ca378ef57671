//! Version Usage
//!
//! Readers that need the state of a version to stay reachable register with a
//! [`TxCounter`] for the current version. Old versions (and the chunks that hold
//! them) are only released once no counter at or below them is in use.
//!
//! ```text
//!  versions:  [v3: 0] [v4: 2] [v5: 0]      current: [v6: 1]
//!               ▲ dropped   ▲ oldest version to keep
//! ```
//! A counter is decremented once when its version is superseded, so it falls
//! below zero exactly when the version is over and no reader remains.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info};

use crate::codec::page_info;
use crate::error::{AtlasError, Result};
use crate::map::{MapSettings, MvMap};
use crate::page::Page;
use crate::storage::{Chunk, BLOCK_SIZE};

use super::{ChunkMap, StoreCore, CHUNK_MAP_ID, LAYOUT_MAP_ID, NAME_MAP_ID};

/// Reader count of one version
#[derive(Debug)]
pub(crate) struct TxCounter {
    pub(crate) version: u64,
    counter: AtomicI64,
}

impl TxCounter {
    pub(crate) fn new(version: u64) -> Self {
        Self {
            version,
            counter: AtomicI64::new(0),
        }
    }

    pub(crate) fn increment(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn decrement(&self) -> i64 {
        self.counter.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn count(&self) -> i64 {
        self.counter.load(Ordering::Acquire)
    }
}

/// Keeps a version reachable until dropped
pub struct VersionUsage {
    store: Weak<StoreCore>,
    counter: Arc<TxCounter>,
}

impl VersionUsage {
    pub(crate) fn new(store: Weak<StoreCore>, counter: Arc<TxCounter>) -> Self {
        Self { store, counter }
    }

    /// The version held by this usage
    pub fn version(&self) -> u64 {
        self.counter.version
    }
}

impl Drop for VersionUsage {
    fn drop(&mut self) {
        match self.store.upgrade() {
            Some(store) => store.deregister_version_usage(&self.counter),
            None => {
                self.counter.decrement();
            }
        }
    }
}

impl std::fmt::Debug for VersionUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionUsage")
            .field("version", &self.counter.version)
            .finish()
    }
}

// =============================================================================
// Store Side
// =============================================================================

impl StoreCore {
    /// Pin the current version until the returned guard is dropped
    pub(crate) fn register_version_usage(&self) -> VersionUsage {
        loop {
            let counter = self.current_tx_counter.load_full();
            // a counter already superseded and released can not be revived
            if counter.increment() > 0 {
                return VersionUsage::new(self.weak_self.clone(), counter);
            }
            counter.decrement();
        }
    }

    pub(crate) fn deregister_version_usage(&self, counter: &Arc<TxCounter>) {
        if counter.decrement() > 0 {
            return;
        }
        if self.store_lock.is_owned_by_current_thread() {
            self.drop_unused_versions();
        } else if let Some(_guard) = self.store_lock.try_lock() {
            self.drop_unused_versions();
        }
    }

    /// Start a new counter for `version`, retiring the current one
    pub(crate) fn on_version_change(&self, version: u64) {
        let previous = self.current_tx_counter.load_full();
        self.versions.lock().push_back(previous.clone());
        self.current_tx_counter
            .store(Arc::new(TxCounter::new(version)));
        previous.decrement();
        self.drop_unused_versions();
    }

    fn drop_unused_versions(&self) {
        let mut versions = self.versions.lock();
        while versions.front().is_some_and(|c| c.count() < 0) {
            versions.pop_front();
        }
        let oldest = match versions.front() {
            Some(counter) => counter.version,
            None => self.current_tx_counter.load().version,
        };
        self.oldest_version_to_keep
            .fetch_max(oldest, Ordering::AcqRel);
    }

    /// Oldest version whose roots must stay reachable
    ///
    /// Also never newer than the state held by the last written chunk, so that
    /// a reopened store can always resolve it.
    pub(crate) fn oldest_version_to_keep(&self) -> u64 {
        let mut version = self
            .oldest_version_to_keep
            .load(Ordering::Acquire)
            .saturating_sub(self.config.versions_to_keep);
        let last = self.last_chunk_version.load(Ordering::Acquire);
        if last > 0 {
            version = version.min(last.saturating_sub(1));
        }
        version
    }

    // -------------------------------------------------------------------------
    // Rollback
    // -------------------------------------------------------------------------

    /// Whether the store can roll back to `version`
    pub(crate) fn is_known_version(&self, version: u64) -> Result<bool> {
        let current = self.current_version();
        if version > current {
            return Ok(false);
        }
        if version == current || self.chunks.read().is_empty() {
            return Ok(true);
        }

        // Step 1: Newest chunk holding the state of `version`
        let chunk = self
            .chunks
            .read()
            .values()
            .filter(|c| c.is_saved() && c.version <= version)
            .max_by_key(|c| c.version)
            .cloned();
        let Some(chunk) = chunk else {
            return Ok(false);
        };

        // Step 2: Every chunk it references must still be intact on disk
        let header = match self.read_chunk_header(chunk.block) {
            Ok(header) => header,
            Err(_) => return Ok(false),
        };
        if !page_info::is_saved(header.chunk_map_root) {
            return Ok(true);
        }
        let old_map = ChunkMap::new(
            self.weak_self.clone(),
            CHUNK_MAP_ID,
            0,
            MapSettings::from_config(&self.config),
            false,
            true,
        );
        let root = match self.read_page(CHUNK_MAP_ID, header.chunk_map_root) {
            Ok(root) => root,
            Err(_) => return Ok(false),
        };
        old_map.set_initial_root(root, header.version);
        for entry in MvMap::from_core(Arc::new(old_map)).cursor(None)? {
            let (id, data) = entry?;
            if self.chunk_map.get(&id)?.is_some() {
                continue;
            }
            let old = Chunk::from_metadata(&data)?;
            if !self.is_valid_chunk_on_disk(&old) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_valid_chunk_on_disk(&self, chunk: &Chunk) -> bool {
        chunk.is_saved()
            && self
                .read_chunk_header_and_footer(chunk.block, chunk.id)
                .is_some()
    }

    /// Revert to the state at the start of `version`; 0 empties the store
    pub(crate) fn rollback_to(&self, version: u64) -> Result<()> {
        self.with_store_lock(|| {
            self.check_open()?;
            if version == 0 {
                self.rollback_to_empty()
            } else {
                self.rollback_to_version(version)
            }
        })
    }

    fn rollback_to_empty(&self) -> Result<()> {
        self.name_map
            .set_initial_root(Page::create_empty_leaf(NAME_MAP_ID), 0);
        self.layout
            .set_initial_root(Page::create_empty_leaf(LAYOUT_MAP_ID), 0);
        self.chunk_map
            .set_initial_root(Page::create_empty_leaf(CHUNK_MAP_ID), 0);

        self.dead_chunks.lock().clear();
        self.removed_pages.lock().clear();
        self.chunks.write().clear();
        self.tocs.lock().clear();
        self.leaf_cache.clear();
        self.non_leaf_cache.clear();
        self.set_last_chunk_ref(None);
        {
            let _save = self.save_chunk_lock.lock();
            self.file.clear();
            if !self.file.is_read_only() {
                // nothing on disk may point at the discarded chunks
                let mut header = self.store_header();
                header.last_chunk_id = 0;
                header.last_chunk_version = 0;
                header.last_block = 0;
                header.clean_shutdown = false;
                self.set_header(header);
                self.write_store_header()?;
                self.file.truncate(2 * BLOCK_SIZE)?;
                self.file.sync()?;
            }
        }
        self.versions.lock().clear();
        self.current_version.store(0, Ordering::Release);
        self.current_tx_counter
            .store(Arc::new(TxCounter::new(0)));
        self.oldest_version_to_keep.store(0, Ordering::Release);
        self.meta_changed.store(false, Ordering::Release);
        for map in self.open_maps() {
            map.close();
        }
        self.maps.write().clear();
        info!("Rolled back to an empty store");
        Ok(())
    }

    fn rollback_to_version(&self, version: u64) -> Result<()> {
        if !self.is_known_version(version)? {
            return Err(AtlasError::IllegalArgument(format!("Unknown version {}", version)));
        }

        // Step 1: Forget version counters past the target
        {
            let mut versions = self.versions.lock();
            while versions.back().is_some_and(|c| c.version >= version) {
                versions.pop_back();
            }
        }
        self.current_tx_counter
            .store(Arc::new(TxCounter::new(version)));

        // Step 2: Meta maps
        let names_rolled_back = self.name_map.rollback_root(version)?;
        self.layout.rollback_root(version)?;
        self.chunk_map.rollback_root(version)?;
        self.meta_changed.store(false, Ordering::Release);

        // Step 3: Drop chunks written after the target, youngest first
        {
            let _serialization = self.serialization_lock.lock();
            let mut newer: Vec<Chunk> = self
                .chunks
                .read()
                .values()
                .filter(|c| c.version > version)
                .cloned()
                .collect();
            newer.sort_by(|a, b| b.version.cmp(&a.version));

            let _save = self.save_chunk_lock.lock();
            for chunk in &newer {
                self.chunks.write().remove(&chunk.id);
                self.tocs.lock().remove(&chunk.id);
                if chunk.is_saved() {
                    let len = chunk.len_bytes();
                    self.file.free(chunk.pos(), len);
                    self.file.write_fully(chunk.pos(), &vec![0u8; len as usize])?;
                }
                debug!(chunk = chunk.id, version = chunk.version, "Dropped chunk on rollback");
            }
            if !newer.is_empty() {
                self.file.sync()?;
                let keep = self
                    .chunks
                    .read()
                    .values()
                    .filter(|c| c.is_saved())
                    .max_by_key(|c| c.version)
                    .cloned();
                self.set_last_chunk_ref(keep.as_ref());
                self.write_store_header()?;
                self.read_store_header()?;
                if !names_rolled_back {
                    let name_root = self.layout.get(&(NAME_MAP_ID as u64))?.unwrap_or(0);
                    self.name_map.set_root_page_info(name_root, version - 1)?;
                }
            }
        }

        // Step 4: Caches and pending space bookkeeping
        self.dead_chunks.lock().clear();
        self.removed_pages.lock().clear();
        self.leaf_cache.clear();
        self.non_leaf_cache.clear();
        self.current_version.store(version, Ordering::Release);
        self.on_version_change(version);

        // Step 5: User maps
        for map in self.open_maps() {
            let id = map.id();
            if map.create_version() >= version {
                map.close();
                self.maps.write().remove(&id);
            } else if !map.rollback_root(version)? {
                let pos = self.layout.get(&(id as u64))?.unwrap_or(0);
                map.set_root_page_info(pos, version - 1)?;
            }
        }
        info!(version, "Rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_goes_negative_only_after_release() {
        let counter = TxCounter::new(3);
        assert_eq!(counter.increment(), 1);
        // superseded while in use
        assert_eq!(counter.decrement(), 0);
        assert_eq!(counter.decrement(), -1);
        assert_eq!(counter.count(), -1);
    }
}
