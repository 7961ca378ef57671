//! Commit Pipeline
//!
//! ```text
//!  commit() ──► store_lock ──► store_now
//!                                 │ version += 1
//!                                 │ collect changed roots
//!                                 ▼
//!                  ┌── serializer thread (async) ──┐
//!                  │  or inline (sync)             │
//!                  ▼                               │
//!          serialize_and_store (serialization_lock)│
//!            1. new chunk, pages written bottom-up │
//!            2. layout + chunk map updated         │
//!            3. placed in the file (save_chunk_lock)
//!            4. store_buffer: write, header, shrink
//! ```
//!
//! Space freed by a commit is only accounted for by the next one: removed
//! pages are queued with the version that removed them and drained once a
//! newer chunk is being written.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::codec::page_info;
use crate::error::{AtlasError, Result};
use crate::map::{MapHandle, TreeRoot};
use crate::page::{ChunkWriter, RemovedPageInfo};
use crate::storage::chunk::{CHUNK_FOOTER_LENGTH, CHUNK_HEADER_LENGTH, MAX_CHUNK_ID};
use crate::storage::{Chunk, BLOCK_SIZE};

use super::serializer::Job;
use super::{StoreCore, CHUNK_MAP_ID};

/// Versions after which the store header is rewritten even if nothing else asks for it
const HEADER_REFRESH_VERSIONS: u64 = 20;

/// Wrap errors that are not store errors as internal ones
pub(crate) fn as_store_error(err: AtlasError) -> AtlasError {
    match err {
        AtlasError::Store { .. } => err,
        other => AtlasError::internal(other.to_string()),
    }
}

type CommitCheck = fn(&StoreCore) -> bool;

impl StoreCore {
    // =========================================================================
    // Entry Points
    // =========================================================================

    pub(crate) fn has_unsaved_changes(&self) -> bool {
        if self.meta_changed.load(Ordering::Acquire) {
            return true;
        }
        let last_stored = self.current_version().saturating_sub(1);
        let maps_changed = self
            .open_maps()
            .iter()
            .any(|m| !m.is_closed() && m.has_changes_since(last_stored));
        maps_changed
            || (last_stored > 0 && MapHandle::has_changes_since(&*self.layout, last_stored))
    }

    pub(crate) fn commit(&self) -> Result<u64> {
        self.commit_if(None)
    }

    pub(crate) fn try_commit(&self) -> Result<u64> {
        self.try_commit_if(None)
    }

    /// Store synchronously, after waiting for an in-flight background job
    fn commit_if(&self, check: Option<CommitCheck>) -> Result<u64> {
        self.check_open()?;
        // a commit from inside store_now (a meta map write) must not recurse
        if !self.store_lock.is_owned_by_current_thread()
            || !self.store_in_progress.load(Ordering::Acquire)
        {
            self.wait_for_serializer();
            self.with_store_lock(|| {
                if check.map_or(true, |check| check(self)) {
                    self.store(true)?;
                }
                Ok(())
            })?;
        }
        Ok(self.current_version())
    }

    /// Store (possibly in the background) unless another thread holds the store lock
    fn try_commit_if(&self, check: Option<CommitCheck>) -> Result<u64> {
        self.check_open()?;
        if !self.store_lock.is_owned_by_current_thread()
            || !self.store_in_progress.load(Ordering::Acquire)
        {
            let locked = self.store_lock.try_lock().map(|guard| {
                let result = if check.map_or(true, |check| check(self)) {
                    self.store(false)
                } else {
                    Ok(())
                };
                drop(guard);
                result
            });
            if let Some(result) = locked {
                self.check_panic_after_unlock();
                result?;
            }
        }
        Ok(self.current_version())
    }

    fn need_store(&self) -> bool {
        self.unsaved_memory() > self.config.auto_commit_buffer_size as i64
    }

    /// Unsaved memory grows faster than the serializer drains it
    fn require_store(&self) -> bool {
        3 * self.unsaved_memory() > 4 * self.config.auto_commit_buffer_size as i64
    }

    // =========================================================================
    // Unsaved Memory and Backpressure
    // =========================================================================

    pub(crate) fn register_unsaved_memory(&self, delta: i64) {
        let total = self.unsaved_memory.fetch_add(delta, Ordering::AcqRel) + delta;
        let buffer = self.config.auto_commit_buffer_size as i64;
        if buffer > 0 && total > buffer {
            self.save_needed.store(true, Ordering::Release);
        }
    }

    pub(crate) fn account_for_removed_pages(&self, removed: Vec<RemovedPageInfo>) {
        if !removed.is_empty() {
            self.removed_pages.lock().extend(removed);
        }
    }

    /// Called before every map write; commits when too much memory is unsaved
    pub(crate) fn before_write(&self, map: &dyn MapHandle) -> Result<()> {
        if !self.save_needed.load(Ordering::Acquire) || !self.is_open_or_stopping() {
            return Ok(());
        }
        // store() removes entries from the chunk map
        if map.id() == CHUNK_MAP_ID {
            return Ok(());
        }
        // never wait for the store lock while holding a root lock
        if !self.store_lock.is_owned_by_current_thread() && map.is_root_locked_by_current_thread() {
            return Ok(());
        }
        if self.config.auto_commit_buffer_size == 0 || !self.need_store() {
            return Ok(());
        }
        if self.serializer_busy.load(Ordering::Acquire) > 0 {
            return Ok(());
        }
        self.save_needed.store(false, Ordering::Release);

        if !map.is_single_writer() && self.require_store() {
            if self.has_serializer() {
                self.try_commit_if(Some(StoreCore::need_store))?;
            } else {
                self.commit_if(Some(StoreCore::require_store))?;
            }
        } else {
            self.try_commit_if(Some(StoreCore::need_store))?;
        }
        Ok(())
    }

    // =========================================================================
    // Store
    // =========================================================================

    /// Persist all changes; the caller holds the store lock
    pub(crate) fn store(&self, sync: bool) -> Result<()> {
        if !self.is_open_or_stopping() || !self.has_unsaved_changes() {
            return Ok(());
        }
        self.drop_unused_chunks()?;
        if self.file.is_read_only() {
            return Err(AtlasError::store(
                crate::error::ErrorCode::WritingFailed,
                "This store is read-only",
            ));
        }
        let reserved_high = if self.reuse_space() { Some(0) } else { None };
        self.store_now(sync, 0, reserved_high)
    }

    /// Start a new version and write the current one
    ///
    /// `reserved_low..reserved_high` (blocks) is kept free by the allocation;
    /// `None` for the high end reserves everything up to the last used block.
    pub(crate) fn store_now(&self, sync: bool, reserved_low: u64, reserved_high: Option<i64>) -> Result<()> {
        let was_in_progress = self.store_in_progress.swap(true, Ordering::AcqRel);
        let result = self.store_now_inner(sync, reserved_low, reserved_high);
        self.store_in_progress
            .store(was_in_progress, Ordering::Release);
        result.map_err(|e| self.panic(as_store_error(e)))
    }

    fn store_now_inner(&self, sync: bool, reserved_low: u64, reserved_high: Option<i64>) -> Result<()> {
        let time = self.time_since_creation();
        self.last_commit_time.store(time, Ordering::Release);
        let counted = self.unsaved_memory();
        let version = self.current_version.fetch_add(1, Ordering::AcqRel) + 1;
        let changed = self.collect_changed_roots(version)?;
        trace!(version, roots = changed.len(), sync, "Storing version");

        let serializer = if sync { None } else { self.serializer.lock().clone() };
        match serializer {
            Some(serializer) => {
                let store = self.weak_self.clone();
                self.serializer_busy.fetch_add(1, Ordering::AcqRel);
                let job: Job = Box::new(move || {
                    if let Some(store) = store.upgrade() {
                        // failures are recorded as a panic
                        let _ = store.serialize_and_store(reserved_low, reserved_high, changed, time, version);
                        store.serializer_busy.fetch_sub(1, Ordering::AcqRel);
                    }
                });
                if let Err(job) = serializer.submit(job) {
                    // stopped meanwhile
                    job();
                }
            }
            None => {
                if sync {
                    self.wait_for_serializer();
                }
                self.serialize_and_store(reserved_low, reserved_high, changed, time, version)?;
            }
        }

        // pages may have changed in the new version meanwhile
        self.save_needed.store(false, Ordering::Release);
        let remaining = (self.unsaved_memory() - counted).max(0);
        self.unsaved_memory.store(remaining, Ordering::Release);
        Ok(())
    }

    /// Publish every map root under `version` and pick the ones to write
    fn collect_changed_roots(&self, version: u64) -> Result<Vec<Box<dyn TreeRoot>>> {
        let last_stored = version.checked_sub(2);
        let changed_since = |map: &dyn MapHandle| match last_stored {
            Some(v) => map.has_changes_since(v),
            None => true,
        };
        let mut changed = Vec::new();

        for map in self.open_maps() {
            match map.set_write_version(version)? {
                None => {
                    self.maps.write().remove(&map.id());
                }
                Some(root) => {
                    // maps created after the store started are written next time
                    if map.create_version() < version && changed_since(&*map) {
                        add_to_changed(&mut changed, root);
                    }
                }
            }
        }

        let name_root = MapHandle::set_write_version(&*self.name_map, version)?
            .ok_or_else(|| AtlasError::internal("Map-name map has no root"))?;
        if self.meta_changed.load(Ordering::Acquire) || changed_since(&*self.name_map as &dyn MapHandle) {
            add_to_changed(&mut changed, name_root);
        }
        Ok(changed)
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Build the chunk for `version` and write it; failures panic the store
    pub(crate) fn serialize_and_store(
        &self,
        reserved_low: u64,
        reserved_high: Option<i64>,
        changed: Vec<Box<dyn TreeRoot>>,
        time: u64,
        version: u64,
    ) -> Result<()> {
        let _serialization = self.serialization_lock.lock();
        self.write_chunk(reserved_low, reserved_high, changed, time, version)
            .map_err(|e| self.panic(as_store_error(e)))
    }

    fn write_chunk(
        &self,
        reserved_low: u64,
        reserved_high: Option<i64>,
        mut changed: Vec<Box<dyn TreeRoot>>,
        time: u64,
        version: u64,
    ) -> Result<()> {
        // Step 1: New chunk
        let chunk = self.create_chunk(time, version)?;
        self.chunks.write().insert(chunk.id, chunk.clone());
        let compress = self.config.compression_level > 0;
        let mut writer = ChunkWriter::new(chunk, &*self.compressor, compress);

        // Step 2: Changed trees, children before parents
        for root in &changed {
            let map_id = root.map_id() as u64;
            if root.total_count() == 0 {
                self.layout.remove(&map_id)?;
            } else {
                let pos = root.write_unsaved(&mut writer)?;
                self.layout.put(map_id, pos)?;
            }
        }

        // Step 3: Freed space and the meta maps of this version
        let time = writer.chunk.time;
        self.accept_chunk_occupancy_changes(time, version)?;
        let chunk_map_root = MapHandle::set_write_version(&*self.chunk_map, version)?
            .ok_or_else(|| AtlasError::internal("Chunk map has no root"))?;
        let layout_root = MapHandle::set_write_version(&*self.layout, version)?
            .ok_or_else(|| AtlasError::internal("Layout map has no root"))?;
        self.meta_changed.store(false, Ordering::Release);
        self.accept_chunk_occupancy_changes(time, version)?;
        self.on_version_change(version);

        let chunk_map_changed = version
            .checked_sub(2)
            .map_or(true, |v| MapHandle::has_changes_since(&*self.chunk_map, v));
        if chunk_map_changed && (!chunk_map_root.is_saved() || chunk_map_root.is_leaf()) {
            chunk_map_root.write_unsaved(&mut writer)?;
        }
        writer.chunk.chunk_map_root = chunk_map_root.pos();
        writer.chunk.layout_root = layout_root.write_unsaved(&mut writer)?;
        changed.push(chunk_map_root);
        changed.push(layout_root);

        // Step 4: ToC, captured after the map-name map so new map ids are covered
        writer.chunk.map_id = self.last_map_id.load(Ordering::Acquire);
        writer.write_toc();
        let toc = std::mem::take(&mut writer.toc);
        self.tocs
            .lock()
            .insert(writer.chunk.id, std::sync::Arc::new(toc));
        let length = round_up_to_block(writer.buf.len() + CHUNK_FOOTER_LENGTH);

        // Step 5: Placement
        {
            let _save = self.save_chunk_lock.lock();
            let high = reserved_high.unwrap_or_else(|| self.file.after_last_block() as i64);
            let pos = self.file.allocate(length as u64, reserved_low, high);
            writer.chunk.len = (length as u64 / BLOCK_SIZE) as u32;
            writer.chunk.block = pos / BLOCK_SIZE;
            writer.chunk.next = if reserved_low > 0 || high == reserved_low as i64 {
                self.file
                    .predict_allocation(writer.chunk.len as u64, 0, 0)
            } else {
                0
            };
            let header = writer.chunk.header_bytes();
            writer.buf[..CHUNK_HEADER_LENGTH].copy_from_slice(&header);
            writer.buf.resize(length, 0);
            let footer = writer.chunk.footer_bytes();
            writer.buf[length - CHUNK_FOOTER_LENGTH..].copy_from_slice(&footer);
        }

        let ChunkWriter {
            chunk,
            buf,
            late_removals,
            written,
            ..
        } = writer;
        self.chunks.write().insert(chunk.id, chunk.clone());
        self.account_for_removed_pages(late_removals);
        for (pos, page, memory) in written {
            if page_info::is_leaf(pos) {
                self.leaf_cache.put(pos, page, memory);
            } else {
                self.non_leaf_cache.put(pos, page, memory);
            }
        }

        // Step 6: Write
        self.store_buffer(&chunk, &buf)?;
        for root in &changed {
            root.release_saved_pages();
        }
        debug!(
            chunk = chunk.id,
            version,
            block = chunk.block,
            blocks = chunk.len,
            pages = chunk.page_count,
            "Wrote chunk"
        );
        Ok(())
    }

    fn create_chunk(&self, time: u64, version: u64) -> Result<Chunk> {
        let mut time = time;
        if let Some(last) = self.last_chunk() {
            // the last chunk's metadata is only stored now, to keep the
            // chunk map unchanged right after a write
            self.put_chunk_metadata(&last)?;
            time = time.max(last.time);
        }

        let id = loop {
            let id = self
                .chunk_id_counter
                .fetch_add(1, Ordering::AcqRel)
                .wrapping_add(1)
                & MAX_CHUNK_ID;
            match self.chunks.read().get(&id) {
                None => break id,
                Some(old) if !old.is_saved() => {
                    return Err(AtlasError::internal(format!(
                        "Chunk {} was never stored",
                        old.id
                    )));
                }
                Some(_) => continue,
            }
        };

        let mut chunk = Chunk::new(id);
        chunk.block = u64::MAX;
        chunk.next = u64::MAX;
        chunk.layout_root = u64::MAX;
        chunk.chunk_map_root = u64::MAX;
        chunk.time = time;
        chunk.version = version;
        Ok(chunk)
    }

    /// Apply removed pages older than `version` to their chunks
    ///
    /// Chunks that lost their last live page are queued as dead; their space
    /// is only released by `drop_unused_chunks` once no reader needs them.
    pub(super) fn accept_chunk_occupancy_changes(&self, time: u64, version: u64) -> Result<()> {
        if self.last_chunk_id.lock().is_none() {
            return Ok(());
        }
        loop {
            let ready: Vec<RemovedPageInfo> = {
                let mut removed = self.removed_pages.lock();
                let (ready, later): (Vec<_>, Vec<_>) =
                    removed.drain(..).partition(|info| info.version < version);
                *removed = later;
                ready
            };
            if ready.is_empty() {
                return Ok(());
            }

            let mut modified = BTreeSet::new();
            for info in ready {
                let chunk_id = page_info::chunk_id(info.pos);
                let Some(chunk) = self.chunks.read().get(&chunk_id).cloned() else {
                    if self.is_open() {
                        warn!(chunk = chunk_id, pos = info.pos, "Removed page of unknown chunk");
                    }
                    continue;
                };
                let page_no = match info.page_no {
                    Some(page_no) => page_no,
                    None => self.page_no_in_toc(&chunk, info.pos)?,
                };
                let len = page_info::max_length_of(info.pos) as u64;

                let mut chunks = self.chunks.write();
                let Some(chunk) = chunks.get_mut(&chunk_id) else {
                    continue;
                };
                if chunk.account_for_removed_page(page_no, len, info.pinned, time, info.version)? {
                    self.dead_chunks.lock().push_back(chunk_id);
                }
                modified.insert(chunk_id);
            }

            for id in modified {
                let chunk = self.chunks.read().get(&id).cloned();
                if let Some(chunk) = chunk {
                    self.put_chunk_metadata(&chunk)?;
                }
            }
        }
    }

    fn page_no_in_toc(&self, chunk: &Chunk, pos: u64) -> Result<u32> {
        let toc = self.get_toc(chunk)?;
        let offset = page_info::offset(pos);
        toc.binary_search_by_key(&offset, |entry| page_info::offset(*entry))
            .map(|index| index as u32)
            .map_err(|_| {
                AtlasError::internal(format!(
                    "Page at offset {} not found in chunk {}",
                    offset, chunk.id
                ))
            })
    }

    // =========================================================================
    // File Writes
    // =========================================================================

    fn store_buffer(&self, chunk: &Chunk, buf: &[u8]) -> Result<()> {
        let _save = self.save_chunk_lock.lock();
        let pos = chunk.pos();
        self.file.write_fully(pos, buf)?;
        // the end of the used space is not necessarily the end of the file
        let at_end = pos + buf.len() as u64 >= self.file.size();
        let write_header = self.is_write_store_header(chunk, at_end);
        self.set_last_chunk_ref(Some(chunk));
        if write_header {
            self.header.lock().clean_shutdown = false;
            self.write_store_header()?;
        }
        if !at_end {
            // only after the header points at the new chunk
            self.shrink_file_if_possible(1)?;
        }
        Ok(())
    }

    fn is_write_store_header(&self, chunk: &Chunk, at_end: bool) -> bool {
        let header = self.store_header();
        let mut write = false;
        if !at_end {
            write = match self.last_chunk() {
                None => true,
                Some(last) if last.next != chunk.block => true,
                Some(last) => {
                    if last.version.saturating_sub(header.last_chunk_version) > HEADER_REFRESH_VERSIONS {
                        true
                    } else {
                        let chunks = self.chunks.read();
                        (header.last_chunk_id..=last.id).any(|id| !chunks.contains_key(&id))
                    }
                }
            };
        }
        write || header.clean_shutdown
    }

    /// Write both header copies, pointing at the last chunk
    pub(crate) fn write_store_header(&self) -> Result<()> {
        let last = self.last_chunk();
        let block = {
            let mut header = self.header.lock();
            if let Some(last) = last {
                header.last_block = last.block;
                header.last_chunk_id = last.id;
                header.last_chunk_version = last.version;
            }
            header.to_block()
        };
        let mut data = Vec::with_capacity(2 * block.len());
        data.extend_from_slice(&block);
        data.extend_from_slice(&block);
        self.file.write_fully(0, &data)
    }

    /// Truncate free space at the end of the file if it saves at least `min_percent`
    pub(crate) fn shrink_file_if_possible(&self, min_percent: u64) -> Result<()> {
        if self.file.is_read_only() {
            return Ok(());
        }
        let end = self.file.file_length_in_use();
        let size = self.file.size();
        if end >= size {
            return Ok(());
        }
        if min_percent > 0 && size - end < BLOCK_SIZE {
            return Ok(());
        }
        let saved_percent = 100 - end * 100 / size;
        if saved_percent < min_percent {
            return Ok(());
        }
        if self.is_open_or_stopping() {
            self.file.sync()?;
        }
        debug!(from = size, to = end, "Shrinking file");
        self.file.truncate(end)
    }

    // =========================================================================
    // Dead Chunks
    // =========================================================================

    pub(super) fn is_seasoned(&self, chunk: &Chunk, now: u64) -> bool {
        let retention = self.retention_time();
        retention < 0 || chunk.time.saturating_add(retention as u64) <= now
    }

    /// Release dead chunks no reader can reach anymore; returns how many
    pub(crate) fn drop_unused_chunks(&self) -> Result<usize> {
        if self.dead_chunks.lock().is_empty() {
            return Ok(0);
        }
        let oldest = self.oldest_version_to_keep();
        let now = self.time_since_creation();
        let _save = self.save_chunk_lock.lock();
        let mut count = 0;
        loop {
            let Some(id) = self.dead_chunks.lock().pop_front() else {
                break;
            };
            let Some(chunk) = self.chunks.read().get(&id).cloned() else {
                continue;
            };
            let can_overwrite = !chunk.is_live() && chunk.unused_at_version < oldest;
            if !(self.is_seasoned(&chunk, now) && can_overwrite) {
                // not ready yet, and neither is anything behind it
                self.dead_chunks.lock().push_front(id);
                break;
            }

            self.chunks.write().remove(&id);
            self.tocs.lock().remove(&id);
            self.leaf_cache.invalidate_chunk(id);
            self.non_leaf_cache.invalidate_chunk(id);
            self.chunk_map.remove(&(id as u64))?;
            if chunk.is_saved() {
                self.file.free(chunk.pos(), chunk.len_bytes());
            }
            debug!(chunk = id, version = chunk.version, "Dropped dead chunk");
            count += 1;
        }
        Ok(count)
    }

    // =========================================================================
    // Background Auto-Save
    // =========================================================================

    /// Commit if the auto-commit delay has passed, then compact if worthwhile
    pub(crate) fn trigger_auto_save(&self, force: bool) -> Result<()> {
        if !self.is_open_or_stopping() || self.file.is_read_only() {
            return Ok(());
        }
        let delay = self.config.auto_commit_delay_ms;
        if !force && self.time_since_creation() <= self.last_commit_time.load(Ordering::Acquire) + delay {
            return Ok(());
        }
        self.try_commit()?;

        let auto_compact_fill_rate = self.config.auto_compact_fill_rate;
        if auto_compact_fill_rate == 0 {
            return Ok(());
        }
        let fill_rate = self.file.fill_rate();
        if fill_rate >= auto_compact_fill_rate && self.last_chunk_id.lock().is_some() {
            let mut chunks_fill_rate = self.chunks_fill_rate(true);
            if self.is_idle() {
                chunks_fill_rate = 100 - (100 - chunks_fill_rate) / 2;
            }
            if chunks_fill_rate < self.target_fill_rate() {
                let guard = self
                    .store_lock
                    .try_lock_for(std::time::Duration::from_millis(10));
                if let Some(_guard) = guard {
                    let mut write_limit = self.config.auto_commit_buffer_size as u64
                        * fill_rate as u64
                        / chunks_fill_rate.max(1) as u64;
                    if !self.is_idle() {
                        write_limit /= 4;
                    }
                    if self.rewrite_chunks(write_limit, chunks_fill_rate)? {
                        self.drop_unused_chunks()?;
                    }
                }
            }
        }
        self.auto_compact_last_file_op_count
            .store(self.file_op_count(), Ordering::Release);
        Ok(())
    }

    fn file_op_count(&self) -> u64 {
        self.file.write_count() + self.file.read_count()
    }

    /// No file operations since the last auto-save
    fn is_idle(&self) -> bool {
        self.auto_compact_last_file_op_count.load(Ordering::Acquire) == self.file_op_count()
    }

    fn target_fill_rate(&self) -> u32 {
        let target = self.config.auto_compact_fill_rate;
        if self.is_idle() {
            target
        } else {
            target / 2
        }
    }
}

fn add_to_changed(changed: &mut Vec<Box<dyn TreeRoot>>, root: Box<dyn TreeRoot>) {
    // a saved leaf may pop up as the root after deletions; its position
    // still has to go into the layout
    if !root.is_saved() || root.is_leaf() {
        changed.push(root);
    }
}

fn round_up_to_block(len: usize) -> usize {
    let block = BLOCK_SIZE as usize;
    len.div_ceil(block) * block
}
