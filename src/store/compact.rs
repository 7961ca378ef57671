//! Compaction
//!
//! Two independent ways to win space back:
//!
//! ```text
//!  rewrite   sparse chunk ──► live pages re-put into their maps
//!                              └─► next commit writes them elsewhere,
//!                                  the chunk dies and is dropped
//!
//!  move      [hdr][A][ free ][B][ free ][C]        chunks copied into holes
//!            [hdr][A][B][C]                        then the file is truncated
//! ```
//!
//! Moving needs two metadata commits: the first records the new positions in
//! a chunk placed outside the evacuated area, the second brings that chunk
//! itself forward.

use std::time::{Duration, Instant};

use parking_lot::ReentrantMutexGuard;
use tracing::{debug, info};

use crate::codec::page_info;
use crate::error::{AtlasError, Result};
use crate::storage::chunk::{CHUNK_FOOTER_LENGTH, CHUNK_HEADER_LENGTH};
use crate::storage::{Chunk, BLOCK_SIZE};

use super::commit::as_store_error;
use super::{StoreCore, NAME_MAP_ID};

/// Bytes handled per step of `compact_file`
const COMPACT_FILE_STEP: u64 = 16 * 1024 * 1024;
const COMPACT_FILE_FILL_RATE: u32 = 95;
const LOCK_WAIT: Duration = Duration::from_millis(10);

type LockGuard<'a> = ReentrantMutexGuard<'a, ()>;

impl StoreCore {
    // =========================================================================
    // Fill Rates
    // =========================================================================

    fn is_rewritable(&self, chunk: &Chunk, now: u64) -> bool {
        chunk.is_rewritable() && self.is_seasoned(chunk, now)
    }

    /// Live share of the chunk bytes, over all chunks or the rewritable ones
    pub(crate) fn chunks_fill_rate(&self, rewritable_only: bool) -> u32 {
        let now = self.time_since_creation();
        let (mut total, mut live) = (1u64, 1u64);
        for chunk in self.chunks.read().values() {
            if !rewritable_only || self.is_rewritable(chunk, now) {
                total += chunk.max_len;
                live += chunk.max_len_live;
            }
        }
        (100 * live / total) as u32
    }

    /// File fill rate once chunks at or below `threshold` were rewritten
    fn projected_fill_rate(&self, threshold: u32) -> u32 {
        let _save = self.save_chunk_lock.lock();
        let now = self.time_since_creation();
        let (mut vacated, mut total, mut live) = (0u64, 1u64, 1u64);
        for chunk in self.chunks.read().values() {
            if self.is_rewritable(chunk, now) && chunk.fill_rate() <= threshold {
                vacated += chunk.len as u64;
                total += chunk.max_len;
                live += chunk.max_len_live;
            }
        }
        let rewritten = vacated * live / total;
        self.file
            .projected_fill_rate(vacated as i64 - rewritten as i64)
    }

    // =========================================================================
    // Rewrite
    // =========================================================================

    /// Rewrite sparse chunks if the chunks fill rate is below `target_fill_rate`
    pub(crate) fn compact(&self, target_fill_rate: u32, write_limit: u64) -> Result<bool> {
        if !self.reuse_space() || self.last_chunk_id.lock().is_none() {
            return Ok(false);
        }
        self.check_open()?;
        if target_fill_rate == 0 || self.chunks_fill_rate(false) >= target_fill_rate {
            return Ok(false);
        }
        // never wait long: a background caller could deadlock with close
        match self.store_lock.try_lock_for(LOCK_WAIT) {
            Some(_guard) => self.rewrite_chunks(write_limit, 100),
            None => Ok(false),
        }
    }

    /// Re-put the live pages of old chunks at or below `target_fill_rate`
    pub(crate) fn rewrite_chunks(&self, write_limit: u64, target_fill_rate: u32) -> Result<bool> {
        let mut serialization = self.serialization_lock.lock();
        let _usage = self.register_version_usage();
        self.accept_chunk_occupancy_changes(self.time_since_creation(), self.current_version())?;
        let old = self.find_old_chunks(write_limit, target_fill_rate);
        if old.is_empty() {
            return Ok(false);
        }
        debug!(chunks = ?old, "Rewriting chunks");
        Ok(self.compact_rewrite(&old, &mut serialization)? > 0)
    }

    /// Rewritable chunks worth rewriting, their live bytes capped at `write_limit`
    ///
    /// Low fill rate and old age go first.
    fn find_old_chunks(&self, write_limit: u64, target_fill_rate: u32) -> Vec<u32> {
        let Some(last) = self.last_chunk() else {
            return Vec::new();
        };
        let now = self.time_since_creation();
        let latest = last.version + 1;

        let mut candidates: Vec<(u64, u64, u32)> = self
            .chunks
            .read()
            .values()
            .filter(|c| self.is_rewritable(c, now) && c.fill_rate() <= target_fill_rate)
            .map(|c| {
                let age = latest.saturating_sub(c.version).max(1);
                (c.fill_rate() as u64 * 1000 / age, c.max_len_live, c.id)
            })
            .collect();
        candidates.sort_unstable();

        let mut total = 0;
        let mut old = Vec::new();
        for (_, live, id) in candidates {
            total += live;
            if total > write_limit {
                break;
            }
            old.push(id);
        }
        old
    }

    /// Leaves first, then the nodes above them
    fn compact_rewrite(&self, ids: &[u32], serialization: &mut LockGuard<'_>) -> Result<usize> {
        self.accept_chunk_occupancy_changes(self.time_since_creation(), self.current_version())?;
        let mut count = self.rewrite_chunk_pages(ids, false, serialization)?;
        self.accept_chunk_occupancy_changes(self.time_since_creation(), self.current_version())?;
        count += self.rewrite_chunk_pages(ids, true, serialization)?;
        Ok(count)
    }

    fn rewrite_chunk_pages(&self, ids: &[u32], nodes: bool, serialization: &mut LockGuard<'_>) -> Result<usize> {
        let mut count = 0;
        for &id in ids {
            let Some(chunk) = self.chunks.read().get(&id).cloned() else {
                continue;
            };
            let toc = self.get_toc(&chunk)?;
            for (page_no, &entry) in toc.iter().enumerate() {
                if !chunk.is_live_page(page_no as u32) {
                    continue;
                }
                if !nodes && !page_info::is_leaf(entry) {
                    continue;
                }
                let map_id = page_info::toc_map_id(entry);
                let Some(map) = self.map_handle(map_id) else {
                    continue;
                };
                // append maps pin their pages and are never rewritten
                if map.is_closed() || map.is_single_writer() {
                    continue;
                }
                let pos = page_info::with_chunk_id(entry, id);
                // the write may trigger a commit, which needs the serialization lock
                let rewritten = ReentrantMutexGuard::unlocked(serialization, || map.rewrite_page(pos))?;
                if rewritten {
                    count += 1;
                    if map_id == NAME_MAP_ID {
                        self.mark_meta_changed();
                    }
                }
            }
        }
        Ok(count)
    }

    // =========================================================================
    // Move
    // =========================================================================

    /// Move chunks into free space closer to the start, then shrink the file
    ///
    /// Only runs while the file fill rate is at most `target_fill_rate`.
    pub(crate) fn compact_move_chunks(&self, target_fill_rate: u32, move_size: u64) -> Result<bool> {
        self.with_store_lock(|| {
            self.check_open()?;
            // submissions happen under the store lock, so nothing new arrives
            self.wait_for_serializer();
            let mut serialization = self.serialization_lock.lock();
            let mut save = self.save_chunk_lock.lock();
            let has_chunks = self.last_chunk_id.lock().is_some();
            if !has_chunks || !self.reuse_space() || self.file.fill_rate() > target_fill_rate {
                return Ok(false);
            }
            self.move_chunks_to_front(move_size, &mut serialization, &mut save)
                .map_err(|e| self.panic(as_store_error(e)))
        })
    }

    fn move_chunks_to_front(
        &self,
        move_size: u64,
        serialization: &mut LockGuard<'_>,
        save: &mut LockGuard<'_>,
    ) -> Result<bool> {
        self.drop_unused_chunks()?;
        let start = self.file.first_free() / BLOCK_SIZE;
        let free_blocks = self.file.free_block_count();
        if free_blocks == 0 {
            return Ok(false);
        }
        let ids = self.find_chunks_to_move(start, (move_size / BLOCK_SIZE).min(free_blocks));
        if ids.is_empty() {
            return Ok(false);
        }
        self.move_chunks(&ids, serialization, save)?;
        Ok(true)
    }

    /// Chunks behind `start_block` that are cheapest to move, in file order
    fn find_chunks_to_move(&self, start_block: u64, max_blocks: u64) -> Vec<u32> {
        if max_blocks == 0 {
            return Vec::new();
        }
        let mut candidates: Vec<(u64, u64, u32, u64)> = self
            .chunks
            .read()
            .values()
            .filter(|c| c.is_saved() && c.block > start_block)
            .map(|c| (self.file.move_priority(c.block), c.block, c.id, c.len as u64))
            .collect();
        candidates.sort_unstable();

        let mut size = 0;
        let mut chosen = Vec::new();
        for (_, block, id, len) in candidates {
            size += len;
            if size > max_blocks {
                break;
            }
            chosen.push((block, id));
        }
        chosen.sort_unstable();
        chosen.into_iter().map(|(_, id)| id).collect()
    }

    fn move_chunks(&self, ids: &[u32], serialization: &mut LockGuard<'_>, save: &mut LockGuard<'_>) -> Result<()> {
        // Step 1: A header pointing at the current last chunk, so recovery
        // still finds it once older chunks land behind it
        self.write_store_header()?;
        self.file.sync()?;

        // Step 2: Evacuate, keeping clear of the area being vacated
        let leftmost = match ids.first().and_then(|id| self.chunks.read().get(id).map(|c| c.block)) {
            Some(block) => block,
            None => return Ok(()),
        };
        let original_end = self.file.after_last_block();
        for &id in ids {
            self.move_chunk(id, leftmost, original_end as i64)?;
        }

        // Step 3: Record the new positions
        self.store_reserved(leftmost, original_end as i64, serialization, save)?;
        self.file.sync()?;

        let last = self
            .last_chunk()
            .ok_or_else(|| AtlasError::internal("No last chunk after moving chunks"))?;
        let after_evacuation = self.file.after_last_block();
        let last_inside = last.block < leftmost;
        let mut moved_to_end = !last_inside;

        // Step 4: Chunks that went past the old end may now use the vacated area
        for &id in ids {
            let beyond = self
                .chunks
                .read()
                .get(&id)
                .is_some_and(|c| c.block >= original_end);
            if beyond && self.move_chunk(id, original_end, after_evacuation as i64)? {
                moved_to_end = true;
            }
        }

        // Step 5: Bring the metadata chunk forward too
        if moved_to_end {
            let moved = self.move_chunk_inside(last.id, original_end)?;
            self.store_reserved(original_end, after_evacuation as i64, serialization, save)?;
            self.file.sync()?;

            let boundary = if moved || last_inside {
                after_evacuation
            } else {
                self.chunks
                    .read()
                    .get(&last.id)
                    .map_or(after_evacuation, |c| c.block)
            };
            let moved = !moved && self.move_chunk_inside(last.id, boundary)?;
            let newest = self.last_chunk().map(|c| c.id);
            let newest_moved = match newest {
                Some(id) => self.move_chunk_inside(id, boundary)?,
                None => false,
            };
            if newest_moved || moved {
                self.store_reserved(boundary, -1, serialization, save)?;
            }
        }

        self.shrink_file_if_possible(0)?;
        self.file.sync()?;
        info!(
            chunks = ids.len(),
            size = self.file.size(),
            "Moved chunks"
        );
        Ok(())
    }

    /// Commit with `reserved_low..reserved_high` kept free, dropping the
    /// serialization and save locks meanwhile
    fn store_reserved(
        &self,
        reserved_low: u64,
        reserved_high: i64,
        serialization: &mut LockGuard<'_>,
        save: &mut LockGuard<'_>,
    ) -> Result<()> {
        ReentrantMutexGuard::unlocked(save, || {
            ReentrantMutexGuard::unlocked(serialization, || {
                self.store_now(true, reserved_low, Some(reserved_high))
            })
        })
    }

    fn move_chunk_inside(&self, id: u32, boundary: u64) -> Result<bool> {
        let Some(chunk) = self.chunks.read().get(&id).cloned() else {
            return Ok(false);
        };
        if chunk.block < boundary
            || self
                .file
                .predict_allocation(chunk.len as u64, boundary, -1)
                >= boundary
        {
            return Ok(false);
        }
        self.move_chunk(id, boundary, -1)
    }

    /// Copy chunk `id` into free space outside `reserved_low..reserved_high`
    ///
    /// Returns `false` if the chunk is gone meanwhile.
    fn move_chunk(&self, id: u32, reserved_low: u64, reserved_high: i64) -> Result<bool> {
        let Some(chunk) = self.chunks.read().get(&id).cloned() else {
            return Ok(false);
        };
        let start = chunk.pos();
        let length = chunk.len_bytes();
        let new_pos = self.file.allocate(length, reserved_low, reserved_high);
        self.file.copy(start, new_pos, length)?;

        // the header on disk has no occupancy data; it is rewritten as is,
        // only relocated
        let data = self.file.read_fully(start, CHUNK_HEADER_LENGTH)?;
        let mut on_disk = Chunk::read_header(&data)?;
        let block = new_pos / BLOCK_SIZE;
        on_disk.block = block;
        on_disk.next = 0;
        self.file.write_fully(new_pos, &on_disk.header_bytes())?;
        self.file
            .write_fully(new_pos + length - CHUNK_FOOTER_LENGTH as u64, &on_disk.footer_bytes())?;
        self.file.free(start, length);

        let updated = {
            let mut chunks = self.chunks.write();
            let Some(chunk) = chunks.get_mut(&id) else {
                return Ok(false);
            };
            chunk.block = block;
            chunk.next = 0;
            chunk.clone()
        };
        self.put_chunk_metadata(&updated)?;
        debug!(chunk = id, from = start / BLOCK_SIZE, to = block, "Moved chunk");
        Ok(true)
    }

    // =========================================================================
    // Whole-File Compaction and Maintenance
    // =========================================================================

    /// Rewrite and move chunks until nothing is left to gain or `max_ms` passed
    pub(crate) fn compact_file(&self, max_ms: u64) -> Result<()> {
        self.set_retention_time(0);
        let stop_at = Instant::now() + Duration::from_millis(max_ms);
        while self.compact(COMPACT_FILE_FILL_RATE, COMPACT_FILE_STEP)? {
            self.file.sync()?;
            self.compact_move_chunks(COMPACT_FILE_FILL_RATE, COMPACT_FILE_STEP)?;
            if Instant::now() >= stop_at {
                break;
            }
        }
        Ok(())
    }

    /// Up to five rounds of rewriting and moving towards `target_fill_rate`
    pub(crate) fn do_maintenance(&self, target_fill_rate: u32) -> Result<()> {
        if target_fill_rate == 0 || self.last_chunk_id.lock().is_none() || !self.reuse_space() {
            return Ok(());
        }
        let mut last_projected: Option<u32> = None;
        for round in 0..5 {
            let fill_rate = self.file.fill_rate();
            let mut projected = fill_rate;
            if fill_rate > target_fill_rate {
                projected = self.projected_fill_rate(100);
                if projected > target_fill_rate || last_projected.is_some_and(|last| projected <= last) {
                    break;
                }
            }
            last_projected = Some(projected);

            let Some(guard) = self.store_lock.try_lock_for(LOCK_WAIT) else {
                break;
            };
            let result = (|| -> Result<bool> {
                let write_limit =
                    self.config.auto_commit_buffer_size as u64 * target_fill_rate as u64 / projected.max(1) as u64;
                if projected < fill_rate {
                    let rewritten = self.rewrite_chunks(write_limit, target_fill_rate)?;
                    if (!rewritten || self.drop_unused_chunks()? == 0) && round > 0 {
                        return Ok(false);
                    }
                }
                self.compact_move_chunks(101, write_limit)
            })();
            drop(guard);
            self.check_panic_after_unlock();
            if !result? {
                break;
            }
        }
        Ok(())
    }
}
