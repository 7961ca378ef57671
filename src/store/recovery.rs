//! Crash Recovery
//!
//! Opening a file means finding the newest chunk whose whole chunk set is
//! still intact:
//!
//! ```text
//!  header copies ──► last chunk candidate ──► follow `next` while valid
//!        │                                        │
//!        │ clean shutdown                         │ unclean
//!        ▼                                        ▼
//!  verify the 20 newest chunks         try candidates newest first,
//!  of its chunk map                    then a full backward scan
//!        │                                        │
//!        └──────────────► rebuild free space ◄────┘
//! ```
//!
//! A chunk is valid when its header and footer both pass their checksums and
//! agree on id and block.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::codec::page_info;
use crate::error::{AtlasError, ErrorCode, Result};
use crate::map::MvMap;
use crate::storage::chunk::{ChunkFooter, CHUNK_FOOTER_LENGTH, CHUNK_HEADER_LENGTH};
use crate::storage::free_space::FIRST_FREE_BLOCK;
use crate::storage::{Chunk, BLOCK_SIZE};

use super::header::{StoreHeader, FORMAT_READ, FORMAT_WRITE};
use super::{now_ms, StoreCore, MIN_USER_MAP_ID};

/// Chunks checked after a clean shutdown
const CHUNKS_TO_VERIFY: usize = 20;

impl StoreCore {
    // =========================================================================
    // Chunk Headers and Footers
    // =========================================================================

    pub(crate) fn read_chunk_header(&self, block: u64) -> Result<Chunk> {
        let data = self.file.read_fully(block * BLOCK_SIZE, CHUNK_HEADER_LENGTH)?;
        Chunk::read_header(&data)
    }

    fn read_chunk_header_optionally(&self, block: u64, expected_id: Option<u32>) -> Option<Chunk> {
        let chunk = self.read_chunk_header(block).ok()?;
        if chunk.block != block || expected_id.is_some_and(|id| id != chunk.id) {
            return None;
        }
        Some(chunk)
    }

    /// Footer of the chunk ending just before `block_after`
    fn read_chunk_footer(&self, block_after: u64) -> Option<ChunkFooter> {
        let pos = (block_after * BLOCK_SIZE).checked_sub(CHUNK_FOOTER_LENGTH as u64)?;
        let data = self.file.read_fully(pos, CHUNK_FOOTER_LENGTH).ok()?;
        Chunk::read_footer(&data)
    }

    /// The chunk at `block`, if both its header and footer are intact
    pub(crate) fn read_chunk_header_and_footer(&self, block: u64, expected_id: u32) -> Option<Chunk> {
        let header = self.read_chunk_header_optionally(block, Some(expected_id))?;
        let footer = self.read_chunk_footer(block + header.len as u64)?;
        if footer.id != expected_id || footer.block != header.block {
            return None;
        }
        Some(header)
    }

    /// Search backwards from `block` for the nearest complete chunk
    ///
    /// A footer or a stray header inside a prospective chunk disqualifies it.
    fn discover_chunk(&self, mut block: u64) -> Option<Chunk> {
        let mut candidate_location = u64::MAX;
        let mut candidate = None;
        loop {
            if block == candidate_location {
                return candidate;
            }
            if block <= FIRST_FREE_BLOCK {
                return None;
            }
            if let Some(footer) = self.read_chunk_footer(block) {
                candidate_location = u64::MAX;
                if let Some(chunk) = self.read_chunk_header_optionally(footer.block, Some(footer.id)) {
                    candidate_location = chunk.block;
                    candidate = Some(chunk);
                }
            }
            block -= 1;
            if block > candidate_location && self.read_chunk_header_optionally(block, None).is_some() {
                candidate_location = u64::MAX;
            }
        }
    }

    // =========================================================================
    // Store Header
    // =========================================================================

    /// Read the header and recover the newest consistent chunk set
    pub(crate) fn read_store_header(&self) -> Result<()> {
        // Step 1: Both header copies; the one with the newer valid chunk wins
        let data = self.file.read_up_to(0, 2 * BLOCK_SIZE as usize)?;
        let mut newest: Option<Chunk> = None;
        let mut chosen: Option<StoreHeader> = None;
        let mut assume_clean = true;
        for copy in 0..2 {
            let start = copy * BLOCK_SIZE as usize;
            let Some(header) = data.get(start..).and_then(StoreHeader::read) else {
                assume_clean = false;
                continue;
            };
            assume_clean = assume_clean
                && newest
                    .as_ref()
                    .map_or(true, |n| header.last_chunk_version == n.version);
            if newest
                .as_ref()
                .map_or(true, |n| header.last_chunk_version > n.version)
            {
                let block = if header.last_block == 0 {
                    FIRST_FREE_BLOCK
                } else {
                    header.last_block
                };
                if let Some(chunk) = self.read_chunk_header_and_footer(block, header.last_chunk_id) {
                    newest = Some(chunk);
                }
                chosen = Some(header);
            }
        }

        // Step 2: Format checks
        let Some(mut header) = chosen else {
            return Err(AtlasError::corrupt(format!(
                "Store header is corrupt: {:?}",
                self.file.path()
            )));
        };
        check_format(&header, self.file.is_read_only())?;

        assume_clean = assume_clean && newest.is_some() && !self.config.recovery_mode && header.clean_shutdown;
        let now = now_ms();
        if now < header.creation_time {
            // the clock was set back
            header.creation_time = now;
        }
        self.set_header(header);
        self.chunks.write().clear();

        // Step 3: A newer chunk may sit at the end of the file
        let mut blocks_in_store = self.file.size() / BLOCK_SIZE;
        if !assume_clean {
            if let Some(tail) = self.discover_chunk(blocks_in_store) {
                blocks_in_store = tail.block;
                if newest.as_ref().map_or(true, |n| tail.version > n.version) {
                    newest = Some(tail);
                }
            }
        }

        // Step 4: Follow the `next` chain
        let mut valid_by_location: HashMap<u64, Chunk> = HashMap::new();
        if let Some(mut chunk) = newest.take() {
            loop {
                valid_by_location.insert(chunk.block, chunk.clone());
                if chunk.next == 0 || chunk.next >= blocks_in_store {
                    break;
                }
                match self.read_chunk_header_and_footer(chunk.next, chunk.id + 1) {
                    Some(next) if next.version > chunk.version => {
                        // a clean shutdown leaves nothing to follow
                        assume_clean = false;
                        chunk = next;
                    }
                    _ => break,
                }
            }
            newest = Some(chunk);
        }

        // Step 5: Clean shutdown, spot check the newest chunks
        if assume_clean {
            assume_clean = match self.verify_newest_chunks(newest.clone(), &mut valid_by_location) {
                Ok(verified) => verified,
                Err(e) => {
                    warn!(error = %e, "Chunk verification failed");
                    self.handle_error(&e);
                    false
                }
            };
        }

        // Step 6: Otherwise find the newest chunk with a complete chunk set
        if !assume_clean {
            info!(path = ?self.file.path(), "Store was not closed cleanly, recovering");
            let quick = !self.config.recovery_mode
                && self.find_last_chunk_with_complete_valid_chunk_set(&valid_by_location, false);
            if !quick {
                let mut block = blocks_in_store;
                while let Some(tail) = self.discover_chunk(block) {
                    block = tail.block;
                    valid_by_location.insert(block, tail);
                }
                if !self.find_last_chunk_with_complete_valid_chunk_set(&valid_by_location, true) {
                    if !valid_by_location.is_empty() {
                        return Err(AtlasError::corrupt(
                            "File is corrupted - unable to recover a valid set of chunks",
                        ));
                    }
                    self.set_last_chunk(None)?;
                }
            }
        }

        // Step 7: Free space and dead chunks
        self.file.clear();
        let mut dead = self.dead_chunks.lock();
        dead.clear();
        for chunk in self.chunk_list() {
            if chunk.is_saved() {
                self.file.mark_used(chunk.pos(), chunk.len_bytes())?;
            }
            if !chunk.is_live() {
                dead.push_back(chunk.id);
            }
        }
        debug!(
            version = self.current_version(),
            chunks = self.chunks.read().len(),
            dead = dead.len(),
            "Read store header"
        );
        Ok(())
    }

    fn verify_newest_chunks(&self, last: Option<Chunk>, valid_by_location: &mut HashMap<u64, Chunk>) -> Result<bool> {
        self.set_last_chunk(last)?;
        let mut loaded = Vec::new();
        for entry in MvMap::from_core(self.chunk_map.clone()).cursor(None)? {
            let (id, data) = entry?;
            let chunk = Chunk::from_metadata(&data)?;
            // reading the chunk map may have loaded it already
            let chunk = self
                .chunks
                .write()
                .entry(id as u32)
                .or_insert(chunk)
                .clone();
            loaded.push(chunk);
        }
        loaded.sort_by(|a, b| b.version.cmp(&a.version));
        for chunk in loaded.iter().take(CHUNKS_TO_VERIFY) {
            match self.read_chunk_header_and_footer(chunk.block, chunk.id) {
                Some(valid) => {
                    valid_by_location.insert(valid.block, valid);
                }
                None => {
                    warn!(chunk = chunk.id, block = chunk.block, "Chunk failed verification");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Try last-chunk candidates, newest first, until one references only
    /// chunks that are intact on disk
    fn find_last_chunk_with_complete_valid_chunk_set(
        &self,
        valid_by_location: &HashMap<u64, Chunk>,
        after_full_scan: bool,
    ) -> bool {
        let mut candidates: Vec<Chunk> = valid_by_location.values().cloned().collect();
        // of two copies of one chunk the one nearer the start is the newer
        candidates.sort_by(|a, b| b.version.cmp(&a.version).then(a.block.cmp(&b.block)));
        let mut valid_by_id: HashMap<u32, Chunk> = HashMap::new();
        for chunk in candidates.iter().rev() {
            valid_by_id.insert(chunk.id, chunk.clone());
        }

        for candidate in &candidates {
            match self.try_last_chunk(candidate, valid_by_location, &valid_by_id, after_full_scan) {
                Ok(true) => {
                    info!(chunk = candidate.id, version = candidate.version, "Recovered store");
                    return true;
                }
                Ok(false) => {
                    debug!(chunk = candidate.id, "Chunk set incomplete, trying an older chunk");
                }
                Err(e) => {
                    debug!(chunk = candidate.id, error = %e, "Chunk map unreadable, trying an older chunk");
                }
            }
        }
        false
    }

    fn try_last_chunk(
        &self,
        candidate: &Chunk,
        valid_by_location: &HashMap<u64, Chunk>,
        valid_by_id: &HashMap<u32, Chunk>,
        after_full_scan: bool,
    ) -> Result<bool> {
        self.set_last_chunk(Some(candidate.clone()))?;
        let entries: Vec<(u64, Vec<u8>)> = MvMap::from_core(self.chunk_map.clone())
            .cursor(None)?
            .collect::<Result<_>>()?;

        for (id, data) in entries {
            let id = id as u32;
            let from_map = Chunk::from_metadata(&data)?;
            let mut chunk = self
                .chunks
                .write()
                .entry(id)
                .or_insert(from_map)
                .clone();

            let intact_here = valid_by_location
                .get(&chunk.block)
                .is_some_and(|valid| valid.id == chunk.id);
            if !intact_here {
                if let Some(copy) = valid_by_id.get(&chunk.id) {
                    // the copy's header carries no occupancy data, so keep
                    // ours and only point it at the copy
                    chunk.block = copy.block;
                } else if chunk.is_live()
                    && (after_full_scan || self.read_chunk_header_and_footer(chunk.block, chunk.id).is_none())
                {
                    return Ok(false);
                }
            }
            if !chunk.is_live() {
                // dead and taking no space; dropped with the next commit
                chunk.block = u64::MAX;
            }
            self.chunks.write().insert(id, chunk);
        }
        Ok(true)
    }

    /// Make `last` the newest chunk and load the meta map roots it points at
    fn set_last_chunk(&self, last: Option<Chunk>) -> Result<()> {
        self.chunks.write().clear();
        self.tocs.lock().clear();
        self.leaf_cache.clear();
        self.non_leaf_cache.clear();

        let (version, layout_root, chunk_map_root, map_id) = match &last {
            Some(chunk) => (
                chunk.version,
                chunk.layout_root,
                chunk.chunk_map_root,
                chunk.map_id.max(MIN_USER_MAP_ID - 1),
            ),
            None => (0, 0, 0, MIN_USER_MAP_ID - 1),
        };
        self.current_version
            .store(version, std::sync::atomic::Ordering::Release);
        self.set_last_chunk_ref(last.as_ref());
        if let Some(chunk) = last {
            self.chunk_id_counter
                .store(chunk.id, std::sync::atomic::Ordering::Release);
            self.chunks.write().insert(chunk.id, chunk);
        }
        self.last_map_id
            .store(map_id, std::sync::atomic::Ordering::Release);

        let saved_or_empty = |pos: u64| if page_info::is_saved(pos) && pos != u64::MAX { pos } else { 0 };
        let last_stored = version.saturating_sub(1);
        self.layout
            .set_root_page_info(saved_or_empty(layout_root), last_stored)?;
        self.chunk_map
            .set_root_page_info(saved_or_empty(chunk_map_root), last_stored)?;
        Ok(())
    }
}

fn check_format(header: &StoreHeader, read_only: bool) -> Result<()> {
    if header.block_size as u64 != BLOCK_SIZE {
        return Err(AtlasError::store(
            ErrorCode::UnsupportedFormat,
            format!("Block size {} is currently not supported", header.block_size),
        ));
    }
    if header.format > FORMAT_WRITE && !read_only {
        return Err(AtlasError::store(
            ErrorCode::UnsupportedFormat,
            format!(
                "The write format {} is larger than the supported format {}, and the file was not opened in read-only mode",
                header.format, FORMAT_WRITE
            ),
        ));
    }
    if header.format_read > FORMAT_READ {
        return Err(AtlasError::store(
            ErrorCode::UnsupportedFormat,
            format!(
                "The read format {} is larger than the supported format {}",
                header.format_read, FORMAT_READ
            ),
        ));
    }
    Ok(())
}
