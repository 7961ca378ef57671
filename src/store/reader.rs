//! Page and chunk lookups
//!
//! Pages are found through their position: the chunk id selects a chunk (from
//! memory or, failing that, from the chunk map) and the offset and length code
//! locate the record inside it.

use std::sync::Arc;

use tracing::warn;

use crate::codec::page_info;
use crate::error::{AtlasError, ErrorCode, Result};
use crate::map::MapSettings;
use crate::page::Page;
use crate::storage::Chunk;
use crate::types::{DataType, KeyType};

use super::cache::PageCache;
use super::{LayoutMap, StoreCore, LAYOUT_MAP_ID};

impl StoreCore {
    fn cache_for(&self, pos: u64) -> &PageCache {
        if page_info::is_leaf(pos) {
            &self.leaf_cache
        } else {
            &self.non_leaf_cache
        }
    }

    /// Load the page stored at `pos`, through the page cache
    pub(crate) fn read_page<K: KeyType, V: DataType>(
        &self,
        map_id: u32,
        pos: u64,
    ) -> Result<Arc<Page<K, V>>> {
        if !page_info::is_saved(pos) {
            return Err(AtlasError::corrupt("Page is not saved yet"));
        }
        let cache = self.cache_for(pos);
        if let Some(cached) = cache.get(pos) {
            if let Ok(page) = cached.downcast::<Page<K, V>>() {
                return Ok(page);
            }
        }

        match self.read_page_from_file::<K, V>(map_id, pos) {
            Ok(page) => {
                let page = Arc::new(page);
                cache.put(pos, page.clone(), page.memory());
                Ok(page)
            }
            Err(e) if self.config.recovery_mode => {
                warn!(map_id, pos, error = %e, "Unreadable page replaced by an empty leaf");
                Ok(Page::create_empty_leaf(map_id))
            }
            Err(e @ AtlasError::Store { .. }) => Err(e),
            Err(e) => Err(AtlasError::corrupt(format!(
                "Unable to read the page at position {}: {}",
                pos, e
            ))),
        }
    }

    fn read_page_from_file<K: KeyType, V: DataType>(&self, map_id: u32, pos: u64) -> Result<Page<K, V>> {
        let chunk = self.get_chunk(page_info::chunk_id(pos))?;
        if !chunk.is_saved() {
            return Err(AtlasError::corrupt(format!("Chunk {} is not saved yet", chunk.id)));
        }
        let file_pos = chunk.pos() + page_info::offset(pos) as u64;
        let chunk_end = chunk.pos() + chunk.len_bytes();
        let available = chunk_end.saturating_sub(file_pos);
        let len = (page_info::max_length_of(pos) as u64).min(available);
        let mut data = self.file.read_fully(file_pos, len as usize)?;

        // the length code only gives an upper bound for large pages
        if data.len() >= 4 {
            let record_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
            if record_len > len && record_len <= available {
                data = self.file.read_fully(file_pos, record_len as usize)?;
            }
        }
        Page::read(&data, pos, map_id, &chunk, &self.decompressor)
    }

    /// Chunk `id`, loading its metadata from the chunk map if needed
    pub(crate) fn get_chunk(&self, id: u32) -> Result<Chunk> {
        if let Some(chunk) = self.chunks.read().get(&id) {
            return Ok(chunk.clone());
        }
        self.check_open()?;
        let data = self.chunk_map.get(&(id as u64))?.ok_or_else(|| {
            AtlasError::store(ErrorCode::ChunkNotFound, format!("Chunk {} not found", id))
        })?;
        let chunk = Chunk::from_metadata(&data)?;
        if !chunk.is_saved() {
            return Err(AtlasError::store(
                ErrorCode::ChunkNotFound,
                format!("Chunk {} is invalid", id),
            ));
        }
        Ok(self
            .chunks
            .write()
            .entry(id)
            .or_insert(chunk)
            .clone())
    }

    /// Table of contents of a saved chunk, cached
    pub(crate) fn get_toc(&self, chunk: &Chunk) -> Result<Arc<Vec<u64>>> {
        if let Some(toc) = self.tocs.lock().get(&chunk.id) {
            return Ok(toc.clone());
        }
        let toc = Arc::new(chunk.read_toc(&self.file)?);
        self.tocs.lock().insert(chunk.id, toc.clone());
        Ok(toc)
    }

    /// Root position of map `map_id` as committed at `version`, from disk
    ///
    /// The chunk labeled `version + 1` holds the state of `version`; the newest
    /// chunk at or below it holds the latest root written up to then.
    pub(crate) fn root_pos_at_version(&self, map_id: u32, version: u64) -> Result<Option<u64>> {
        let target = version.saturating_add(1);
        let chunk = self
            .chunks
            .read()
            .values()
            .filter(|c| c.is_saved() && c.version <= target)
            .max_by_key(|c| c.version)
            .cloned();
        let Some(chunk) = chunk else {
            return Ok(None);
        };
        if !page_info::is_saved(chunk.layout_root) {
            return Ok(None);
        }
        let layout = LayoutMap::new(
            self.weak_self.clone(),
            LAYOUT_MAP_ID,
            0,
            MapSettings::from_config(&self.config),
            false,
            true,
        );
        layout.set_initial_root(
            self.read_page(LAYOUT_MAP_ID, chunk.layout_root)?,
            chunk.version,
        );
        Ok(layout
            .get(&(map_id as u64))?
            .filter(|&pos| page_info::is_saved(pos)))
    }
}
