//! Page serialization
//!
//! ## Page Record
//! ```text
//! ┌─────┬───────┬─────────┬────────┬───────────┬──────┬──────────────────────┐
//! │ len │ check │ page_no │ map_id │ key_count │ type │ payload ...          │
//! │ u32 │  u32  │ varint  │ varint │  varint   │  u8  │                      │
//! └─────┴───────┴─────────┴────────┴───────────┴──────┴──────────────────────┘
//! ```
//! `type` bit 0 marks a non-leaf page and bit 1 a compressed payload. A
//! non-leaf page first stores `key_count + 1` child infos (u64) and then as many
//! subtree counts (varint). The payload is the keys, followed by the values for
//! a leaf. A compressed payload is preceded by `varint(uncompressed - compressed)`.
//!
//! `check` is a crc32 over everything after it, mixed with the chunk id, the
//! offset and the length.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::checksum::page_check;
use crate::codec::page_info;
use crate::codec::varint::{read_var_u32, read_var_u64, write_var_u32, write_var_u64};
use crate::codec::Compressor;
use crate::error::{AtlasError, Result};
use crate::storage::chunk::{Chunk, CHUNK_HEADER_LENGTH};
use crate::types::{DataType, KeyType};

use super::{ErasedPage, KeyManager, Page, PageBody, PageReference, RemovedPageInfo};

const TYPE_NODE: u8 = 1;
const TYPE_COMPRESSED: u8 = 2;

/// Payloads at or below this size are never compressed
const COMPRESSION_THRESHOLD: usize = 256;

/// Fixed part of the record before the varints
const RECORD_PREFIX: usize = 8;

// =============================================================================
// Chunk Writer
// =============================================================================

/// Collects the pages of one chunk into a buffer
pub(crate) struct ChunkWriter<'a> {
    pub(crate) chunk: Chunk,
    /// Chunk bytes; the first `CHUNK_HEADER_LENGTH` bytes are reserved
    pub(crate) buf: BytesMut,
    /// ToC entries in page-number order
    pub(crate) toc: Vec<u64>,
    compressor: &'a dyn Compressor,
    compress: bool,
    /// Pages that were dropped from their tree while being written
    pub(crate) late_removals: Vec<RemovedPageInfo>,
    /// Written pages, offered to the page cache
    pub(crate) written: Vec<(u64, ErasedPage, usize)>,
}

impl<'a> ChunkWriter<'a> {
    pub(crate) fn new(chunk: Chunk, compressor: &'a dyn Compressor, compress: bool) -> Self {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        buf.put_bytes(0, CHUNK_HEADER_LENGTH);
        Self {
            chunk,
            buf,
            toc: Vec::new(),
            compressor,
            compress,
            late_removals: Vec::new(),
            written: Vec::new(),
        }
    }

    /// Append the ToC and record its offset
    pub(crate) fn write_toc(&mut self) {
        self.chunk.toc_pos = self.buf.len() as u32;
        for entry in &self.toc {
            self.buf.put_u64(*entry);
        }
    }
}

// =============================================================================
// Write / Read
// =============================================================================

impl<K: KeyType, V: DataType> Page<K, V> {
    /// Write this page and all unsaved pages below it, children first
    ///
    /// Returns the position of this page.
    pub(crate) fn write_unsaved_recursive(
        self: &Arc<Self>,
        writer: &mut ChunkWriter<'_>,
        pinned: bool,
    ) -> Result<u64> {
        if self.is_saved() {
            return Ok(self.pos());
        }
        for child in self.children() {
            if let Some(page) = child.page() {
                let pos = page.write_unsaved_recursive(writer, pinned)?;
                child.set_written_pos(pos);
            }
        }
        self.write(writer, pinned)
    }

    fn write(self: &Arc<Self>, writer: &mut ChunkWriter<'_>, pinned: bool) -> Result<u64> {
        let start = writer.buf.len();
        let page_no = writer.toc.len() as u32;
        let chunk_id = writer.chunk.id;
        let mut type_byte = if self.is_leaf() { 0 } else { TYPE_NODE };

        let buf = &mut writer.buf;
        buf.put_u32(0);
        buf.put_u32(0);
        write_var_u32(buf, page_no);
        write_var_u32(buf, self.map_id());
        write_var_u32(buf, self.key_count() as u32);
        let type_at = buf.len();
        buf.put_u8(type_byte);

        if let PageBody::Node { children, .. } = self.body() {
            for child in children {
                let pos = child.stored_pos();
                if !page_info::is_saved(pos) {
                    return Err(AtlasError::internal(format!(
                        "Child of page in map {} written before its children",
                        self.map_id()
                    )));
                }
                buf.put_u64(pos);
            }
            for child in children {
                write_var_u64(buf, child.count());
            }
        }

        let mut payload = BytesMut::new();
        self.keys().write(&mut payload)?;
        V::write_all(&mut payload, self.values())?;

        let mut stored = false;
        if writer.compress && payload.len() > COMPRESSION_THRESHOLD {
            let compressed = writer.compressor.compress(&payload)?;
            if compressed.len() < payload.len() {
                type_byte |= TYPE_COMPRESSED;
                buf[type_at] = type_byte;
                write_var_u32(buf, (payload.len() - compressed.len()) as u32);
                buf.put_slice(&compressed);
                stored = true;
            }
        }
        if !stored {
            buf.put_slice(&payload);
        }

        let len = buf.len() - start;
        let check = page_check(chunk_id, start as u32, len as u32, &buf[start + RECORD_PREFIX..]);
        buf[start..start + 4].copy_from_slice(&(len as u32).to_be_bytes());
        buf[start + 4..start + 8].copy_from_slice(&check.to_be_bytes());

        let pos = page_info::encode(chunk_id, start as u32, len, !self.is_leaf());
        writer.toc.push(page_info::with_chunk_id(pos, self.map_id()));
        writer
            .chunk
            .account_for_written_page(page_info::max_length_of(pos) as u64, pinned);

        if !self.set_saved(pos, page_no) {
            // dropped from the tree while we were writing it
            writer.late_removals.push(RemovedPageInfo {
                pos,
                page_no: Some(page_no),
                version: writer.chunk.version,
                pinned,
            });
        } else {
            let erased: ErasedPage = self.clone();
            writer.written.push((pos, erased, self.memory()));
        }
        Ok(pos)
    }

    /// Decode the page stored at `pos`
    ///
    /// `data` starts at the page and holds at least its full record.
    pub(crate) fn read(
        data: &[u8],
        pos: u64,
        expected_map_id: u32,
        chunk: &Chunk,
        decompressor: &dyn Compressor,
    ) -> Result<Self> {
        let offset = page_info::offset(pos);
        let corrupt = |what: &str| {
            AtlasError::corrupt(format!(
                "{} (page {} in chunk {} at offset {})",
                what, pos, chunk.id, offset
            ))
        };

        if data.len() < RECORD_PREFIX {
            return Err(corrupt("Page record truncated"));
        }
        let mut head = &data[..RECORD_PREFIX];
        let len = head.get_u32() as usize;
        let check = head.get_u32();
        let code = page_info::length_code(pos);
        if len < RECORD_PREFIX
            || len > data.len()
            || (code < page_info::LARGE_LENGTH_CODE && len > page_info::max_length(code))
        {
            return Err(corrupt(&format!("Invalid page length {}", len)));
        }
        if page_check(chunk.id, offset, len as u32, &data[RECORD_PREFIX..len]) != check {
            return Err(corrupt("Page checksum mismatch"));
        }

        let mut b = &data[RECORD_PREFIX..len];
        let page_no = read_var_u32(&mut b)?;
        if page_no >= chunk.page_count {
            return Err(corrupt(&format!("Page number {} out of range", page_no)));
        }
        let map_id = read_var_u32(&mut b)?;
        if map_id != expected_map_id {
            return Err(corrupt(&format!(
                "Page belongs to map {}, expected map {}",
                map_id, expected_map_id
            )));
        }
        let key_count = read_var_u32(&mut b)? as usize;
        if !b.has_remaining() {
            return Err(corrupt("Page record truncated"));
        }
        let type_byte = b.get_u8();
        let is_node = type_byte & TYPE_NODE != 0;
        if is_node != page_info::is_node(pos) {
            return Err(corrupt("Page type does not match its position"));
        }

        let mut children = Vec::new();
        if is_node {
            if b.remaining() < (key_count + 1) * 8 {
                return Err(corrupt("Page record truncated"));
            }
            let infos: Vec<u64> = (0..=key_count).map(|_| b.get_u64()).collect();
            for info in infos {
                children.push(PageReference::saved(info, read_var_u64(&mut b)?));
            }
        }

        let expanded;
        let mut payload: &[u8] = if type_byte & TYPE_COMPRESSED != 0 {
            let delta = read_var_u32(&mut b)? as usize;
            expanded = decompressor.expand(b, b.len() + delta)?;
            &expanded
        } else {
            b
        };

        let keys = KeyManager::read(&mut payload, key_count)?;
        let page = if is_node {
            Page::create_node(map_id, keys, children)
        } else {
            let values = V::read_all(&mut payload, key_count)?;
            Page::create_leaf(map_id, keys, values)
        };
        page.set_loaded(pos, page_no);
        Ok(page)
    }
}
