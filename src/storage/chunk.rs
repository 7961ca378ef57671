//! Chunk
//!
//! A chunk is one committed batch of pages, stored contiguously and block aligned.
//!
//! ## Chunk Layout
//! ```text
//! ┌──────────────┬────────────────────────────┬──────────┬─────────┬────────┐
//! │ Header (128) │ Pages ...                  │ ToC      │ padding │ Footer │
//! │              │ (children before parents)  │ u64 × n  │         │  (24)  │
//! └──────────────┴────────────────────────────┴──────────┴─────────┴────────┘
//! ```
//!
//! ## Header
//! ```text
//! ┌───────┬────┬───────┬───────┬─────────┬─────┬─────────┬───────┬──────┐
//! │"chnk" │ id │map_id │ block │ toc_pos │ len │ max_len │ pages │ next │
//! │  (4)  │(4) │  (4)  │  (8)  │   (4)   │ (4) │   (8)   │  (4)  │ (8)  │
//! ├───────┴────┴───────┴───────┴─────────┴─────┴─────────┴───────┴──────┤
//! │ layout_root (8) │ chunk_map_root (8) │ time (8) │ version (8) │crc(4)│
//! └─────────────────┴────────────────────┴──────────┴─────────────┴──────┘
//! ```
//! Big-endian, zero padded to [`CHUNK_HEADER_LENGTH`].
//!
//! ## Footer
//! ```text
//! ┌────┬───────┬─────────┬─────┐
//! │ id │ block │ version │ crc │
//! │(4) │  (8)  │   (8)   │ (4) │
//! └────┴───────┴─────────┴─────┘
//! ```
//!
//! The full record (liveness counters and the dead-page bitmap included) is kept
//! bincode-encoded in the chunk map.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::checksum::crc32;
use crate::error::{AtlasError, Result};

use super::file_store::FileStore;
use super::BLOCK_SIZE;

pub(crate) const CHUNK_HEADER_LENGTH: usize = 128;
pub(crate) const CHUNK_FOOTER_LENGTH: usize = 24;
const CHUNK_MAGIC: &[u8; 4] = b"chnk";
const HEADER_FIELDS_LENGTH: usize = 80;

/// Chunk ids wrap at the page-info chunk field width
pub(crate) const MAX_CHUNK_ID: u32 = crate::codec::page_info::MAX_CHUNK_ID;

/// Metadata of one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: u32,
    /// First block, `u64::MAX` while not yet placed in the file
    pub block: u64,
    /// Length in blocks
    pub len: u32,
    pub page_count: u32,
    pub page_count_live: u32,
    /// Sum of the accounted page lengths
    pub max_len: u64,
    pub max_len_live: u64,
    /// Live pages that may not be rewritten
    pub pin_count: u32,
    /// Offset of the ToC within the chunk
    pub toc_pos: u32,
    /// Last map id handed out when the chunk was written
    pub map_id: u32,
    /// Predicted block of the following chunk
    pub next: u64,
    pub layout_root: u64,
    pub chunk_map_root: u64,
    /// Milliseconds since the store was created
    pub time: u64,
    pub version: u64,
    /// When the chunk became dead (0 while live)
    pub unused: u64,
    pub unused_at_version: u64,
    /// Dead page numbers
    pub occupancy: Vec<u64>,
    /// Sort key used by compaction
    #[serde(skip)]
    pub collect_priority: i64,
}

impl Chunk {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            block: u64::MAX,
            len: 0,
            page_count: 0,
            page_count_live: 0,
            max_len: 0,
            max_len_live: 0,
            pin_count: 0,
            toc_pos: 0,
            map_id: 0,
            next: 0,
            layout_root: 0,
            chunk_map_root: 0,
            time: 0,
            version: 0,
            unused: 0,
            unused_at_version: 0,
            occupancy: Vec::new(),
            collect_priority: 0,
        }
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    pub fn is_saved(&self) -> bool {
        self.block != u64::MAX
    }

    pub fn is_live(&self) -> bool {
        self.page_count_live > 0
    }

    /// Saved, partly dead and without pinned pages
    pub fn is_rewritable(&self) -> bool {
        self.is_saved()
            && self.is_live()
            && self.page_count_live < self.page_count
            && self.pin_count == 0
    }

    /// Byte position in the file
    pub fn pos(&self) -> u64 {
        self.block * BLOCK_SIZE
    }

    pub fn len_bytes(&self) -> u64 {
        self.len as u64 * BLOCK_SIZE
    }

    /// Percentage of live bytes, at least 1 while anything is live
    pub fn fill_rate(&self) -> u32 {
        if self.max_len_live == 0 {
            return 0;
        }
        if self.max_len_live == self.max_len {
            return 100;
        }
        (1 + 98 * self.max_len_live / self.max_len.max(1)) as u32
    }

    pub fn is_live_page(&self, page_no: u32) -> bool {
        let word = (page_no / 64) as usize;
        word >= self.occupancy.len() || self.occupancy[word] & (1 << (page_no % 64)) == 0
    }

    // -------------------------------------------------------------------------
    // Accounting
    // -------------------------------------------------------------------------

    pub fn account_for_written_page(&mut self, len: u64, pinned: bool) {
        self.max_len += len;
        self.max_len_live += len;
        self.page_count += 1;
        self.page_count_live += 1;
        if pinned {
            self.pin_count += 1;
        }
    }

    /// Mark page `page_no` dead. Returns `true` when this killed the chunk.
    pub fn account_for_removed_page(
        &mut self,
        page_no: u32,
        len: u64,
        pinned: bool,
        now: u64,
        version: u64,
    ) -> Result<bool> {
        if !self.is_live_page(page_no) {
            return Err(AtlasError::internal(format!(
                "Page {} of chunk {} removed twice",
                page_no, self.id
            )));
        }
        let word = (page_no / 64) as usize;
        if self.occupancy.len() <= word {
            self.occupancy.resize(word + 1, 0);
        }
        self.occupancy[word] |= 1 << (page_no % 64);

        self.max_len_live = self.max_len_live.checked_sub(len).ok_or_else(|| {
            AtlasError::internal(format!("Chunk {} live length underflow", self.id))
        })?;
        self.page_count_live = self.page_count_live.checked_sub(1).ok_or_else(|| {
            AtlasError::internal(format!("Chunk {} live page count underflow", self.id))
        })?;
        if pinned {
            self.pin_count = self.pin_count.saturating_sub(1);
        }
        if self.unused_at_version < version {
            self.unused_at_version = version;
        }
        if !self.is_live() {
            self.unused = now;
            return Ok(true);
        }
        Ok(false)
    }

    // -------------------------------------------------------------------------
    // Header / Footer
    // -------------------------------------------------------------------------

    pub fn header_bytes(&self) -> [u8; CHUNK_HEADER_LENGTH] {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LENGTH);
        buf.put_slice(CHUNK_MAGIC);
        buf.put_u32(self.id);
        buf.put_u32(self.map_id);
        buf.put_u64(self.block);
        buf.put_u32(self.toc_pos);
        buf.put_u32(self.len);
        buf.put_u64(self.max_len);
        buf.put_u32(self.page_count);
        buf.put_u64(self.next);
        buf.put_u64(self.layout_root);
        buf.put_u64(self.chunk_map_root);
        buf.put_u64(self.time);
        buf.put_u64(self.version);
        let crc = crc32(&buf);
        buf.put_u32(crc);

        let mut out = [0u8; CHUNK_HEADER_LENGTH];
        out[..buf.len()].copy_from_slice(&buf);
        out
    }

    /// Parse and validate a chunk header
    pub fn read_header(data: &[u8]) -> Result<Chunk> {
        if data.len() < HEADER_FIELDS_LENGTH + 4 {
            return Err(AtlasError::corrupt("Chunk header too short"));
        }
        if &data[..4] != CHUNK_MAGIC {
            return Err(AtlasError::corrupt("Chunk header magic mismatch"));
        }
        let mut crc_bytes = &data[HEADER_FIELDS_LENGTH..HEADER_FIELDS_LENGTH + 4];
        let expected = crc_bytes.get_u32();
        if crc32(&data[..HEADER_FIELDS_LENGTH]) != expected {
            return Err(AtlasError::corrupt("Chunk header checksum mismatch"));
        }

        let mut b = &data[4..HEADER_FIELDS_LENGTH];
        let mut c = Chunk::new(b.get_u32());
        c.map_id = b.get_u32();
        c.block = b.get_u64();
        c.toc_pos = b.get_u32();
        c.len = b.get_u32();
        c.max_len = b.get_u64();
        c.page_count = b.get_u32();
        c.next = b.get_u64();
        c.layout_root = b.get_u64();
        c.chunk_map_root = b.get_u64();
        c.time = b.get_u64();
        c.version = b.get_u64();
        c.page_count_live = c.page_count;
        c.max_len_live = c.max_len;
        Ok(c)
    }

    pub fn footer_bytes(&self) -> [u8; CHUNK_FOOTER_LENGTH] {
        let mut buf = BytesMut::with_capacity(CHUNK_FOOTER_LENGTH);
        buf.put_u32(self.id);
        buf.put_u64(self.block);
        buf.put_u64(self.version);
        let crc = crc32(&buf);
        buf.put_u32(crc);

        let mut out = [0u8; CHUNK_FOOTER_LENGTH];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse a footer into `(id, block, version)`, `None` if the checksum fails
    pub fn read_footer(data: &[u8]) -> Option<ChunkFooter> {
        if data.len() < CHUNK_FOOTER_LENGTH {
            return None;
        }
        let mut crc_bytes = &data[20..24];
        if crc32(&data[..20]) != crc_bytes.get_u32() {
            return None;
        }
        let mut b = &data[..20];
        Some(ChunkFooter {
            id: b.get_u32(),
            block: b.get_u64(),
            version: b.get_u64(),
        })
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    /// Encode the full record for the chunk map
    pub fn to_metadata(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_metadata(data: &[u8]) -> Result<Chunk> {
        bincode::deserialize(data)
            .map_err(|e| AtlasError::corrupt(format!("Invalid chunk metadata: {}", e)))
    }

    /// Read the table of contents of a saved chunk
    pub fn read_toc(&self, file: &FileStore) -> Result<Vec<u64>> {
        let data = file.read_fully(self.pos() + self.toc_pos as u64, self.page_count as usize * 8)?;
        let mut b = &data[..];
        Ok((0..self.page_count).map(|_| b.get_u64()).collect())
    }
}

/// Decoded chunk footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub id: u32,
    pub block: u64,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> Chunk {
        let mut c = Chunk::new(7);
        c.block = 12;
        c.len = 3;
        c.map_id = 9;
        c.toc_pos = 4000;
        c.version = 42;
        c.time = 1234;
        c.next = 15;
        c.layout_root = 0xabcdef;
        c.account_for_written_page(64, false);
        c.account_for_written_page(128, true);
        c
    }

    #[test]
    fn test_header_decodes_to_same_fields() {
        let c = sample_chunk();
        let decoded = Chunk::read_header(&c.header_bytes()).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.block, 12);
        assert_eq!(decoded.len, 3);
        assert_eq!(decoded.page_count, 2);
        assert_eq!(decoded.max_len, 192);
        assert_eq!(decoded.version, 42);
        assert_eq!(decoded.next, 15);
        assert_eq!(decoded.layout_root, 0xabcdef);
    }

    #[test]
    fn test_corrupted_header_is_rejected() {
        let mut bytes = sample_chunk().header_bytes();
        bytes[10] ^= 0xff;
        assert!(Chunk::read_header(&bytes).is_err());
        let mut bytes = sample_chunk().header_bytes();
        bytes[0] = b'x';
        assert!(Chunk::read_header(&bytes).is_err());
    }

    #[test]
    fn test_footer() {
        let c = sample_chunk();
        let footer = Chunk::read_footer(&c.footer_bytes()).unwrap();
        assert_eq!(footer, ChunkFooter { id: 7, block: 12, version: 42 });
        let mut bytes = c.footer_bytes();
        bytes[3] ^= 1;
        assert!(Chunk::read_footer(&bytes).is_none());
    }

    #[test]
    fn test_removed_pages_kill_chunk() {
        let mut c = sample_chunk();
        assert!(c.is_live());
        assert!(!c.is_rewritable());
        assert_eq!(c.fill_rate(), 100);

        assert!(!c.account_for_removed_page(0, 64, false, 10, 5).unwrap());
        assert!(!c.is_live_page(0));
        assert!(c.is_live_page(1));
        assert_eq!(c.fill_rate(), 1 + 98 * 128 / 192);
        // still pinned
        assert!(!c.is_rewritable());

        assert!(c.account_for_removed_page(1, 128, true, 20, 6).unwrap());
        assert!(!c.is_live());
        assert_eq!(c.unused, 20);
        assert_eq!(c.unused_at_version, 6);
        assert_eq!(c.pin_count, 0);
        assert_eq!(c.fill_rate(), 0);
    }

    #[test]
    fn test_double_removal_is_internal_error() {
        let mut c = sample_chunk();
        c.account_for_removed_page(0, 64, false, 1, 1).unwrap();
        let err = c.account_for_removed_page(0, 64, false, 1, 1).unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::Internal));
    }

    #[test]
    fn test_metadata_keeps_liveness() {
        let mut c = sample_chunk();
        c.account_for_removed_page(1, 128, true, 3, 2).unwrap();
        let decoded = Chunk::from_metadata(&c.to_metadata().unwrap()).unwrap();
        assert_eq!(decoded, c);
    }
}
