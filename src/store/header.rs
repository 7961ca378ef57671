//! Store Header
//!
//! The first two blocks of the file hold identical copies of the store header,
//! so that one torn write never loses both.
//!
//! ## Layout
//! ```text
//! ┌─────────┬────────┬─────────────┬───────────────┬────────────────────┐
//! │ "H:2\0" │ format │ format_read │ creation_time │ last_chunk_version │
//! │   (4)   │  (1)   │     (1)     │      (8)      │        (8)         │
//! ├─────────┴────────┴─────────────┴───────────────┴────────────────────┤
//! │ last_chunk_id (4) │ last_block (8) │ block_size (4) │ clean (1) │crc│
//! └───────────────────┴────────────────┴────────────────┴───────────┴───┘
//! ```
//! Big-endian, crc32 over the preceding bytes, zero padded to one block.

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::checksum::crc32;
use crate::storage::BLOCK_SIZE;

const HEADER_MAGIC: &[u8; 4] = b"H:2\0";
const HEADER_FIELDS_LENGTH: usize = 39;

/// Highest format this code writes
pub const FORMAT_WRITE: u8 = 3;
/// Highest format this code reads
pub const FORMAT_READ: u8 = 3;

/// Decoded store header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    pub format: u8,
    pub format_read: u8,
    /// Milliseconds since the epoch
    pub creation_time: u64,
    pub last_chunk_version: u64,
    pub last_chunk_id: u32,
    /// First block of the last chunk known when the header was written
    pub last_block: u64,
    pub block_size: u32,
    /// Set by a normal close, cleared by the first write after opening
    pub clean_shutdown: bool,
}

impl StoreHeader {
    pub fn new(creation_time: u64) -> Self {
        Self {
            format: FORMAT_WRITE,
            format_read: FORMAT_READ,
            creation_time,
            last_chunk_version: 0,
            last_chunk_id: 0,
            last_block: 0,
            block_size: BLOCK_SIZE as u32,
            clean_shutdown: false,
        }
    }

    /// One header copy, padded to a full block
    pub fn to_block(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(BLOCK_SIZE as usize);
        buf.put_slice(HEADER_MAGIC);
        buf.put_u8(self.format);
        buf.put_u8(self.format_read);
        buf.put_u64(self.creation_time);
        buf.put_u64(self.last_chunk_version);
        buf.put_u32(self.last_chunk_id);
        buf.put_u64(self.last_block);
        buf.put_u32(self.block_size);
        buf.put_u8(self.clean_shutdown as u8);
        let crc = crc32(&buf);
        buf.put_u32(crc);
        buf.resize(BLOCK_SIZE as usize, 0);
        buf.to_vec()
    }

    /// Parse one header copy, `None` if it is not a valid header
    pub fn read(block: &[u8]) -> Option<StoreHeader> {
        if block.len() < HEADER_FIELDS_LENGTH + 4 || &block[..4] != HEADER_MAGIC {
            return None;
        }
        let mut crc_bytes = &block[HEADER_FIELDS_LENGTH..HEADER_FIELDS_LENGTH + 4];
        if crc32(&block[..HEADER_FIELDS_LENGTH]) != crc_bytes.get_u32() {
            return None;
        }
        let mut b = &block[4..HEADER_FIELDS_LENGTH];
        Some(StoreHeader {
            format: b.get_u8(),
            format_read: b.get_u8(),
            creation_time: b.get_u64(),
            last_chunk_version: b.get_u64(),
            last_chunk_id: b.get_u32(),
            last_block: b.get_u64(),
            block_size: b.get_u32(),
            clean_shutdown: b.get_u8() != 0,
        })
    }
}
