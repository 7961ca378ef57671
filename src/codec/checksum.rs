//! CRC32 checksums
//!
//! Headers, footers and pages are all guarded by crc32. Page checksums also mix in
//! where the page was written, so a page read back from the wrong offset fails.

use crc32fast::Hasher;

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Checksum of a page body located at `offset` in chunk `chunk_id`
pub fn page_check(chunk_id: u32, offset: u32, len: u32, body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&chunk_id.to_be_bytes());
    hasher.update(&offset.to_be_bytes());
    hasher.update(&len.to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}
