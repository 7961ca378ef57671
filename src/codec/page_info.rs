//! Packed page positions
//!
//! A page info is a single `u64` describing where a saved page lives. Two small
//! values are reserved: [`UNSAVED`] for pages that were never written and
//! [`REMOVED_UNSAVED`] for pages dropped from the tree before they were written.

/// Page has not been written yet
pub const UNSAVED: u64 = 0;

/// Page was removed from the tree before it was written
pub const REMOVED_UNSAVED: u64 = 1;

/// Length code meaning "read the real length from the page"
pub const LARGE_LENGTH_CODE: u32 = 31;

/// Largest chunk id that fits the layout
pub const MAX_CHUNK_ID: u32 = (1 << 26) - 1;

const CHUNK_SHIFT: u32 = 38;
const OFFSET_SHIFT: u32 = 6;
const LOW_MASK: u64 = (1 << CHUNK_SHIFT) - 1;

/// Build a page info from its parts
pub fn encode(chunk_id: u32, offset: u32, length: usize, is_node: bool) -> u64 {
    ((chunk_id as u64) << CHUNK_SHIFT)
        | ((offset as u64) << OFFSET_SHIFT)
        | ((encode_length(length) as u64) << 1)
        | is_node as u64
}

pub fn chunk_id(info: u64) -> u32 {
    (info >> CHUNK_SHIFT) as u32
}

/// Map id stored in a ToC entry
pub fn toc_map_id(toc_entry: u64) -> u32 {
    (toc_entry >> CHUNK_SHIFT) as u32
}

pub fn offset(info: u64) -> u32 {
    (info >> OFFSET_SHIFT) as u32
}

pub fn length_code(info: u64) -> u32 {
    ((info >> 1) & 31) as u32
}

pub fn is_node(info: u64) -> bool {
    info & 1 == 1
}

pub fn is_leaf(info: u64) -> bool {
    !is_node(info)
}

pub fn is_saved(info: u64) -> bool {
    info >= (1 << CHUNK_SHIFT)
}

/// Replace the chunk-id field (used to turn ToC entries into positions and back)
pub fn with_chunk_id(info: u64, chunk_id: u32) -> u64 {
    (info & LOW_MASK) | ((chunk_id as u64) << CHUNK_SHIFT)
}

/// Maximum byte length a page with this length code can have
///
/// For [`LARGE_LENGTH_CODE`] this is only the accounted size; the real length
/// is read from the page record.
pub fn max_length(code: u32) -> usize {
    let code = code.min(LARGE_LENGTH_CODE);
    (2 + (code as usize & 1)) << ((code >> 1) + 4)
}

/// Maximum byte length of the page at `info`
pub fn max_length_of(info: u64) -> usize {
    max_length(length_code(info))
}

/// Smallest length code that can hold `len` bytes
pub fn encode_length(len: usize) -> u32 {
    (0..LARGE_LENGTH_CODE)
        .find(|&code| max_length(code) >= len)
        .unwrap_or(LARGE_LENGTH_CODE)
}
