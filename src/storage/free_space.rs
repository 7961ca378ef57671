//! Free Space Bitmap
//!
//! One bit per [`BLOCK_SIZE`] block of the file: 0 = free, 1 = used. Blocks 0 and
//! 1 hold the two store headers and are always used.
//!
//! Allocation is first fit. A caller may reserve a block range that must not be
//! handed out (a chunk being moved, or the area a multi-phase move still reads).

use crate::error::{AtlasError, Result};

use super::BLOCK_SIZE;

/// Blocks reserved for the store headers
pub(crate) const FIRST_FREE_BLOCK: u64 = 2;

/// Bitmap of used blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSpaceBitSet {
    /// Occupancy words, bit `i % 64` of word `i / 64` is block `i`
    words: Vec<u64>,
}

impl Default for FreeSpaceBitSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeSpaceBitSet {
    pub fn new() -> Self {
        let mut set = Self { words: Vec::new() };
        set.clear();
        set
    }

    /// Forget all allocations except the header blocks
    pub fn clear(&mut self) {
        self.words.clear();
        self.set_range(0, FIRST_FREE_BLOCK);
    }

    // -------------------------------------------------------------------------
    // Bit Primitives
    // -------------------------------------------------------------------------

    fn get(&self, block: u64) -> bool {
        let word = (block / 64) as usize;
        word < self.words.len() && self.words[word] & (1 << (block % 64)) != 0
    }

    fn set_range(&mut self, from: u64, to: u64) {
        if to > from {
            let needed = ((to - 1) / 64 + 1) as usize;
            if self.words.len() < needed {
                self.words.resize(needed, 0);
            }
        }
        for block in from..to {
            self.words[(block / 64) as usize] |= 1 << (block % 64);
        }
    }

    fn clear_range(&mut self, from: u64, to: u64) {
        for block in from..to {
            let word = (block / 64) as usize;
            if word >= self.words.len() {
                break;
            }
            self.words[word] &= !(1 << (block % 64));
        }
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    fn next_clear(&self, from: u64) -> u64 {
        let mut block = from;
        while self.get(block) {
            block += 1;
        }
        block
    }

    fn next_set(&self, from: u64) -> Option<u64> {
        let mut word = (from / 64) as usize;
        if word >= self.words.len() {
            return None;
        }
        let mut bits = self.words[word] & (!0u64 << (from % 64));
        loop {
            if bits != 0 {
                return Some(word as u64 * 64 + bits.trailing_zeros() as u64);
            }
            word += 1;
            if word >= self.words.len() {
                return None;
            }
            bits = self.words[word];
        }
    }

    fn previous_set(&self, from: u64) -> Option<u64> {
        (0..=from).rev().find(|&b| self.get(b))
    }

    fn previous_clear(&self, from: u64) -> Option<u64> {
        (0..=from).rev().find(|&b| !self.get(b))
    }

    fn cardinality(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate `length` bytes, returning the byte position
    ///
    /// `reserved_low..reserved_high` (block numbers) is never handed out. A
    /// negative `reserved_high` means the reservation is open ended, in which case
    /// a clashing fit is placed after the last used block.
    pub fn allocate(&mut self, length: u64, reserved_low: u64, reserved_high: i64) -> u64 {
        let blocks = block_count(length);
        let start = self.find(blocks, reserved_low, reserved_high);
        self.set_range(start, start + blocks);
        start * BLOCK_SIZE
    }

    /// Block that `allocate` would return, without marking anything
    pub fn predict_allocation(&self, blocks: u64, reserved_low: u64, reserved_high: i64) -> u64 {
        self.find(blocks, reserved_low, reserved_high)
    }

    fn find(&self, blocks: u64, low: u64, high: i64) -> u64 {
        let mut i = 0;
        loop {
            let mut start = self.next_clear(i);
            let end = self.next_set(start + 1);
            let fits = match end {
                None => true,
                Some(end) => end - start >= blocks,
            };
            if fits {
                let overlaps = (high < 0 || (start as i64) < high) && start + blocks > low;
                if overlaps {
                    if high < 0 {
                        start = self.after_last_block();
                    } else {
                        i = high as u64;
                        continue;
                    }
                }
                return start;
            }
            // `fits` is always true when `end` is None
            i = end.unwrap_or(start);
        }
    }

    /// Mark `length` bytes at byte position `pos` as used
    pub fn mark_used(&mut self, pos: u64, length: u64) -> Result<()> {
        let start = pos / BLOCK_SIZE;
        let blocks = block_count(length);
        if let Some(used) = self.next_set(start) {
            if used < start + blocks {
                return Err(AtlasError::internal(format!(
                    "double mark: block {} already used while marking {}+{}",
                    used, start, blocks
                )));
            }
        }
        self.set_range(start, start + blocks);
        Ok(())
    }

    /// Release `length` bytes at byte position `pos`
    pub fn free(&mut self, pos: u64, length: u64) {
        let start = pos / BLOCK_SIZE;
        self.clear_range(start, start + block_count(length));
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn is_used(&self, pos: u64) -> bool {
        self.get(pos / BLOCK_SIZE)
    }

    /// Whether all blocks of the byte range are free
    pub fn is_fully_free(&self, pos: u64, length: u64) -> bool {
        let start = pos / BLOCK_SIZE;
        match self.next_set(start) {
            Some(used) => used >= start + block_count(length),
            None => true,
        }
    }

    /// Byte position of the first free block
    pub fn first_free(&self) -> u64 {
        self.next_clear(0) * BLOCK_SIZE
    }

    /// Block number just past the last used block
    pub fn after_last_block(&self) -> u64 {
        match self.words.last() {
            Some(&w) => (self.words.len() as u64 - 1) * 64 + (64 - w.leading_zeros() as u64),
            None => 0,
        }
    }

    /// Bytes between the file start and the end of the last used block
    pub fn last_byte(&self) -> u64 {
        self.after_last_block() * BLOCK_SIZE
    }

    pub fn used_bytes(&self) -> u64 {
        self.cardinality() * BLOCK_SIZE
    }

    /// Free blocks below the last used block
    pub fn free_block_count(&self) -> u64 {
        self.after_last_block() - self.cardinality()
    }

    /// Percentage of used blocks in `[FIRST_FREE_BLOCK, after_last_block)`
    pub fn fill_rate(&self) -> u32 {
        self.projected_fill_rate(0)
    }

    /// Fill rate after `vacated_blocks` blocks have been released
    pub fn projected_fill_rate(&self, vacated_blocks: i64) -> u32 {
        let total = self.after_last_block() as i64 - FIRST_FREE_BLOCK as i64;
        let used = self.cardinality() as i64 - FIRST_FREE_BLOCK as i64 - vacated_blocks;
        if used <= 0 || total <= 0 {
            return 0;
        }
        ((100 * used + total - 1) / total).min(100) as u32
    }

    /// Move cost score of the chunk starting at `block`, lower moves first
    ///
    /// Short occupied spans surrounded by long free spans score lowest.
    pub fn move_priority(&self, block: u64) -> u64 {
        let (prev_end, mut free_size) = match block.checked_sub(1).and_then(|b| self.previous_clear(b)) {
            Some(prev_end) => {
                let prev_used = self.previous_set(prev_end).unwrap_or(0);
                (prev_end, prev_end - prev_used)
            }
            None => (FIRST_FREE_BLOCK - 1, 0),
        };
        let next_start = self.next_clear(block);
        if let Some(next_end) = self.next_set(next_start) {
            free_size += next_end - next_start;
        }
        next_start.saturating_sub(prev_end + 1) * 1000 / (free_size + 1)
    }
}

/// Number of blocks needed for `length` bytes
pub(crate) fn block_count(length: u64) -> u64 {
    (length + BLOCK_SIZE - 1) / BLOCK_SIZE
}
