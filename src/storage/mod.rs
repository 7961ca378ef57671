//! Storage Module
//!
//! Everything between the page layer and the raw file.
//!
//! ## Responsibilities
//! - Positional reads and writes on a locked file (or memory)
//! - Block allocation with reserved ranges
//! - Chunk headers, footers, ToC and liveness bookkeeping
//!
//! ## File Format
//! ```text
//! ┌─────────────────┬─────────────────┬─────────┬─────────┬───────┬─────────┐
//! │ Store header    │ Store header    │ Chunk 1 │ Chunk 2 │ free  │ Chunk n │
//! │ (block 0)       │ copy (block 1)  │         │         │ space │ ...     │
//! └─────────────────┴─────────────────┴─────────┴─────────┴───────┴─────────┘
//! ```
//! Everything is measured in [`BLOCK_SIZE`] blocks. Chunks are written wherever
//! the free-space bitmap finds room and are linked only by their ids and the
//! `next` block prediction.

pub mod chunk;
pub mod file_store;
pub mod free_space;

pub use chunk::{Chunk, ChunkFooter};
pub use file_store::{BlockFile, DiskFile, FileStore, MemoryFile};
pub use free_space::FreeSpaceBitSet;

/// Physical block size
pub const BLOCK_SIZE: u64 = 4096;
