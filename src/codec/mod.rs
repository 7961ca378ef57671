//! Binary Codec Module
//!
//! Low-level encoding helpers shared by pages, chunks and the store header.
//!
//! ## Page Info Layout
//! ```text
//! ┌──────────────────┬────────────────────────┬─────────────┬──────┐
//! │ chunk id (26)    │ offset in chunk (32)   │ len code(5) │ type │
//! │ bits 63..38      │ bits 37..6             │ bits 5..1   │ bit 0│
//! └──────────────────┴────────────────────────┴─────────────┴──────┘
//! ```
//! A ToC entry uses the same layout with the map id in the chunk id field.

pub mod bitpack;
pub mod checksum;
pub mod compress;
pub mod page_info;
pub mod varint;

pub use compress::{Compressor, NoCompression, ZstdCompressor};
