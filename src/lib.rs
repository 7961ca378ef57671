//! # AtlasMV
//!
//! An embedded multi-version key-value store with:
//! - Copy-on-write B-tree maps with lock-free readers
//! - Snapshot reads of any retained version
//! - Chunked, append-mostly file storage with free-space reuse
//! - Background commit, compaction and chunk moves
//! - Crash recovery from torn or partial writes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     MvMap<K, V> handles                      │
//! │           (put / get / cursor / open_version)                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ CAS on the root reference
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                    Copy-on-write pages                       │
//! │            (leaves: keys + values, nodes: children)          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ commit
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  Serializer │          │ Page caches │
//!   │  (chunks)   │          │ (leaf/node) │
//!   └──────┬──────┘          └──────▲──────┘
//!          │                        │
//!          ▼                        │
//!   ┌──────────────────────────────┴──┐
//!   │      FileStore (4 KiB blocks)    │
//!   └──────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use atlasmv::{Config, MvStore, StringType};
//!
//! # fn main() -> atlasmv::Result<()> {
//! let store = MvStore::open(Config::builder().file_path("data.mv").build())?;
//! let map = store.open_map::<StringType, StringType>("users")?;
//! map.put("alice".into(), "admin".into())?;
//! store.commit()?;
//! store.close()?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod codec;
pub mod types;
pub mod page;
pub mod cursor;
pub mod map;
pub mod storage;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, ErrorCode, Result};
pub use config::{Config, ConfigBuilder};
pub use cursor::Cursor;
pub use map::{Decision, DecisionMaker, MvMap, RootReference};
pub use store::{MapMetadata, MvStore, StoreHeader, StoreState, VersionUsage};
pub use types::{BytesType, DataType, KeyType, LongType, SerdeType, StringType};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasMV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
