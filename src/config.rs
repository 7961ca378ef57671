//! Configuration for AtlasMV
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::AtlasError;

/// Main configuration for an AtlasMV store
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // File Configuration
    // -------------------------------------------------------------------------
    /// Location of the store file. `None` keeps the whole store in memory.
    pub file_path: Option<PathBuf>,

    /// Open the file read-only (shared lock, no writes)
    pub read_only: bool,

    /// Recover with a full file scan on open and tolerate unreadable pages
    /// by substituting empty leaves
    pub recovery_mode: bool,

    // -------------------------------------------------------------------------
    // Page Configuration
    // -------------------------------------------------------------------------
    /// Maximum number of keys per page before it is split
    pub keys_per_page: usize,

    /// Memory estimate (bytes) above which a page is split.
    /// Capped by the page cache sizes.
    pub page_split_size: usize,

    /// 0 disables compression, 1 is fast, higher levels compress harder
    pub compression_level: i32,

    // -------------------------------------------------------------------------
    // Commit Configuration
    // -------------------------------------------------------------------------
    /// Unsaved page memory (bytes) that triggers a background commit.
    /// 0 disables backpressure.
    pub auto_commit_buffer_size: usize,

    /// Delay between background auto-saves (milliseconds).
    /// 0 disables the background writer and serializer threads.
    pub auto_commit_delay_ms: u64,

    /// File fill rate (percent) at which background compaction kicks in
    pub auto_compact_fill_rate: u32,

    // -------------------------------------------------------------------------
    // Retention Configuration
    // -------------------------------------------------------------------------
    /// Number of old versions to keep in addition to the ones in use
    pub versions_to_keep: u64,

    /// Minimum age of a dead chunk before its space is reused (milliseconds).
    /// Negative values disable the age check.
    pub retention_time_ms: i64,

    /// Reuse free space in the file (otherwise always append)
    pub reuse_space: bool,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Leaf page cache size in MB
    pub leaf_cache_size_mb: usize,

    /// Non-leaf page cache size in MB
    pub non_leaf_cache_size_mb: usize,

    // -------------------------------------------------------------------------
    // Error Reporting
    // -------------------------------------------------------------------------
    /// Observer for errors raised on background threads
    pub background_error_handler: Option<ErrorHandler>,
}

/// Callback that observes background errors
#[derive(Clone)]
pub struct ErrorHandler(pub Arc<dyn Fn(&AtlasError) + Send + Sync>);

impl ErrorHandler {
    pub fn new(handler: impl Fn(&AtlasError) + Send + Sync + 'static) -> Self {
        ErrorHandler(Arc::new(handler))
    }

    pub(crate) fn notify(&self, err: &AtlasError) {
        (self.0)(err)
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorHandler(..)")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file_path: None,
            read_only: false,
            recovery_mode: false,
            keys_per_page: 129,
            page_split_size: usize::MAX,
            compression_level: 1,
            auto_commit_buffer_size: 2 * 1024 * 1024, // 2 MB
            auto_commit_delay_ms: 1000,
            auto_compact_fill_rate: 90,
            versions_to_keep: 0,
            retention_time_ms: 45_000,
            reuse_space: true,
            leaf_cache_size_mb: 8,
            non_leaf_cache_size_mb: 16,
            background_error_handler: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Split threshold for leaf pages, capped so a page always fits the cache
    pub(crate) fn leaf_split_size(&self) -> usize {
        self.page_split_size
            .min(self.leaf_cache_size_mb.saturating_mul(1024 * 1024).max(1))
    }

    /// Split threshold for non-leaf pages
    pub(crate) fn non_leaf_split_size(&self) -> usize {
        self.page_split_size
            .min(self.non_leaf_cache_size_mb.saturating_mul(1024 * 1024).max(1))
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Store the data in this file
    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.file_path = Some(path.into());
        self
    }

    /// Open the store read-only
    pub fn read_only(mut self) -> Self {
        self.config.read_only = true;
        self
    }

    /// Open in recovery mode
    pub fn recovery_mode(mut self) -> Self {
        self.config.recovery_mode = true;
        self
    }

    /// Set the maximum number of keys per page
    pub fn keys_per_page(mut self, count: usize) -> Self {
        self.config.keys_per_page = count.max(4);
        self
    }

    /// Set the page split size (in bytes)
    pub fn page_split_size(mut self, size: usize) -> Self {
        self.config.page_split_size = size;
        self
    }

    /// Enable fast compression
    pub fn compress(mut self) -> Self {
        self.config.compression_level = 1;
        self
    }

    /// Set the compression level (0 disables)
    pub fn compression_level(mut self, level: i32) -> Self {
        self.config.compression_level = level.max(0);
        self
    }

    /// Set the unsaved memory threshold (in bytes)
    pub fn auto_commit_buffer_size(mut self, size: usize) -> Self {
        self.config.auto_commit_buffer_size = size;
        self
    }

    /// Set the auto-commit delay (in milliseconds)
    pub fn auto_commit_delay_ms(mut self, ms: u64) -> Self {
        self.config.auto_commit_delay_ms = ms;
        self
    }

    /// Disable background commits and backpressure
    pub fn auto_commit_disabled(mut self) -> Self {
        self.config.auto_commit_delay_ms = 0;
        self.config.auto_commit_buffer_size = 0;
        self
    }

    /// Set the auto-compaction fill rate (percent)
    pub fn auto_compact_fill_rate(mut self, percent: u32) -> Self {
        self.config.auto_compact_fill_rate = percent.min(100);
        self
    }

    /// Set the number of versions to keep
    pub fn versions_to_keep(mut self, count: u64) -> Self {
        self.config.versions_to_keep = count;
        self
    }

    /// Set the retention time (in milliseconds)
    pub fn retention_time_ms(mut self, ms: i64) -> Self {
        self.config.retention_time_ms = ms;
        self
    }

    /// Enable or disable reuse of free space
    pub fn reuse_space(mut self, reuse: bool) -> Self {
        self.config.reuse_space = reuse;
        self
    }

    /// Set the leaf page cache size (in MB)
    pub fn leaf_cache_size_mb(mut self, mb: usize) -> Self {
        self.config.leaf_cache_size_mb = mb;
        self
    }

    /// Set the non-leaf page cache size (in MB)
    pub fn non_leaf_cache_size_mb(mut self, mb: usize) -> Self {
        self.config.non_leaf_cache_size_mb = mb;
        self
    }

    /// Observe errors raised on background threads
    pub fn background_error_handler(
        mut self,
        handler: impl Fn(&AtlasError) + Send + Sync + 'static,
    ) -> Self {
        self.config.background_error_handler = Some(ErrorHandler::new(handler));
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
