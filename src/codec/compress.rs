//! Page payload compression

use crate::error::{AtlasError, Result};

/// Byte-block compressor used for page payloads
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Reverse `compress`; the result must be exactly `expected_len` bytes
    fn expand(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>>;
}

/// zstd at a fixed level
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    pub level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(data, self.level)
            .map_err(|e| AtlasError::internal(format!("compression failed: {}", e)))
    }

    fn expand(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = zstd::decode_all(data)
            .map_err(|e| AtlasError::corrupt(format!("decompression failed: {}", e)))?;
        if out.len() != expected_len {
            return Err(AtlasError::corrupt(format!(
                "expanded to {} bytes, expected {}",
                out.len(),
                expected_len
            )));
        }
        Ok(out)
    }
}

/// Pass-through
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn expand(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        if data.len() != expected_len {
            return Err(AtlasError::corrupt("uncompressed payload length mismatch"));
        }
        Ok(data.to_vec())
    }
}

/// Compressor for a configured level (0 disables)
pub fn for_level(level: i32) -> Box<dyn Compressor> {
    if level > 0 {
        Box::new(ZstdCompressor::new(level))
    } else {
        Box::new(NoCompression)
    }
}
