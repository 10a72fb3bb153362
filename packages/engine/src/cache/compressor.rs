// packages/engine/src/cache/compressor.rs
//! zstd compression for cached blobs

use crate::utils::errors::{EngineError, Result};
use tracing::trace;

/// Compression levels
#[derive(Debug, Clone, Copy, Default)]
pub enum CompressionLevel {
    /// Fast compression (level 1)
    #[default]
    Fast,

    /// Balanced (level 3)
    Balanced,

    /// Best compression (level 19)
    Best,
}

impl CompressionLevel {
    pub fn as_i32(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
        }
    }
}

/// Compressor using zstd
#[derive(Debug, Clone, Copy, Default)]
pub struct Compressor {
    level: CompressionLevel,
}

impl Compressor {
    pub fn new(level: CompressionLevel) -> Self {
        Self { level }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = zstd::encode_all(data, self.level.as_i32()).map_err(|e| {
            EngineError::CompressionFailed(format!("Compression error: {}", e))
        })?;

        trace!(
            "Compressed {} bytes -> {} bytes at level {}",
            data.len(),
            compressed.len(),
            self.level.as_i32()
        );
        Ok(compressed)
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| {
            EngineError::CompressionFailed(format!("Decompression error: {}", e))
        })
    }
}
