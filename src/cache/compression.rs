//! Value Compression
//!
//! LZ4 block compression with a size prefix. Values at or below the threshold
//! are stored raw, and so are values LZ4 fails to shrink.
//!
//! # Example
//!
//! ```
//! use stratacache::cache::Compressor;
//!
//! let compressor = Compressor::new(16);
//! let data = b"abcabcabcabcabcabcabcabcabcabcabcabcabcabc";
//!
//! let (stored, compressed) = compressor.maybe_compress(data);
//! assert!(compressed);
//!
//! let restored = compressor.decompress(&stored).unwrap();
//! assert_eq!(restored.as_ref(), data);
//! ```

use bytes::Bytes;
use tracing::warn;

use super::DEFAULT_COMPRESSION_THRESHOLD;
use crate::error::{Error, Result};

const ALGORITHM: &str = "lz4";

/// Default LZ4 high-compression level
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 4;

/// Threshold-gated LZ4 compressor
#[derive(Debug, Clone)]
pub struct Compressor {
    /// Values larger than this many bytes are compressed
    threshold: u64,
    /// LZ4 high-compression level
    level: i32,
}

impl Compressor {
    /// Create a compressor with the given threshold in bytes
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Whether a value of this size is a compression candidate
    #[inline]
    pub fn should_compress(&self, size: u64) -> bool {
        size > self.threshold
    }

    /// Compress if worthwhile
    ///
    /// Returns the bytes to store and whether they are compressed. A failed
    /// or non-shrinking compression falls back to the raw bytes.
    pub fn maybe_compress(&self, data: &[u8]) -> (Bytes, bool) {
        if !self.should_compress(data.len() as u64) {
            return (Bytes::copy_from_slice(data), false);
        }

        match self.compress(data) {
            Ok(compressed) if compressed.len() < data.len() => (Bytes::from(compressed), true),
            Ok(_) => (Bytes::copy_from_slice(data), false),
            Err(e) => {
                warn!("Compression failed, storing uncompressed: {}", e);
                (Bytes::copy_from_slice(data), false)
            }
        }
    }

    /// Decompress a stored payload
    pub fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        lz4::block::decompress(data, None)
            .map(Bytes::from)
            .map_err(|e| Error::DecompressionFailed {
                algorithm: ALGORITHM.into(),
                reason: e.to_string(),
            })
    }

    /// Restore a payload, decompressing only if flagged
    pub fn restore(&self, payload: &Bytes, compressed: bool) -> Result<Bytes> {
        if compressed {
            self.decompress(payload)
        } else {
            Ok(payload.clone())
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: ALGORITHM.into(),
            reason: e.to_string(),
        })
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn repetitive(len: usize) -> Vec<u8> {
        b"{\"region\":\"emea\",\"total\":1200}"
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[test]
    fn test_small_values_stored_raw() {
        let compressor = Compressor::default();
        let data = repetitive(1024);
        let (stored, compressed) = compressor.maybe_compress(&data);
        assert!(!compressed);
        assert_eq!(stored.as_ref(), data.as_slice());
    }

    #[test]
    fn test_large_values_compressed() {
        let compressor = Compressor::default();
        let data = repetitive(8 * 1024);
        let (stored, compressed) = compressor.maybe_compress(&data);
        assert!(compressed);
        assert!(stored.len() < data.len());

        let restored = compressor.restore(&stored, true).unwrap();
        assert_eq!(restored.as_ref(), data.as_slice());
    }

    #[test]
    fn test_incompressible_falls_back() {
        let compressor = Compressor::new(64);
        // xorshift noise
        let mut x: u32 = 0x9e37_79b9;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect();

        let (stored, compressed) = compressor.maybe_compress(&noise);
        assert!(!compressed);
        assert_eq!(stored.len(), noise.len());
    }

    #[test]
    fn test_corrupt_payload() {
        let compressor = Compressor::default();
        let result = compressor.decompress(&[0xff, 0xff, 0xff, 0x7f, 1, 2, 3]);
        assert_matches!(result, Err(Error::DecompressionFailed { .. }));
    }

    #[test]
    fn test_restore_uncompressed_is_identity() {
        let compressor = Compressor::default();
        let raw = Bytes::from_static(b"plain");
        assert_eq!(compressor.restore(&raw, false).unwrap(), raw);
    }
}
