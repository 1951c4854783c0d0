//! Error types for Stratacache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
///
/// Misses are never errors. Backend variants are produced by the L3 tier and
/// absorbed by the facade, which degrades to L1/L2 instead of failing callers.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Setup Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown tier name
    #[error("Invalid tier name: {0} (expected l1, l2, l3 or auto)")]
    InvalidTier(String),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Malformed invalidation query
    #[error("Invalid invalidation query: {0}")]
    InvalidationQuery(String),

    /// Value could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Backing Store Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing store unreachable or failing
    #[error("Backing store {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// Backing store call exceeded its deadline
    #[error("Backing store {backend} timed out after {timeout_ms}ms")]
    BackendTimeout { backend: String, timeout_ms: u64 },

    /// Stored entry could not be decoded
    #[error("Corrupt cache entry: {0}")]
    CorruptEntry(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::BackendTimeout {
            backend: "disk".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "Backing store disk timed out after 250ms");

        let err = Error::InvalidTier("l4".into());
        assert!(err.to_string().contains("l4"));
    }
}
