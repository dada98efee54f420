//! Error types for the stratacache engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Shared Tier Errors
    // =========================================================================
    /// Shared store command failed
    #[error("shared store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Broadcast channel subscription failed
    #[error("subscribe to channel {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },

    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// Value could not be serialized to the interchange format
    #[error("serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Stored bytes could not be deserialized
    #[error("deserialization failed: {0}")]
    Deserialize(#[source] serde_json::Error),

    /// Stored payload is too short to carry a marker byte
    #[error("truncated payload")]
    Truncated,

    /// Decompression failed
    #[error("decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Stored payload starts with a marker byte this build does not know
    #[error("unknown payload marker {marker:#04x}")]
    UnknownMarker { marker: u8 },

    // =========================================================================
    // Stampede Control Errors
    // =========================================================================
    /// Waiting caller exceeded the configured wait window; retriable
    #[error("timed out after {waited:?} waiting for computation of key {key}")]
    StampedeTimeout { key: String, waited: Duration },

    /// Caller-supplied compute function failed; nothing was cached
    #[error("compute failed for key {key}: {source}")]
    Compute {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}
