//! Payload Codec
//!
//! Turns in-memory values into storable payloads and back. Values are
//! serialized to JSON interchange bytes; payloads above a size threshold
//! (or when compression is forced) are LZ4-compressed. Every sealed payload
//! starts with a one-byte marker so the decoder picks the inverse path
//! without external metadata.
//!
//! # Example
//!
//! ```
//! use stratacache::codec::{CodecConfig, PayloadCodec};
//!
//! let codec = PayloadCodec::new(CodecConfig::default());
//!
//! let plain = codec.serialize(&"hello").unwrap();
//! let sealed = codec.seal(&plain, false);
//! let value: String = codec.deserialize(&codec.open(&sealed).unwrap()).unwrap();
//! assert_eq!(value, "hello");
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Marker byte for an uncompressed payload
pub const MARKER_PLAIN: u8 = 0x00;

/// Marker byte for an LZ4-compressed payload (size-prepended block format)
pub const MARKER_LZ4: u8 = 0x01;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the payload codec
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Minimum interchange size to compress (smaller payloads stay plain)
    pub compress_threshold: usize,
    /// LZ4 compression level
    pub level: i32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compress_threshold: 1024,
            level: 4,
        }
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Serialization + compression codec for cached values
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    config: CodecConfig,
}

impl PayloadCodec {
    /// Create a codec with the given configuration
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Pure size predicate: would a payload of this size be compressed?
    #[inline]
    pub fn should_compress(payload: &[u8], threshold: usize) -> bool {
        payload.len() >= threshold
    }

    /// Serialize a value to interchange bytes
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(Error::Serialize)
    }

    /// Deserialize a value from interchange bytes
    pub fn deserialize<T: DeserializeOwned>(&self, plain: &[u8]) -> Result<T> {
        serde_json::from_slice(plain).map_err(Error::Deserialize)
    }

    /// Wrap interchange bytes into a marker-prefixed storable payload,
    /// compressing above the configured threshold or when forced.
    ///
    /// Compression failure and compression that does not shrink the payload
    /// both fall back to the plain form, so sealing is total.
    pub fn seal(&self, plain: &[u8], force_compress: bool) -> Bytes {
        let compress =
            force_compress || Self::should_compress(plain, self.config.compress_threshold);

        if compress {
            match lz4::block::compress(
                plain,
                Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.config.level)),
                true,
            ) {
                Ok(compressed) if force_compress || compressed.len() < plain.len() => {
                    let mut sealed = Vec::with_capacity(compressed.len() + 1);
                    sealed.push(MARKER_LZ4);
                    sealed.extend_from_slice(&compressed);
                    return Bytes::from(sealed);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "lz4 compression failed, storing plain");
                }
            }
        }

        let mut sealed = Vec::with_capacity(plain.len() + 1);
        sealed.push(MARKER_PLAIN);
        sealed.extend_from_slice(plain);
        Bytes::from(sealed)
    }

    /// Unwrap a storable payload back into interchange bytes.
    ///
    /// Malformed input (empty, unknown marker, truncated block) is an error;
    /// the coordinator treats it as a tier miss, never a crash.
    pub fn open(&self, sealed: &[u8]) -> Result<Bytes> {
        let (&marker, body) = sealed.split_first().ok_or(Error::Truncated)?;

        match marker {
            MARKER_PLAIN => Ok(Bytes::copy_from_slice(body)),
            MARKER_LZ4 => lz4::block::decompress(body, None)
                .map(Bytes::from)
                .map_err(|e| Error::DecompressionFailed {
                    algorithm: "lz4".into(),
                    reason: e.to_string(),
                }),
            other => Err(Error::UnknownMarker { marker: other }),
        }
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Report {
        id: u64,
        title: String,
        rows: Vec<u32>,
    }

    fn make_codec() -> PayloadCodec {
        PayloadCodec::default()
    }

    #[test]
    fn test_plain_round_trip() {
        let codec = make_codec();
        let report = Report {
            id: 7,
            title: "weekly".into(),
            rows: vec![1, 2, 3],
        };

        let plain = codec.serialize(&report).unwrap();
        let sealed = codec.seal(&plain, false);
        assert_eq!(sealed[0], MARKER_PLAIN);

        let opened = codec.open(&sealed).unwrap();
        let back: Report = codec.deserialize(&opened).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_large_payload_compressed_round_trip() {
        let codec = make_codec();
        let value = "abc123".repeat(1000);

        let plain = codec.serialize(&value).unwrap();
        assert!(plain.len() > 5000);

        let sealed = codec.seal(&plain, false);
        assert_eq!(sealed[0], MARKER_LZ4);
        assert!(sealed.len() < plain.len());

        let back: String = codec.deserialize(&codec.open(&sealed).unwrap()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_should_compress_threshold() {
        let large = "x".repeat(5000);
        let small = "0123456789";

        assert!(PayloadCodec::should_compress(large.as_bytes(), 1024));
        assert!(!PayloadCodec::should_compress(small.as_bytes(), 1024));
    }

    #[test]
    fn test_forced_compression_on_small_payload() {
        let codec = make_codec();
        let plain = codec.serialize(&"tiny").unwrap();

        let sealed = codec.seal(&plain, true);
        assert_eq!(sealed[0], MARKER_LZ4);

        let back: String = codec.deserialize(&codec.open(&sealed).unwrap()).unwrap();
        assert_eq!(back, "tiny");
    }

    #[test]
    fn test_incompressible_payload_stays_plain() {
        let codec = make_codec();
        // Pseudo-random bytes rendered as a JSON string; LZ4 cannot shrink it
        let noise: String = (0..3000u32)
            .map(|i| char::from(b'!' + ((i * 31 + 7) % 90) as u8))
            .collect();

        let plain = codec.serialize(&noise).unwrap();
        let sealed = codec.seal(&plain, false);

        if sealed[0] == MARKER_PLAIN {
            assert_eq!(&sealed[1..], plain.as_ref());
        }
        let back: String = codec.deserialize(&codec.open(&sealed).unwrap()).unwrap();
        assert_eq!(back, noise);
    }

    #[test]
    fn test_open_empty_payload_fails() {
        let codec = make_codec();
        assert_matches!(codec.open(&[]), Err(Error::Truncated));
    }

    #[test]
    fn test_open_unknown_marker_fails() {
        let codec = make_codec();
        assert_matches!(
            codec.open(&[0x7f, 1, 2, 3]),
            Err(Error::UnknownMarker { marker: 0x7f })
        );
    }

    #[test]
    fn test_open_corrupted_block_fails() {
        let codec = make_codec();
        let sealed = [MARKER_LZ4, 0xff, 0xff, 0xff, 0xff, 0x00];
        assert_matches!(codec.open(&sealed), Err(Error::DecompressionFailed { .. }));
    }

    #[test]
    fn test_deserialize_garbage_fails() {
        let codec = make_codec();
        let result: Result<Report> = codec.deserialize(b"not json at all");
        assert_matches!(result, Err(Error::Deserialize(_)));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn seal_open_round_trips(value in ".{0,400}", force in proptest::bool::ANY) {
                let codec = make_codec();
                let plain = codec.serialize(&value).unwrap();
                let sealed = codec.seal(&plain, force);
                let opened = codec.open(&sealed).unwrap();
                prop_assert_eq!(&opened[..], &plain[..]);
                let back: String = codec.deserialize(&opened).unwrap();
                prop_assert_eq!(back, value);
            }
        }
    }
}
