//! Adaptive Response Compression
//!
//! Picks a content encoding from payload size and client capability.
//!
//! # Selection
//!
//! ```text
//! size < small_threshold          → none (ratio 1)
//! already-compressed content type → none
//! size > large_threshold and br   → br
//! gzip accepted                   → gzip
//! deflate accepted                → deflate
//! otherwise                       → none
//! ```
//!
//! An encoder whose output is not smaller than its input falls back to `none`.
//!
//! # Example
//!
//! ```
//! use optlayer::compression::{AdaptiveCompressor, CompressionConfig, Encoding};
//!
//! let compressor = AdaptiveCompressor::new(CompressionConfig::default());
//! let rows: Vec<_> = (0..500).map(|i| serde_json::json!({"id": i, "name": "row"})).collect();
//!
//! let response = compressor
//!     .compress_response(&rows, Some("gzip, deflate"), Some("application/json"))
//!     .unwrap();
//! assert_eq!(response.encoding, Encoding::Gzip);
//! assert!(response.compression_ratio > 1.0);
//! ```

mod accept;
mod codec;

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use accept::AcceptEncoding;
pub use codec::{BrotliCodec, Codec, DeflateCodec, Encoding, GzipCodec, IdentityCodec};

use crate::error::{Error, Result};

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for response compression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Payloads smaller than this are sent uncompressed
    pub small_threshold: usize,
    /// Payloads larger than this prefer brotli
    pub large_threshold: usize,
    /// gzip/deflate level (0-9)
    pub level: u32,
    /// Brotli quality (0-11)
    pub brotli_quality: u32,
    /// Brotli window size, log2 (10-24)
    pub brotli_lgwin: u32,
    /// Send uncompressed when an encoder fails instead of erroring
    pub fallback_on_failure: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            small_threshold: 1024,  // 1KB
            large_threshold: 10240, // 10KB
            level: 6,
            brotli_quality: 5,
            brotli_lgwin: 22,
            fallback_on_failure: true,
        }
    }
}

impl CompressionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.small_threshold > self.large_threshold {
            return Err(Error::Config(
                "compression.small_threshold must not exceed compression.large_threshold".into(),
            ));
        }
        if self.level > 9 {
            return Err(Error::Config("compression.level must be within 0-9".into()));
        }
        if self.brotli_quality > 11 {
            return Err(Error::Config(
                "compression.brotli_quality must be within 0-11".into(),
            ));
        }
        if !(10..=24).contains(&self.brotli_lgwin) {
            return Err(Error::Config(
                "compression.brotli_lgwin must be within 10-24".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Results
// =============================================================================

/// An encoded response body
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedResponse {
    pub encoding: Encoding,
    pub compressed: Bytes,
    pub original_size: usize,
    pub compressed_size: usize,
    /// original / compressed; 1.0 when not encoded
    pub compression_ratio: f64,
}

impl CompressedResponse {
    fn identity(payload: Bytes) -> Self {
        let size = payload.len();
        Self {
            encoding: Encoding::None,
            compressed: payload,
            original_size: size,
            compressed_size: size,
            compression_ratio: 1.0,
        }
    }

    /// Bytes saved by encoding
    pub fn bytes_saved(&self) -> usize {
        self.original_size.saturating_sub(self.compressed_size)
    }
}

/// Running compression totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub responses: u64,
    pub compressed_responses: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub gzip: u64,
    pub deflate: u64,
    pub br: u64,
    /// Encoder output was not smaller than the input
    pub not_beneficial: u64,
    pub failures: u64,
}

impl CompressionStats {
    /// bytes_in / bytes_out over every response
    pub fn overall_ratio(&self) -> f64 {
        if self.bytes_out == 0 {
            1.0
        } else {
            self.bytes_in as f64 / self.bytes_out as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    responses: AtomicU64,
    compressed_responses: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    gzip: AtomicU64,
    deflate: AtomicU64,
    br: AtomicU64,
    not_beneficial: AtomicU64,
    failures: AtomicU64,
}

// =============================================================================
// Adaptive Compressor
// =============================================================================

/// Chooses and applies a response encoding
pub struct AdaptiveCompressor {
    config: CompressionConfig,
    gzip: GzipCodec,
    deflate: DeflateCodec,
    br: BrotliCodec,
    counters: Counters,
}

impl AdaptiveCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            gzip: GzipCodec::new(config.level),
            deflate: DeflateCodec::new(config.level),
            br: BrotliCodec::new(config.brotli_quality, config.brotli_lgwin),
            config,
            counters: Counters::default(),
        }
    }

    fn codec(&self, encoding: Encoding) -> &dyn Codec {
        match encoding {
            Encoding::None => &IdentityCodec,
            Encoding::Gzip => &self.gzip,
            Encoding::Deflate => &self.deflate,
            Encoding::Br => &self.br,
        }
    }

    /// Encoding the selection rules pick for a payload of `size` bytes
    pub fn select_encoding(
        &self,
        size: usize,
        accept_encoding: Option<&str>,
        content_type: Option<&str>,
    ) -> Encoding {
        if size < self.config.small_threshold {
            return Encoding::None;
        }
        if content_type.is_some_and(is_precompressed) {
            return Encoding::None;
        }
        let Some(header) = accept_encoding else {
            return Encoding::None;
        };

        let accept = AcceptEncoding::parse(header);
        if size > self.config.large_threshold && accept.accepts(Encoding::Br) {
            Encoding::Br
        } else if accept.accepts(Encoding::Gzip) {
            Encoding::Gzip
        } else if accept.accepts(Encoding::Deflate) {
            Encoding::Deflate
        } else {
            Encoding::None
        }
    }

    /// Serialize `data` to JSON and encode it for the client
    pub fn compress_response<T: Serialize + ?Sized>(
        &self,
        data: &T,
        accept_encoding: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<CompressedResponse> {
        let payload = Bytes::from(serde_json::to_vec(data)?);
        self.compress_bytes(payload, accept_encoding, content_type)
    }

    /// Encode an already serialized payload
    pub fn compress_bytes(
        &self,
        payload: Bytes,
        accept_encoding: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<CompressedResponse> {
        let original_size = payload.len();
        let encoding = self.select_encoding(original_size, accept_encoding, content_type);

        let response = match encoding {
            Encoding::None => CompressedResponse::identity(payload),
            encoding => match self.codec(encoding).encode(&payload) {
                Ok(encoded) if encoded.len() < original_size => {
                    let compressed_size = encoded.len();
                    CompressedResponse {
                        encoding,
                        compressed: Bytes::from(encoded),
                        original_size,
                        compressed_size,
                        compression_ratio: original_size as f64 / compressed_size as f64,
                    }
                }
                Ok(encoded) => {
                    self.counters.not_beneficial.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        %encoding,
                        original_size,
                        encoded_size = encoded.len(),
                        "Encoding did not shrink payload, sending uncompressed"
                    );
                    CompressedResponse::identity(payload)
                }
                Err(e) if self.config.fallback_on_failure => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%encoding, error = %e, "Compression failed, sending uncompressed");
                    CompressedResponse::identity(payload)
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            },
        };

        self.record(&response);
        Ok(response)
    }

    /// Invert an encoding
    pub fn decompress(&self, data: &[u8], encoding: Encoding) -> Result<Bytes> {
        self.codec(encoding).decode(data).map(Bytes::from)
    }

    fn record(&self, response: &CompressedResponse) {
        let c = &self.counters;
        c.responses.fetch_add(1, Ordering::Relaxed);
        c.bytes_in
            .fetch_add(response.original_size as u64, Ordering::Relaxed);
        c.bytes_out
            .fetch_add(response.compressed_size as u64, Ordering::Relaxed);

        let per_encoding = match response.encoding {
            Encoding::None => return,
            Encoding::Gzip => &c.gzip,
            Encoding::Deflate => &c.deflate,
            Encoding::Br => &c.br,
        };
        per_encoding.fetch_add(1, Ordering::Relaxed);
        c.compressed_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Encode and decode a probe payload with every codec, outside the stats
    pub fn self_test(&self) -> Result<()> {
        let probe = br#"{"probe":"optlayer","items":[1,2,3,4,5,6,7,8]}"#.repeat(16);
        for encoding in [Encoding::Gzip, Encoding::Deflate, Encoding::Br] {
            let codec = self.codec(encoding);
            let decoded = codec.decode(&codec.encode(&probe)?)?;
            if decoded != probe {
                return Err(Error::CompressionFailed {
                    algorithm: encoding.name().to_string(),
                    reason: "probe payload did not survive a round trip".into(),
                });
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> CompressionStats {
        let c = &self.counters;
        CompressionStats {
            responses: c.responses.load(Ordering::Relaxed),
            compressed_responses: c.compressed_responses.load(Ordering::Relaxed),
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            gzip: c.gzip.load(Ordering::Relaxed),
            deflate: c.deflate.load(Ordering::Relaxed),
            br: c.br.load(Ordering::Relaxed),
            not_beneficial: c.not_beneficial.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for AdaptiveCompressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

/// Media types whose bodies are already compressed
fn is_precompressed(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match mime.split_once('/') {
        Some(("image", subtype)) => subtype != "svg+xml",
        Some(("video", _)) | Some(("audio", _)) => true,
        Some(("font", subtype)) => matches!(subtype, "woff" | "woff2"),
        Some(("application", subtype)) => matches!(
            subtype,
            "zip"
                | "gzip"
                | "x-gzip"
                | "x-brotli"
                | "x-bzip2"
                | "x-xz"
                | "x-7z-compressed"
                | "x-rar-compressed"
                | "zstd"
        ),
        _ => false,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compressor() -> AdaptiveCompressor {
        AdaptiveCompressor::default()
    }

    /// JSON array serializing to roughly `approx_bytes`
    fn rows(approx_bytes: usize) -> serde_json::Value {
        let row = json!({"id": 12345, "name": "weekend trip", "status": "planned"});
        let row_len = row.to_string().len() + 1;
        json!(vec![row; approx_bytes / row_len + 1])
    }

    #[test]
    fn test_small_payload_is_not_compressed() {
        let response = compressor()
            .compress_response(&json!({"ok": true}), Some("br, gzip"), None)
            .unwrap();
        assert_eq!(response.encoding, Encoding::None);
        assert_eq!(response.compression_ratio, 1.0);
        assert_eq!(response.original_size, response.compressed_size);
    }

    #[test]
    fn test_large_payload_prefers_brotli() {
        let response = compressor()
            .compress_response(&rows(20_000), Some("br, gzip"), None)
            .unwrap();
        assert_eq!(response.encoding, Encoding::Br);
        assert!(response.compression_ratio > 1.0);
        assert_eq!(
            response.bytes_saved(),
            response.original_size - response.compressed_size
        );
    }

    #[test]
    fn test_large_payload_without_brotli_uses_gzip() {
        let response = compressor()
            .compress_response(&rows(20_000), Some("gzip, deflate"), None)
            .unwrap();
        assert_eq!(response.encoding, Encoding::Gzip);
    }

    #[test]
    fn test_medium_payload_uses_gzip_even_with_brotli() {
        let response = compressor()
            .compress_response(&rows(4_000), Some("br, gzip"), None)
            .unwrap();
        assert_eq!(response.encoding, Encoding::Gzip);
    }

    #[test]
    fn test_deflate_only_client() {
        let response = compressor()
            .compress_response(&rows(4_000), Some("deflate"), None)
            .unwrap();
        assert_eq!(response.encoding, Encoding::Deflate);
    }

    #[test]
    fn test_refused_encoding_is_skipped() {
        let response = compressor()
            .compress_response(&rows(20_000), Some("br;q=0, gzip;q=0, deflate"), None)
            .unwrap();
        assert_eq!(response.encoding, Encoding::Deflate);
    }

    #[test]
    fn test_missing_header_means_identity() {
        let response = compressor().compress_response(&rows(20_000), None, None).unwrap();
        assert_eq!(response.encoding, Encoding::None);
    }

    #[test]
    fn test_precompressed_content_type_is_skipped() {
        let c = compressor();
        let payload = Bytes::from(vec![b'a'; 50_000]);
        let response = c
            .compress_bytes(payload.clone(), Some("gzip"), Some("image/png"))
            .unwrap();
        assert_eq!(response.encoding, Encoding::None);

        let response = c
            .compress_bytes(payload, Some("gzip"), Some("image/svg+xml; charset=utf-8"))
            .unwrap();
        assert_eq!(response.encoding, Encoding::Gzip);
    }

    #[test]
    fn test_incompressible_payload_falls_back() {
        // xorshift noise does not deflate
        let mut state = 0x9E37_79B9_7F4A_7C15_u64;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect();

        let c = compressor();
        let response = c.compress_bytes(Bytes::from(noise), Some("gzip"), None).unwrap();
        assert_eq!(response.encoding, Encoding::None);
        assert_eq!(response.compression_ratio, 1.0);
        assert_eq!(c.stats().not_beneficial, 1);
    }

    #[test]
    fn test_decompress_restores_payload() {
        let c = compressor();
        let data = rows(20_000);
        let response = c.compress_response(&data, Some("br"), None).unwrap();
        let restored = c.decompress(&response.compressed, response.encoding).unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&restored).unwrap(),
            data
        );
    }

    #[test]
    fn test_selection_is_deterministic() {
        let c = compressor();
        let data = rows(12_000);
        let a = c.compress_response(&data, Some("gzip, br"), None).unwrap();
        let b = c.compress_response(&data, Some("gzip, br"), None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stats() {
        let c = compressor();
        c.compress_response(&json!({"ok": true}), Some("gzip"), None)
            .unwrap();
        c.compress_response(&rows(4_000), Some("gzip"), None).unwrap();

        let stats = c.stats();
        assert_eq!(stats.responses, 2);
        assert_eq!(stats.compressed_responses, 1);
        assert_eq!(stats.gzip, 1);
        assert!(stats.overall_ratio() > 1.0);
    }

    #[test]
    fn test_self_test_leaves_stats_untouched() {
        let c = compressor();
        c.self_test().unwrap();
        assert_eq!(c.stats(), CompressionStats::default());
    }

    #[test]
    fn test_config_validation() {
        assert!(CompressionConfig::default().validate().is_ok());
        let inverted = CompressionConfig {
            small_threshold: 20_000,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
        let bad_level = CompressionConfig {
            level: 12,
            ..Default::default()
        };
        assert!(bad_level.validate().is_err());
    }

    #[test]
    fn test_precompressed_detection() {
        assert!(is_precompressed("image/jpeg"));
        assert!(is_precompressed("Video/MP4"));
        assert!(is_precompressed("application/zip"));
        assert!(!is_precompressed("application/json"));
        assert!(!is_precompressed("text/html; charset=utf-8"));
    }
}
