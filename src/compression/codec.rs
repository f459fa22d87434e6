//! Content codecs for HTTP response encodings

use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Brotli internal buffer size
const BROTLI_BUFFER: usize = 4096;

/// Response content encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    None,
    Gzip,
    Deflate,
    Br,
}

impl Encoding {
    /// Token as it appears in `Accept-Encoding` / `Content-Encoding`
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::None => "none",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Br => "br",
        }
    }

    /// `Content-Encoding` header value; `None` means send no header
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            Encoding::None => None,
            other => Some(other.name()),
        }
    }

    pub fn all() -> [Encoding; 4] {
        [Encoding::None, Encoding::Gzip, Encoding::Deflate, Encoding::Br]
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Trait for encoding implementations
pub trait Codec: Send + Sync {
    fn encoding(&self) -> Encoding;

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

fn encode_failed(encoding: Encoding, e: impl std::fmt::Display) -> Error {
    Error::CompressionFailed {
        algorithm: encoding.name().to_string(),
        reason: e.to_string(),
    }
}

fn decode_failed(encoding: Encoding, e: impl std::fmt::Display) -> Error {
    Error::DecompressionFailed {
        algorithm: encoding.name().to_string(),
        reason: e.to_string(),
    }
}

/// gzip (RFC 1952)
pub struct GzipCodec {
    level: u32,
}

impl GzipCodec {
    pub fn new(level: u32) -> Self {
        Self { level }
    }
}

impl Codec for GzipCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Gzip
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| encode_failed(Encoding::Gzip, e))?;
        encoder.finish().map_err(|e| encode_failed(Encoding::Gzip, e))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| decode_failed(Encoding::Gzip, e))?;
        Ok(out)
    }
}

/// HTTP `deflate`: zlib-wrapped DEFLATE (RFC 1950)
pub struct DeflateCodec {
    level: u32,
}

impl DeflateCodec {
    pub fn new(level: u32) -> Self {
        Self { level }
    }
}

impl Codec for DeflateCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Deflate
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| encode_failed(Encoding::Deflate, e))?;
        encoder
            .finish()
            .map_err(|e| encode_failed(Encoding::Deflate, e))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| decode_failed(Encoding::Deflate, e))?;
        Ok(out)
    }
}

/// Brotli (RFC 7932)
pub struct BrotliCodec {
    quality: u32,
    lgwin: u32,
}

impl BrotliCodec {
    pub fn new(quality: u32, lgwin: u32) -> Self {
        Self { quality, lgwin }
    }
}

impl Codec for BrotliCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Br
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut writer =
            brotli::CompressorWriter::new(Vec::new(), BROTLI_BUFFER, self.quality, self.lgwin);
        writer
            .write_all(data)
            .map_err(|e| encode_failed(Encoding::Br, e))?;
        // into_inner finishes the stream
        Ok(writer.into_inner())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, BROTLI_BUFFER)
            .read_to_end(&mut out)
            .map_err(|e| decode_failed(Encoding::Br, e))?;
        Ok(out)
    }
}

/// Pass-through
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn encoding(&self) -> Encoding {
        Encoding::None
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        br#"{"id":1,"name":"trip to the coast","tags":["a","b"]}"#.repeat(50)
    }

    #[test]
    fn test_codecs_shrink_repetitive_json() {
        let data = sample();
        let codecs: Vec<Box<dyn Codec>> = vec![
            Box::new(GzipCodec::new(6)),
            Box::new(DeflateCodec::new(6)),
            Box::new(BrotliCodec::new(5, 22)),
        ];
        for codec in codecs {
            let encoded = codec.encode(&data).unwrap();
            assert!(encoded.len() < data.len(), "{} did not shrink", codec.encoding());
            assert_eq!(codec.decode(&encoded).unwrap(), data);
        }
    }

    #[test]
    fn test_gzip_magic_bytes() {
        let encoded = GzipCodec::new(6).encode(&sample()).unwrap();
        assert_eq!(&encoded[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_corrupt_input_is_decode_error() {
        let err = GzipCodec::new(6).decode(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, Error::DecompressionFailed { .. }));
    }

    #[test]
    fn test_header_values() {
        assert_eq!(Encoding::None.header_value(), None);
        assert_eq!(Encoding::Br.header_value(), Some("br"));
        assert_eq!(
            serde_json::to_string(&Encoding::Deflate).unwrap(),
            "\"deflate\""
        );
    }
}
