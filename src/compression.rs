//! Payload compression codecs.
//!
//! Codecs are opaque byte transforms; the log never interprets compressed
//! bytes. The one-byte on-disk tag is part of the payload framing used by the
//! traces and chain-state specializations and must stay stable.

use crate::error::{ShipLogError, ShipLogResult};
use std::io::{Read, Write};

/// Compression applied to payload bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// Store bytes as-is.
    None,
    /// zlib (DEFLATE with zlib framing).
    Zlib,
    /// Zstandard.
    Zstd,
}

impl CompressionType {
    /// One-byte on-disk tag.
    pub fn tag(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Zlib => 1,
            CompressionType::Zstd => 2,
        }
    }

    /// Decode an on-disk tag.
    pub fn from_tag(tag: u8) -> ShipLogResult<Self> {
        match tag {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zlib),
            2 => Ok(CompressionType::Zstd),
            other => Err(ShipLogError::Decode(format!(
                "unknown compression tag {other}"
            ))),
        }
    }
}

/// Compress `bytes` with `codec`.
pub fn compress(codec: CompressionType, bytes: &[u8]) -> ShipLogResult<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(bytes.to_vec()),
        CompressionType::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(bytes)?;
            Ok(encoder.finish()?)
        }
        CompressionType::Zstd => {
            zstd::stream::encode_all(bytes, 0).map_err(ShipLogError::Io)
        }
    }
}

/// Decompress `bytes` written with `codec`.
pub fn decompress(codec: CompressionType, bytes: &[u8]) -> ShipLogResult<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(bytes.to_vec()),
        CompressionType::Zlib => {
            let mut decoder = flate2::read::ZlibDecoder::new(bytes);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        CompressionType::Zstd => {
            zstd::stream::decode_all(bytes).map_err(ShipLogError::Io)
        }
    }
}
