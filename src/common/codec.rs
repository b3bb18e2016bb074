//! Value encoding with optional LZ4 compression
//!
//! Plain values are stored as JSON text. Compressed values use the frame
//! `[MAGIC:4][CRC32:4][LZ4 block with prepended size]`, where the CRC covers
//! the uncompressed JSON. JSON text never starts with a NUL byte, so the
//! magic alone tells the two apart and reads never depend on the current
//! compression setting.

use crate::common::utils::crc32;
use crate::common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

const COMPRESSED_MAGIC: [u8; 4] = [0x00, b'L', b'Z', b'4'];
const HEADER_LEN: usize = 8;

/// Default compression threshold in bytes
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueCodec {
    /// Payloads strictly larger than this are compressed; `None` disables compression
    threshold: Option<usize>,
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::plain()
    }
}

impl ValueCodec {
    /// Never compresses (still decodes compressed frames)
    pub fn plain() -> Self {
        Self { threshold: None }
    }

    pub fn compressed(threshold: usize) -> Self {
        Self {
            threshold: Some(threshold),
        }
    }

    /// Codec from an optional threshold, as returned by `Config::compression`
    pub fn with_threshold(threshold: Option<usize>) -> Self {
        Self { threshold }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(value)?;
        match self.threshold {
            Some(threshold) if json.len() > threshold => Ok(compress_frame(&json)?.unwrap_or(json)),
            _ => Ok(json),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        if is_compressed(bytes) {
            let json = decompress_frame(bytes)?;
            Ok(serde_json::from_slice(&json)?)
        } else {
            Ok(serde_json::from_slice(bytes)?)
        }
    }
}

/// Does this payload carry the compressed frame header?
pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN && bytes[..4] == COMPRESSED_MAGIC
}

/// Compress into a frame; `None` when compression does not shrink the payload.
fn compress_frame(json: &[u8]) -> Result<Option<Vec<u8>>> {
    let block = lz4::block::compress(json, None, true)
        .map_err(|e| Error::Serialization(format!("lz4 compress: {}", e)))?;
    if block.len() + HEADER_LEN >= json.len() {
        return Ok(None);
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + block.len());
    frame.extend_from_slice(&COMPRESSED_MAGIC);
    frame.extend_from_slice(&crc32(json).to_le_bytes());
    frame.extend_from_slice(&block);
    Ok(Some(frame))
}

fn decompress_frame(frame: &[u8]) -> Result<Vec<u8>> {
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&frame[4..HEADER_LEN]);
    let expected = u32::from_le_bytes(crc_bytes);

    let json = lz4::block::decompress(&frame[HEADER_LEN..], None)
        .map_err(|e| Error::Corrupted(format!("lz4 decompress: {}", e)))?;

    let actual = crc32(&json);
    if actual != expected {
        return Err(Error::ChecksumMismatch {
            expected: format!("{:08x}", expected),
            actual: format!("{:08x}", actual),
        });
    }
    Ok(json)
}
