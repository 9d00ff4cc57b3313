//! ClickHouse compressed frame layout.
//!
//! A frame is a 16-byte CityHash128 (v1.0.2) checksum followed by the body:
//! 1-byte method, 4-byte compressed size (which counts the 9 body header
//! bytes), 4-byte uncompressed size, LZ4 block payload. The checksum covers
//! the body, sizes are little-endian.

use crate::error::{Error, Result};

pub(crate) const METHOD_LZ4: u8 = 0x82;

/// method + compressed size + uncompressed size.
pub(crate) const HEADER_LEN: usize = 9;
pub(crate) const CHECKSUM_LEN: usize = 16;

/// Encoder flushes a frame once this much plain data is pending.
pub(crate) const MAX_BLOCK_SIZE: usize = 1 << 20;

/// Upper bound on a single frame body; anything larger is a corrupt stream.
pub(crate) const MAX_FRAME_SIZE: usize = 1 << 30;

pub(crate) fn compress_frame(input: &[u8]) -> Vec<u8> {
    let payload = lz4_flex::block::compress(input);

    let mut body = Vec::with_capacity(HEADER_LEN + payload.len());
    body.push(METHOD_LZ4);
    body.extend_from_slice(&((HEADER_LEN + payload.len()) as u32).to_le_bytes());
    body.extend_from_slice(&(input.len() as u32).to_le_bytes());
    body.extend_from_slice(&payload);

    let checksum = cityhash_rs::cityhash_102_128(&body);

    let mut frame = Vec::with_capacity(CHECKSUM_LEN + body.len());
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// `body` is the checksummed region: header plus compressed payload.
pub(crate) fn decompress_frame(checksum: [u8; CHECKSUM_LEN], body: &[u8]) -> Result<Vec<u8>> {
    if u128::from_le_bytes(checksum) != cityhash_rs::cityhash_102_128(body) {
        return Err(Error::ChecksumMismatch);
    }

    if body[0] != METHOD_LZ4 {
        return Err(Error::BadCompressionMethod(body[0]));
    }

    let uncompressed = u32::from_le_bytes(body[5..HEADER_LEN].try_into().unwrap()) as usize;
    if uncompressed > MAX_FRAME_SIZE {
        return Err(Error::Decompress(format!(
            "uncompressed size out of range: {uncompressed}"
        )));
    }

    lz4_flex::block::decompress(&body[HEADER_LEN..], uncompressed)
        .map_err(|e| Error::Decompress(e.to_string()))
}
