//! Chunk block-array compression.
//!
//! Block ids are laid out as little-endian `u16` values and DEFLATE-compressed
//! (raw stream, no zlib/gzip header). Decompression is bounded by the declared
//! chunk volume: a payload that inflates to anything other than exactly
//! `volume * 2` bytes is rejected, so a corrupted frame never yields a partial
//! chunk.

use crate::codec::DecodeError;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use std::io::{self, Write};
use voxlink_core::BlockId;

/// Compress a chunk block array.
pub fn compress_blocks(blocks: &[BlockId]) -> io::Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(blocks.len() * 2);
    for block in blocks {
        raw.extend_from_slice(&block.to_le_bytes());
    }

    let mut encoder = DeflateEncoder::new(Vec::with_capacity(64), Compression::default());
    encoder.write_all(&raw)?;
    encoder.finish()
}

/// Decompress a chunk block array holding exactly `volume` blocks.
pub fn decompress_blocks(compressed: &[u8], volume: usize) -> Result<Vec<BlockId>, DecodeError> {
    let expected = volume
        .checked_mul(2)
        .ok_or(DecodeError::ChunkLengthMismatch {
            expected: usize::MAX,
            actual: 0,
        })?;

    // One spare byte lets an over-long stream show up as a length mismatch
    // instead of silently filling the buffer.
    let mut raw = Vec::with_capacity(expected + 1);
    let mut inflater = Decompress::new(false);
    let status = inflater
        .decompress_vec(compressed, &mut raw, FlushDecompress::Finish)
        .map_err(|e| DecodeError::Decompress(e.to_string()))?;

    match status {
        Status::StreamEnd => {}
        Status::Ok | Status::BufError if raw.len() > expected => {
            return Err(DecodeError::ChunkLengthMismatch {
                expected,
                actual: raw.len(),
            });
        }
        Status::Ok | Status::BufError => {
            return Err(DecodeError::Decompress(
                "deflate stream ended early".to_string(),
            ));
        }
    }

    if raw.len() != expected {
        return Err(DecodeError::ChunkLengthMismatch {
            expected,
            actual: raw.len(),
        });
    }

    let consumed = inflater.total_in() as usize;
    if consumed != compressed.len() {
        return Err(DecodeError::Decompress(format!(
            "{} bytes after end of deflate stream",
            compressed.len() - consumed
        )));
    }

    Ok(raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
