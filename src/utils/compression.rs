//! LZ4 block compression used by the frame codec.
//!
//! Blocks carry no size prefix of their own: the frame header records the
//! original length, so decompression writes straight into a caller-provided
//! slice of exactly that length.

use crate::error::{ProtocolError, Result};

/// Compress `data` as a raw LZ4 block
pub fn compress_block(data: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress(data)
}

/// Decompress an LZ4 block into `out`, returning the number of bytes written
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if the block is corrupt or
/// does not fit in `out`
pub fn decompress_block_into(data: &[u8], out: &mut [u8]) -> Result<usize> {
    lz4_flex::block::decompress_into(data, out).map_err(|_| ProtocolError::DecompressionFailure)
}

/// Compress `data` if it is longer than `threshold_bytes` and the result is
/// strictly smaller than the input. Returns `None` when the raw form should
/// be sent.
pub fn compress_if_smaller(data: &[u8], threshold_bytes: usize) -> Option<Vec<u8>> {
    if data.len() <= threshold_bytes {
        return None;
    }

    let compressed = compress_block(data);
    if compressed.len() < data.len() {
        Some(compressed)
    } else {
        None
    }
}
