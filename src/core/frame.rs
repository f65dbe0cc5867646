//! # Frame Codec
//!
//! Outer envelope wrapping every wire message.
//!
//! ## Wire Format
//! ```text
//! [Flag(1)] [OriginalLength(4, LE)] [Payload(N)]
//! ```
//! `Flag` is `0` for a raw payload and `1` for an LZ4 block. A payload is
//! only compressed when it is longer than the threshold *and* the block is
//! strictly smaller than the raw bytes, so compression never makes a frame
//! larger.
//!
//! Decoding a compressed frame writes into the decoder's scratch buffer and
//! returns a slice of it; the borrow ties that slice to the decoder, so it
//! must be consumed (or copied) before the next `decode` call.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::config::{TransportConfig, DEFAULT_COMPRESSION_THRESHOLD, MAX_MESSAGE_SIZE};
use crate::core::byte_buffer::ByteBuffer;
use crate::error::{ProtocolError, Result};
use crate::utils::compression::{compress_if_smaller, decompress_block_into};
use crate::utils::metrics::global_metrics;

/// Flag byte plus the 4-byte original length
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frame payload encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameFlag {
    Uncompressed = 0,
    CompressedBlock = 1,
}

impl FrameFlag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FrameFlag::Uncompressed),
            1 => Some(FrameFlag::CompressedBlock),
            _ => None,
        }
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flag: FrameFlag,
    pub original_len: u32,
}

impl FrameHeader {
    /// Parse the header at the start of `frame`.
    /// Returns `Ok(None)` for an unknown flag.
    pub fn parse(frame: &[u8]) -> Result<Option<Self>> {
        let (&flag_byte, rest) = frame.split_first().ok_or(ProtocolError::InvalidHeader)?;
        let Some(flag) = FrameFlag::from_byte(flag_byte) else {
            return Ok(None);
        };
        let len_bytes: [u8; 4] = rest
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::InvalidHeader)?;
        Ok(Some(Self {
            flag,
            original_len: u32::from_le_bytes(len_bytes),
        }))
    }
}

/// Encodes payloads into frames. Cheap to copy; holds configuration only.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    compression_enabled: bool,
    compression_threshold: usize,
    max_message_size: usize,
}

impl FrameEncoder {
    pub fn new(compression_enabled: bool, compression_threshold: usize, max_message_size: usize) -> Self {
        Self {
            compression_enabled,
            compression_threshold,
            max_message_size,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            config.compression_enabled,
            config.compression_threshold_bytes,
            config.max_message_size,
        )
    }

    /// Encode `payload` into a frame
    ///
    /// # Errors
    /// Returns `ProtocolError::OversizedPacket` if the payload exceeds the
    /// configured maximum message size
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        let original_len = payload.len();
        if original_len > self.max_message_size || original_len > u32::MAX as usize {
            return Err(ProtocolError::OversizedPacket(original_len));
        }

        let compressed = if self.compression_enabled && original_len > self.compression_threshold {
            global_metrics().compression_attempt();
            compress_if_smaller(payload, self.compression_threshold)
        } else {
            None
        };

        let (flag, body) = match compressed.as_deref() {
            Some(block) => {
                global_metrics().compression_success();
                (FrameFlag::CompressedBlock, block)
            }
            None => (FrameFlag::Uncompressed, payload),
        };

        let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        out.put_u8(flag as u8);
        out.put_u32_le(original_len as u32);
        out.put_slice(body);

        trace!(
            original_len,
            frame_len = out.len(),
            compressed = flag == FrameFlag::CompressedBlock,
            "Encoded frame"
        );
        Ok(out.freeze())
    }

    /// Encode the used bytes of a `ByteBuffer`
    pub fn encode_buffer(&self, buffer: &ByteBuffer) -> Result<Bytes> {
        self.encode(buffer.as_slice())
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(true, DEFAULT_COMPRESSION_THRESHOLD, MAX_MESSAGE_SIZE)
    }
}

/// Decodes frames, owning the scratch buffer compressed payloads expand into
#[derive(Debug)]
pub struct FrameDecoder {
    scratch: Vec<u8>,
    max_decompressed_size: usize,
}

impl FrameDecoder {
    pub fn new(max_decompressed_size: usize) -> Self {
        Self {
            scratch: Vec::new(),
            max_decompressed_size,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.max_message_size)
    }

    /// Decode a frame, returning the original payload.
    ///
    /// A frame with an unknown flag byte is returned unchanged.
    ///
    /// # Errors
    /// - `InvalidHeader` if the frame is empty or the length is truncated
    /// - `SizeMismatch` if the payload does not match the recorded length
    /// - `OversizedPacket` if a compressed frame claims more than the limit
    /// - `DecompressionFailure` if the block is corrupt
    pub fn decode<'a>(&'a mut self, frame: &'a [u8]) -> Result<&'a [u8]> {
        let Some(header) = FrameHeader::parse(frame)? else {
            return Ok(frame);
        };
        let original_len = header.original_len as usize;
        let body = &frame[FRAME_HEADER_SIZE..];

        match header.flag {
            FrameFlag::Uncompressed => {
                if body.len() != original_len {
                    return Err(ProtocolError::SizeMismatch {
                        expected: original_len,
                        actual: body.len(),
                    });
                }
                Ok(body)
            }
            FrameFlag::CompressedBlock => {
                if original_len > self.max_decompressed_size {
                    return Err(ProtocolError::OversizedPacket(original_len));
                }
                if self.scratch.len() < original_len {
                    self.scratch.resize(original_len, 0);
                }
                let out = &mut self.scratch[..original_len];
                let written = decompress_block_into(body, out)?;
                if written != original_len {
                    return Err(ProtocolError::SizeMismatch {
                        expected: original_len,
                        actual: written,
                    });
                }
                Ok(&self.scratch[..original_len])
            }
        }
    }

    /// Decode into an owned `Bytes`. Uncompressed frames held in `Bytes` are
    /// sliced without copying.
    pub fn decode_to_bytes(&mut self, frame: &Bytes) -> Result<Bytes> {
        match FrameHeader::parse(frame)? {
            Some(FrameHeader {
                flag: FrameFlag::Uncompressed,
                original_len,
            }) => {
                let actual = frame.len() - FRAME_HEADER_SIZE;
                if actual != original_len as usize {
                    return Err(ProtocolError::SizeMismatch {
                        expected: original_len as usize,
                        actual,
                    });
                }
                Ok(frame.slice(FRAME_HEADER_SIZE..))
            }
            Some(_) => Ok(Bytes::copy_from_slice(self.decode(frame)?)),
            None => Ok(frame.clone()),
        }
    }

    /// Current scratch allocation, for diagnostics
    pub fn scratch_capacity(&self) -> usize {
        self.scratch.capacity()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}
