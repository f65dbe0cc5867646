//! # Core Wire Components
//!
//! Low-level binary serialization and framing.
//!
//! ## Components
//! - **ByteBuffer**: growable little-endian read/write cursor over pooled or
//!   shared storage
//! - **Frame**: outer `[flag][length][payload]` envelope with optional LZ4
//!   block compression
//!
//! ## Wire Format
//! ```text
//! [Flag(1)] [OriginalLength(4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum buffer size: 64MB, maximum decompressed frame: 4MB by default
//! - Length prefixes are validated before any allocation
//! - Reads past the written length fail without moving the cursor

pub mod byte_buffer;
pub mod frame;

pub use byte_buffer::{ByteBuffer, WireValue};
pub use frame::{FrameDecoder, FrameEncoder, FrameFlag, FRAME_HEADER_SIZE};
