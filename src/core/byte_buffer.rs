//! # ByteBuffer
//!
//! Growable read/write cursor over bytes, used to build and parse every
//! message payload.
//!
//! A buffer is either a **writer**, backed by storage rented from the shared
//! [`BufferPool`](crate::utils::buffer_pool::BufferPool), or a **reader**
//! sharing an immutable [`Bytes`] without copying. Both track a cursor
//! (`position`) and the used length (`len`); `0 <= position <= len` holds
//! after every operation.
//!
//! ## Layout
//! - Fixed-size values ([`WireValue`]) are little-endian.
//! - Arrays are prefixed with an `i32` element count.
//! - Strings are UTF-8 with an `i32` byte count; `-1` encodes `None`, `0` the
//!   empty string.
//!
//! Reads are bounds-checked and transactional: a failed read leaves the
//! cursor where it was. Length prefixes are validated against the remaining
//! bytes before anything is allocated.
//!
//! ```rust
//! use session_wire::core::byte_buffer::ByteBuffer;
//!
//! let mut writer = ByteBuffer::create(64);
//! writer.write(7u16).unwrap();
//! writer.write_str(Some("ready")).unwrap();
//!
//! let mut reader = ByteBuffer::reader(writer.to_bytes());
//! assert_eq!(reader.read::<u16>().unwrap(), 7);
//! assert_eq!(reader.read_string().unwrap().as_deref(), Some("ready"));
//! ```

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::utils::buffer_pool::{shared_pool, PooledBuffer};

/// Hard ceiling on a single writer's size (64 MiB)
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Smallest capacity a growing writer starts doubling from
const MIN_GROWTH_CAPACITY: usize = 64;

/// Size in bytes of an array or string length prefix
const LENGTH_PREFIX_SIZE: usize = 4;

/// A value with a fixed little-endian wire layout
pub trait WireValue: Copy + Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Write the value into `out`, which is exactly `SIZE` bytes long
    fn encode(self, out: &mut [u8]);

    /// Read the value from `src`, which is exactly `SIZE` bytes long
    fn decode(src: &[u8]) -> Self;
}

macro_rules! impl_wire_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn encode(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode(src: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(src);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_wire_value!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl WireValue for bool {
    const SIZE: usize = 1;

    #[inline]
    fn encode(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }

    #[inline]
    fn decode(src: &[u8]) -> Self {
        src[0] != 0
    }
}

impl WireValue for Uuid {
    const SIZE: usize = 16;

    #[inline]
    fn encode(self, out: &mut [u8]) {
        out.copy_from_slice(self.as_bytes());
    }

    #[inline]
    fn decode(src: &[u8]) -> Self {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(src);
        Uuid::from_bytes(raw)
    }
}

#[derive(Debug)]
enum Storage {
    /// Rented, writable; `Vec::len()` is the used length
    Writer(PooledBuffer),
    /// Shared, read-only view
    Reader(Bytes),
    Disposed,
}

/// Bounds-checked read/write cursor over a byte payload
#[derive(Debug)]
pub struct ByteBuffer {
    storage: Storage,
    position: usize,
}

impl ByteBuffer {
    /// Rent a writable buffer with room for at least `size` bytes
    pub fn create(size: usize) -> Self {
        Self {
            storage: Storage::Writer(shared_pool().acquire(size.min(MAX_BUFFER_SIZE))),
            position: 0,
        }
    }

    /// Wrap read-only bytes without copying
    pub fn reader(data: impl Into<Bytes>) -> Self {
        Self {
            storage: Storage::Reader(data.into()),
            position: 0,
        }
    }

    /// Copy `data` into a new read-only buffer
    pub fn reader_from_slice(data: &[u8]) -> Self {
        Self::reader(Bytes::copy_from_slice(data))
    }

    /// Current cursor position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of used bytes
    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Writer(buf) => buf.len(),
            Storage::Reader(bytes) => bytes.len(),
            Storage::Disposed => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes between the cursor and the used length
    pub fn remaining(&self) -> usize {
        self.len() - self.position
    }

    pub fn is_reader(&self) -> bool {
        matches!(self.storage, Storage::Reader(_))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.storage, Storage::Disposed)
    }

    /// Move the cursor; `position` may not exceed the used length
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        self.ensure_live()?;
        let len = self.len();
        if position > len {
            return Err(ProtocolError::BufferOverrun {
                requested: position,
                available: len,
            });
        }
        self.position = position;
        Ok(())
    }

    /// Move the cursor back to the start
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Forget all written bytes, keeping the rented capacity
    pub fn clear(&mut self) {
        if let Storage::Writer(buf) = &mut self.storage {
            buf.clear();
        }
        self.position = 0;
    }

    /// The used bytes, regardless of the cursor
    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Writer(buf) => buf.as_slice(),
            Storage::Reader(bytes) => &bytes[..],
            Storage::Disposed => &[],
        }
    }

    /// The bytes between the cursor and the used length
    pub fn unread(&self) -> &[u8] {
        &self.as_slice()[self.position..]
    }

    /// The used bytes as `Bytes`; free for readers, one copy for writers
    pub fn to_bytes(&self) -> Bytes {
        match &self.storage {
            Storage::Writer(buf) => Bytes::copy_from_slice(buf),
            Storage::Reader(bytes) => bytes.clone(),
            Storage::Disposed => Bytes::new(),
        }
    }

    /// Return rented storage to the pool. Safe to call more than once.
    pub fn dispose(&mut self) {
        self.storage = Storage::Disposed;
        self.position = 0;
    }

    // ---------------------------------------------------------------------
    // Writing
    // ---------------------------------------------------------------------

    /// Write a fixed-size value at the cursor
    pub fn write<T: WireValue>(&mut self, value: T) -> Result<()> {
        let start = self.position;
        let slot = self.reserve(T::SIZE)?;
        value.encode(slot);
        self.position = start + T::SIZE;
        Ok(())
    }

    /// Write raw bytes at the cursor, without a length prefix
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let start = self.position;
        let slot = self.reserve(data.len())?;
        slot.copy_from_slice(data);
        self.position = start + data.len();
        Ok(())
    }

    /// Write an `i32`-prefixed array of fixed-size values
    pub fn write_array<T: WireValue>(&mut self, values: &[T]) -> Result<()> {
        let count = Self::length_prefix(values.len())?;
        let total = values
            .len()
            .checked_mul(T::SIZE)
            .and_then(|n| n.checked_add(LENGTH_PREFIX_SIZE))
            .ok_or(ProtocolError::BufferTooLarge(usize::MAX))?;

        let start = self.position;
        let slot = self.reserve(total)?;
        slot[..LENGTH_PREFIX_SIZE].copy_from_slice(&count.to_le_bytes());
        for (value, out) in values
            .iter()
            .zip(slot[LENGTH_PREFIX_SIZE..].chunks_exact_mut(T::SIZE))
        {
            value.encode(out);
        }
        self.position = start + total;
        Ok(())
    }

    /// Write an `i32`-prefixed byte array
    pub fn write_blob(&mut self, data: &[u8]) -> Result<()> {
        let count = Self::length_prefix(data.len())?;
        let total = data
            .len()
            .checked_add(LENGTH_PREFIX_SIZE)
            .ok_or(ProtocolError::BufferTooLarge(usize::MAX))?;

        let start = self.position;
        let slot = self.reserve(total)?;
        slot[..LENGTH_PREFIX_SIZE].copy_from_slice(&count.to_le_bytes());
        slot[LENGTH_PREFIX_SIZE..].copy_from_slice(data);
        self.position = start + total;
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string; `None` is encoded as `-1`
    pub fn write_str(&mut self, value: Option<&str>) -> Result<()> {
        match value {
            None => self.write(-1i32),
            Some(s) => self.write_blob(s.as_bytes()),
        }
    }

    // ---------------------------------------------------------------------
    // Reading
    // ---------------------------------------------------------------------

    /// Read a fixed-size value at the cursor
    pub fn read<T: WireValue>(&mut self) -> Result<T> {
        let value = T::decode(self.peek_slice(T::SIZE)?);
        self.position += T::SIZE;
        Ok(value)
    }

    /// Non-failing variant of [`read`](Self::read)
    pub fn try_read<T: WireValue>(&mut self) -> Option<T> {
        self.read().ok()
    }

    /// Read `len` raw bytes
    pub fn read_raw(&mut self, len: usize) -> Result<&[u8]> {
        let start = self.position;
        self.peek_slice(len)?;
        self.position = start + len;
        Ok(&self.as_slice()[start..start + len])
    }

    /// Read an `i32`-prefixed array of fixed-size values
    pub fn read_array<T: WireValue>(&mut self) -> Result<Vec<T>> {
        let start = self.position;
        let result = self.read_prefixed_len(T::SIZE).map(|count| {
            let body = &self.as_slice()[self.position..self.position + count * T::SIZE];
            let values: Vec<T> = body.chunks_exact(T::SIZE).map(T::decode).collect();
            self.position += count * T::SIZE;
            values
        });
        if result.is_err() {
            self.position = start;
        }
        result
    }

    /// Read an `i32`-prefixed byte array
    pub fn read_blob(&mut self) -> Result<Vec<u8>> {
        Ok(self.read_blob_slice()?.to_vec())
    }

    /// Read an `i32`-prefixed byte array as `Bytes`, zero-copy for readers
    pub fn read_blob_bytes(&mut self) -> Result<Bytes> {
        let start = self.position;
        let count = match self.read_prefixed_len(1) {
            Ok(count) => count,
            Err(e) => {
                self.position = start;
                return Err(e);
            }
        };
        let body_start = self.position;
        self.position += count;
        Ok(match &self.storage {
            Storage::Reader(bytes) => bytes.slice(body_start..body_start + count),
            _ => Bytes::copy_from_slice(&self.as_slice()[body_start..body_start + count]),
        })
    }

    /// Read a length-prefixed UTF-8 string; `-1` yields `None`
    pub fn read_string(&mut self) -> Result<Option<String>> {
        let start = self.position;
        let prefix = self.read::<i32>()?;
        if prefix == -1 {
            return Ok(None);
        }
        self.position = start;

        let text = std::str::from_utf8(self.read_blob_slice()?)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8);
        if text.is_err() {
            self.position = start;
        }
        text.map(Some)
    }

    /// Read view over the next `size` bytes, advancing the cursor past them.
    /// Zero-copy when this buffer is a reader.
    pub fn read_sub_buffer(&mut self, size: usize) -> Result<ByteBuffer> {
        self.peek_slice(size)?;
        let start = self.position;
        self.position += size;
        let view = match &self.storage {
            Storage::Reader(bytes) => bytes.slice(start..start + size),
            _ => Bytes::copy_from_slice(&self.as_slice()[start..start + size]),
        };
        Ok(ByteBuffer::reader(view))
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(ProtocolError::BufferDisposed)
        } else {
            Ok(())
        }
    }

    fn length_prefix(len: usize) -> Result<i32> {
        i32::try_from(len).map_err(|_| ProtocolError::InvalidLength(len as i64))
    }

    /// Bounds-checked view of the next `size` bytes without moving the cursor
    fn peek_slice(&self, size: usize) -> Result<&[u8]> {
        self.ensure_live()?;
        let available = self.remaining();
        if size > available {
            return Err(ProtocolError::BufferOverrun {
                requested: size,
                available,
            });
        }
        Ok(&self.as_slice()[self.position..self.position + size])
    }

    /// Read an `i32` count and check `count * elem_size` bytes follow.
    /// Leaves the cursor after the prefix on success.
    fn read_prefixed_len(&mut self, elem_size: usize) -> Result<usize> {
        let prefix = self.read::<i32>()?;
        let count = usize::try_from(prefix).map_err(|_| ProtocolError::InvalidLength(prefix.into()))?;
        let bytes = count
            .checked_mul(elem_size)
            .ok_or(ProtocolError::InvalidLength(prefix.into()))?;
        let available = self.remaining();
        if bytes > available {
            return Err(ProtocolError::BufferOverrun {
                requested: bytes,
                available,
            });
        }
        Ok(count)
    }

    fn read_blob_slice(&mut self) -> Result<&[u8]> {
        let start = self.position;
        match self.read_prefixed_len(1) {
            Ok(count) => {
                let body = self.position;
                self.position += count;
                Ok(&self.as_slice()[body..body + count])
            }
            Err(e) => {
                self.position = start;
                Err(e)
            }
        }
    }

    /// Make `size` writable bytes available at the cursor, growing
    /// geometrically, and return them. The used length is extended to cover
    /// the slot; the cursor is not moved.
    fn reserve(&mut self, size: usize) -> Result<&mut [u8]> {
        let start = self.position;
        let end = start
            .checked_add(size)
            .ok_or(ProtocolError::BufferTooLarge(usize::MAX))?;
        if end > MAX_BUFFER_SIZE {
            return Err(ProtocolError::BufferTooLarge(end));
        }

        let buf = match &mut self.storage {
            Storage::Writer(buf) => buf,
            Storage::Reader(_) => return Err(ProtocolError::ReadOnlyBuffer),
            Storage::Disposed => return Err(ProtocolError::BufferDisposed),
        };

        if end > buf.capacity() {
            let mut capacity = buf.capacity().max(MIN_GROWTH_CAPACITY);
            while capacity < end {
                capacity = capacity.saturating_mul(2).min(MAX_BUFFER_SIZE);
            }
            let additional = capacity - buf.len();
            buf.reserve_exact(additional);
        }
        if end > buf.len() {
            buf.resize(end, 0);
        }
        Ok(&mut buf[start..end])
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::create(0)
    }
}
