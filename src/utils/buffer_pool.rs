//! # Buffer Pool
//!
//! Object pool for the write buffers rented by
//! [`ByteBuffer::create`](crate::core::byte_buffer::ByteBuffer::create), so the
//! steady-state send path does not hit the allocator once per message.
//!
//! ## Usage
//! ```rust,no_run
//! use session_wire::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(16);
//! let mut buffer = pool.acquire(256);
//! buffer.extend_from_slice(b"hello");
//! // Buffer automatically returned to pool on drop
//! ```

use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

/// Buffers that grew beyond this capacity are released instead of pooled
const MAX_POOLED_BUFFER_SIZE: usize = 64 * 1024;

/// Default buffer capacity
const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Upper bound on idle buffers kept by a pool
const MAX_IDLE_BUFFERS: usize = 256;

/// A pooled buffer that returns itself to the pool when dropped
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PooledBuffer {
    /// Get the underlying buffer, consuming this wrapper.
    /// The storage is not returned to the pool.
    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let capacity = self.buffer.capacity();
        if capacity == 0 || capacity > MAX_POOLED_BUFFER_SIZE {
            return;
        }
        self.buffer.clear();
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < MAX_IDLE_BUFFERS {
                pool.push(std::mem::take(&mut self.buffer));
            }
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buffer.len())
            .field("capacity", &self.buffer.capacity())
            .finish()
    }
}

/// Thread-safe buffer pool
pub struct BufferPool {
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    /// Create a new buffer pool with `pool_size` pre-allocated buffers
    pub fn new(pool_size: usize) -> Self {
        let pool = (0..pool_size.min(MAX_IDLE_BUFFERS))
            .map(|_| Vec::with_capacity(DEFAULT_BUFFER_CAPACITY))
            .collect();

        Self {
            pool: Arc::new(Mutex::new(pool)),
        }
    }

    /// Acquire a cleared buffer with at least `min_capacity` bytes of capacity
    pub fn acquire(&self, min_capacity: usize) -> PooledBuffer {
        let mut buffer = self
            .pool
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_default();

        let wanted = min_capacity.max(DEFAULT_BUFFER_CAPACITY);
        if buffer.capacity() < wanted {
            buffer.reserve_exact(wanted - buffer.len());
        }

        PooledBuffer {
            buffer,
            pool: self.pool.clone(),
        }
    }

    /// Get the current number of available buffers in the pool
    pub fn available(&self) -> usize {
        self.pool.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(32)
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

static SHARED_POOL: Lazy<BufferPool> = Lazy::new(BufferPool::default);

/// Process-wide pool used by `ByteBuffer::create`
pub fn shared_pool() -> &'static BufferPool {
    &SHARED_POOL
}
