//! Reusable encode/receive buffers.
//!
//! Every outbound message is written into a buffer drawn from a [`BufferPool`]
//! and then frozen into [`Bytes`] without copying. The buffer goes back to the
//! pool once the last `Bytes` handle is dropped, which for a broadcast is after
//! every member's write has completed.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::Bytes;
use object_pool::Pool;

/// Initial capacity of pooled buffers. Hub messages are usually small.
const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// Number of buffers retained by the pool.
const DEFAULT_POOL_CAPACITY: usize = 256;

/// Buffers that grew past this multiple of the configured size are replaced
/// instead of being handed out again.
const MAX_RETAINED_FACTOR: usize = 16;

/// A pool of byte buffers shared by the codec and the transports.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Create a pool holding up to `capacity` buffers of `buffer_size` bytes each.
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        let pool = Pool::new(capacity, move || Vec::with_capacity(buffer_size));
        Self {
            pool: Arc::new(pool),
            buffer_size,
        }
    }

    /// Take an empty buffer from the pool, allocating if none is free.
    pub fn get(&self) -> PooledBuf {
        let mut reusable = self
            .pool
            .pull_owned(|| Vec::with_capacity(self.buffer_size));

        // Buffers come back in whatever state they were dropped in.
        reusable.clear();
        if reusable.capacity() > self.buffer_size * MAX_RETAINED_FACTOR {
            *reusable = Vec::with_capacity(self.buffer_size);
        }

        PooledBuf { inner: reusable }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuf {
    inner: object_pool::ReusableOwned<Vec<u8>>,
}

impl PooledBuf {
    pub fn from_slice(pool: &BufferPool, data: &[u8]) -> Self {
        let mut buf = pool.get();
        buf.extend_from_slice(data);
        buf
    }

    /// Convert into immutable, cheaply clonable bytes.
    ///
    /// No copy is made; the storage returns to the pool when the last clone drops.
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.inner.len())
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_empty_buffer() {
        let pool = BufferPool::new();
        let mut buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= DEFAULT_BUFFER_SIZE);

        buf.extend_from_slice(b"hello");
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn reused_buffer_does_not_leak_previous_contents() {
        let pool = BufferPool::with_capacity(1, 64);
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"secret");
        }
        let buf = pool.get();
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_buffer_is_replaced() {
        let pool = BufferPool::with_capacity(1, 16);
        {
            let mut buf = pool.get();
            buf.resize(16 * MAX_RETAINED_FACTOR + 1, 0);
        }
        let buf = pool.get();
        assert!(buf.capacity() <= 16 * MAX_RETAINED_FACTOR);
    }

    #[test]
    fn freeze_keeps_contents() {
        let pool = BufferPool::new();
        let bytes = PooledBuf::from_slice(&pool, b"frame").freeze();
        let clone = bytes.clone();
        assert_eq!(&bytes[..], b"frame");
        assert_eq!(clone, bytes);
    }
}
