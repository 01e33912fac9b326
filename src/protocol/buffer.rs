//! Growable pooled buffer shared by the message reader and writer.
//!
//! A [`MessageBuffer`] owns at most one array rented from a [`BufferPool`]
//! plus a `consumed` cursor. The array is rented lazily, grows by doubling
//! (copying the live prefix before the old array goes back to the pool)
//! and is handed back on [`MessageBuffer::reset`] or drop.

use std::fmt;
use std::sync::Arc;

use super::pool::{BufferPool, SharedBufferPool};
use super::wire_format::MAX_BUFFER_SIZE;
use crate::error::{Result, RpcError};

/// Pool and size limits for a [`MessageBuffer`].
#[derive(Clone)]
pub struct BufferOptions {
    /// Pool arrays are rented from.
    pub pool: Arc<dyn BufferPool>,
    /// Size of the first rented array. Grows exponentially from here.
    /// `0` is treated as `1`.
    pub minimum_size: usize,
    /// Hard limit for the array size, capped at [`MAX_BUFFER_SIZE`].
    pub maximum_size: usize,
}

impl BufferOptions {
    /// Options using the process-wide [`SharedBufferPool`].
    pub fn new(minimum_size: usize, maximum_size: usize) -> Self {
        Self::with_pool(SharedBufferPool::global(), minimum_size, maximum_size)
    }

    /// Options renting from a specific pool.
    pub fn with_pool(pool: Arc<dyn BufferPool>, minimum_size: usize, maximum_size: usize) -> Self {
        Self {
            pool,
            minimum_size,
            maximum_size,
        }
    }
}

impl fmt::Debug for BufferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferOptions")
            .field("minimum_size", &self.minimum_size)
            .field("maximum_size", &self.maximum_size)
            .finish_non_exhaustive()
    }
}

/// A lazily rented, exponentially growing byte buffer.
///
/// # Invariants
///
/// - `consumed <= capacity()`
/// - Bytes `[0, consumed)` survive every growth step
#[derive(Debug)]
pub struct MessageBuffer {
    options: BufferOptions,
    buffer: Option<Vec<u8>>,
    consumed: usize,
}

impl MessageBuffer {
    /// Create an empty buffer. Nothing is rented until the first
    /// [`ensure_at_least`](Self::ensure_at_least).
    pub fn new(options: BufferOptions) -> Self {
        Self {
            options,
            buffer: None,
            consumed: 0,
        }
    }

    /// Options this buffer was created with.
    #[inline]
    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    /// Size of the rented array, `0` if nothing is rented.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }

    /// Number of consumed (written) bytes.
    #[inline]
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// The consumed bytes `[0, consumed)`.
    #[inline]
    pub fn written(&self) -> &[u8] {
        match &self.buffer {
            Some(buffer) => &buffer[..self.consumed],
            None => &[],
        }
    }

    /// Mutable view of the consumed bytes.
    #[inline]
    pub fn written_mut(&mut self) -> &mut [u8] {
        match &mut self.buffer {
            Some(buffer) => &mut buffer[..self.consumed],
            None => &mut [],
        }
    }

    /// The bytes after the cursor, `[consumed, capacity)`.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        match &mut self.buffer {
            Some(buffer) => &mut buffer[self.consumed..],
            None => &mut [],
        }
    }

    /// Guarantee that at least `count` bytes are available after the cursor.
    ///
    /// The first call rents the smallest power-of-two multiple of the
    /// minimum size that fits `count`. Later calls double the array until
    /// the requirement is met.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::BufferOverflow`] if the required size exceeds the
    /// configured maximum. The buffer is left untouched in that case.
    pub fn ensure_at_least(&mut self, count: usize) -> Result<()> {
        debug_assert!(count > 0, "size hint must be at least one byte");

        let Some(buffer) = self.buffer.as_mut() else {
            let size = grow_until(self.options.minimum_size, count);
            check_size(&self.options, size)?;
            self.buffer = Some(self.options.pool.rent(size));
            return Ok(());
        };

        let required = self.consumed + count;
        if required <= buffer.len() {
            return Ok(());
        }

        let size = grow_until(buffer.len().saturating_mul(2), required);
        check_size(&self.options, size)?;

        let mut grown = self.options.pool.rent(size);
        grown[..self.consumed].copy_from_slice(&buffer[..self.consumed]);
        let old = std::mem::replace(buffer, grown);
        self.options.pool.give_back(old);
        Ok(())
    }

    /// Mark `count` bytes after the cursor as consumed.
    ///
    /// `count` must fit in the space secured by
    /// [`ensure_at_least`](Self::ensure_at_least).
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(
            self.consumed + count <= self.capacity(),
            "cannot advance buffer beyond its capacity"
        );
        self.consumed += count;
    }

    /// Move the cursor back to `len` if it is further ahead.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.consumed = self.consumed.min(len);
    }

    /// Hand the array back to the pool and move the cursor to zero.
    pub fn reset(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.options.pool.give_back(buffer);
        }
        self.consumed = 0;
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        self.reset();
    }
}

fn check_size(options: &BufferOptions, size: usize) -> Result<()> {
    let maximum = options.maximum_size.min(MAX_BUFFER_SIZE);
    if size > maximum {
        return Err(RpcError::BufferOverflow {
            requested: size,
            maximum,
        });
    }
    Ok(())
}

/// Double `size` until it is at least `required`.
#[inline]
fn grow_until(size: usize, required: usize) -> usize {
    let mut size = size.max(1);
    while size < required {
        size = size.saturating_mul(2);
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TrackingPool;

    fn buffer(pool: &Arc<TrackingPool>, minimum: usize, maximum: usize) -> MessageBuffer {
        MessageBuffer::new(BufferOptions::with_pool(pool.clone(), minimum, maximum))
    }

    #[test]
    fn test_allocates_minimum_size() {
        let pool = Arc::new(TrackingPool::new());
        let mut buf = buffer(&pool, 16, usize::MAX);

        assert_eq!(buf.capacity(), 0);
        buf.ensure_at_least(1).unwrap();
        assert_eq!(buf.capacity(), 16);
    }

    #[test]
    fn test_grows_exponentially() {
        let pool = Arc::new(TrackingPool::new());
        let mut buf = buffer(&pool, 16, usize::MAX);

        buf.ensure_at_least(20).unwrap();
        assert_eq!(buf.capacity(), 32);
        buf.consume(20);

        buf.ensure_at_least(20).unwrap();
        assert_eq!(buf.capacity(), 64);
        buf.consume(20);

        buf.ensure_at_least(20).unwrap();
        assert_eq!(buf.capacity(), 64);
        buf.consume(20);

        buf.ensure_at_least(4).unwrap();
        assert_eq!(buf.capacity(), 64);
        buf.consume(4);

        buf.ensure_at_least(1).unwrap();
        assert_eq!(buf.capacity(), 128);
        buf.consume(1);

        drop(buf);
        pool.assert_no_leaks();
    }

    #[test]
    fn test_reuse_after_reset() {
        let pool = Arc::new(TrackingPool::new());
        let mut buf = buffer(&pool, 16, usize::MAX);

        buf.ensure_at_least(20).unwrap();
        assert_eq!(buf.capacity(), 32);
        buf.consume(20);

        buf.reset();
        assert_eq!(pool.outstanding(), 0);

        // Without the reset this would grow to 64 bytes
        buf.ensure_at_least(20).unwrap();
        assert_eq!(buf.capacity(), 32);
        buf.consume(20);
    }

    #[test]
    fn test_copies_data_during_resize() {
        let pool = Arc::new(TrackingPool::new());
        let mut buf = buffer(&pool, 4, usize::MAX);

        buf.ensure_at_least(4).unwrap();
        buf.spare_mut()[..2].fill(0x9f);
        buf.consume(2);
        buf.ensure_at_least(4).unwrap();
        buf.spare_mut()[..4].fill(0xc8);
        buf.consume(4);

        assert_eq!(buf.written(), &[0x9f, 0x9f, 0xc8, 0xc8, 0xc8, 0xc8]);
    }

    #[test]
    fn test_limits_buffer_to_maximum_size() {
        let pool = Arc::new(TrackingPool::new());
        let mut buf = buffer(&pool, 8, 8);

        let err = buf.ensure_at_least(9).unwrap_err();
        assert!(matches!(
            err,
            RpcError::BufferOverflow {
                requested: 16,
                maximum: 8
            }
        ));

        buf.ensure_at_least(4).unwrap();
        buf.consume(4);
        assert!(matches!(
            buf.ensure_at_least(5),
            Err(RpcError::BufferOverflow { .. })
        ));
        // The failed growth must not lose the live prefix
        assert_eq!(buf.consumed(), 4);
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    fn test_zero_minimum_size_grows_from_one() {
        let pool = Arc::new(TrackingPool::new());
        let mut buf = buffer(&pool, 0, 64);

        buf.ensure_at_least(3).unwrap();
        assert_eq!(buf.capacity(), 4);
        buf.consume(3);
        buf.ensure_at_least(6).unwrap();
        assert_eq!(buf.capacity(), 16);
    }

    #[test]
    fn test_maximum_size_is_capped_at_length_prefix_range() {
        let pool = Arc::new(TrackingPool::new());
        let mut buf = buffer(&pool, 16, usize::MAX);

        let err = buf.ensure_at_least(MAX_BUFFER_SIZE + 1).unwrap_err();
        assert!(matches!(
            err,
            RpcError::BufferOverflow {
                maximum: MAX_BUFFER_SIZE,
                ..
            }
        ));
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn test_drop_returns_array_to_pool() {
        let pool = Arc::new(TrackingPool::new());
        {
            let mut buf = buffer(&pool, 16, 1024);
            buf.ensure_at_least(100).unwrap();
            assert_eq!(pool.outstanding(), 1);
        }
        pool.assert_no_leaks();
    }
}
