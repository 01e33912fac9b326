//! Byte array pools backing message buffers.
//!
//! Buffers are rented by [`MessageBuffer`](super::MessageBuffer) and handed
//! back on reset, so a connection that keeps processing similar messages
//! does not allocate per message.
//!
//! # Design
//!
//! [`SharedBufferPool`] keeps one free list per power-of-two size class:
//! - A rented array has exactly the requested length
//! - Returned arrays are filed under the largest class their capacity covers
//! - Each class retains a bounded number of arrays, the rest are freed
//!
//! Pools are the only buffers shared between connections, so every pool
//! must be safe for concurrent rent/return.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Smallest size class (16 bytes).
const MIN_CLASS_SHIFT: u32 = 4;

/// Largest pooled size class (16 MiB). Bigger arrays are never retained.
const MAX_CLASS_SHIFT: u32 = 24;

/// Arrays retained per size class.
pub const DEFAULT_ARRAYS_PER_CLASS: usize = 32;

/// A source of reusable byte arrays.
pub trait BufferPool: Send + Sync + fmt::Debug {
    /// Rent an array of exactly `length` bytes. Contents are unspecified.
    fn rent(&self, length: usize) -> Vec<u8>;

    /// Give an array back to the pool.
    fn give_back(&self, buffer: Vec<u8>);
}

/// Process-wide pool with power-of-two size classes.
#[derive(Debug)]
pub struct SharedBufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    arrays_per_class: usize,
}

impl SharedBufferPool {
    /// Create a new pool with the default retention per size class.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_ARRAYS_PER_CLASS)
    }

    /// Create a new pool retaining at most `arrays_per_class` arrays per class.
    pub fn with_retention(arrays_per_class: usize) -> Self {
        let classes = (MIN_CLASS_SHIFT..=MAX_CLASS_SHIFT)
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        Self {
            classes,
            arrays_per_class,
        }
    }

    /// The process-wide shared pool.
    pub fn global() -> Arc<dyn BufferPool> {
        static GLOBAL: OnceLock<Arc<SharedBufferPool>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SharedBufferPool::new())).clone()
    }

    /// Number of arrays currently retained across all classes.
    pub fn retained(&self) -> usize {
        self.classes
            .iter()
            .map(|class| class.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Class index able to serve a rent of `length` bytes.
    fn class_for_rent(length: usize) -> Option<usize> {
        let size = length.max(1 << MIN_CLASS_SHIFT).checked_next_power_of_two()?;
        let shift = size.trailing_zeros();
        (shift <= MAX_CLASS_SHIFT).then(|| (shift - MIN_CLASS_SHIFT) as usize)
    }

    /// Class index an array with `capacity` bytes may be filed under.
    fn class_for_return(capacity: usize) -> Option<usize> {
        if capacity < (1 << MIN_CLASS_SHIFT) {
            return None;
        }
        let shift = (usize::BITS - 1 - capacity.leading_zeros()).min(MAX_CLASS_SHIFT);
        Some((shift - MIN_CLASS_SHIFT) as usize)
    }
}

impl Default for SharedBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool for SharedBufferPool {
    fn rent(&self, length: usize) -> Vec<u8> {
        let Some(index) = Self::class_for_rent(length) else {
            return vec![0u8; length];
        };

        let recycled = self.classes[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match recycled {
            Some(mut buffer) => {
                // Shrinking keeps the capacity, growing only zeroes the tail
                buffer.resize(length, 0);
                buffer
            }
            None => {
                let mut buffer = Vec::with_capacity(1 << (index as u32 + MIN_CLASS_SHIFT));
                buffer.resize(length, 0);
                buffer
            }
        }
    }

    fn give_back(&self, buffer: Vec<u8>) {
        let Some(index) = Self::class_for_return(buffer.capacity()) else {
            return;
        };
        let mut class = self.classes[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if class.len() < self.arrays_per_class {
            class.push(buffer);
        }
    }
}
