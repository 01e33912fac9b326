//! Buffer pool that tracks every rented array.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::protocol::BufferPool;

#[derive(Debug, Default)]
struct TrackingState {
    /// Outstanding arrays by data pointer, with their length.
    outstanding: HashMap<usize, usize>,
    rented: usize,
    foreign: usize,
}

/// A [`BufferPool`] handing out arrays of exactly the requested length and
/// recording which ones have not been given back.
///
/// Use it to assert that readers, writers and connections release every
/// buffer they rent.
#[derive(Debug, Default)]
pub struct TrackingPool {
    state: Mutex<TrackingState>,
}

impl TrackingPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrays rented and not yet given back.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    /// Total number of rents so far.
    pub fn rented(&self) -> usize {
        self.lock().rented
    }

    /// Panic if any array is still rented or a foreign array was given back.
    pub fn assert_no_leaks(&self) {
        let state = self.lock();
        assert!(
            state.outstanding.is_empty(),
            "{} pooled array(s) were never returned (sizes: {:?})",
            state.outstanding.len(),
            state.outstanding.values().collect::<Vec<_>>()
        );
        assert_eq!(
            state.foreign, 0,
            "arrays not rented from this pool were given back"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BufferPool for TrackingPool {
    fn rent(&self, length: usize) -> Vec<u8> {
        let buffer = vec![0u8; length];
        let mut state = self.lock();
        state.rented += 1;
        state.outstanding.insert(buffer.as_ptr() as usize, length);
        buffer
    }

    fn give_back(&self, buffer: Vec<u8>) {
        let mut state = self.lock();
        if state.outstanding.remove(&(buffer.as_ptr() as usize)).is_none() {
            state.foreign += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_outstanding_arrays() {
        let pool = TrackingPool::new();
        let a = pool.rent(16);
        let b = pool.rent(32);
        assert_eq!(a.len(), 16);
        assert_eq!(pool.outstanding(), 2);

        pool.give_back(a);
        pool.give_back(b);
        assert_eq!(pool.rented(), 2);
        pool.assert_no_leaks();
    }

    #[test]
    #[should_panic(expected = "never returned")]
    fn test_reports_leak() {
        let pool = TrackingPool::new();
        let _leaked = pool.rent(8);
        pool.assert_no_leaks();
    }

    #[test]
    #[should_panic(expected = "not rented from this pool")]
    fn test_reports_foreign_array() {
        let pool = TrackingPool::new();
        pool.give_back(vec![0u8; 8]);
        pool.assert_no_leaks();
    }
}
