//! Sized internal queue.
//!
//! Each entry remembers the size computed when it was enqueued; the running
//! total is the sum of those sizes and never recomputed.

use crate::error::{Result, StreamError};
use std::collections::VecDeque;

/// Ordered `(value, size)` entries with a running size total.
#[derive(Debug)]
pub struct SizedQueue<T> {
    entries: VecDeque<(T, f64)>,
    total: f64,
}

impl<T> Default for SizedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SizedQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            total: 0.0,
        }
    }

    /// Append a value. Sizes must be finite and non-negative.
    pub fn push(&mut self, value: T, size: f64) -> Result<()> {
        if !size.is_finite() || size < 0.0 {
            return Err(StreamError::Range(format!(
                "chunk size must be a finite, non-negative number, got {}",
                size
            )));
        }
        self.entries.push_back((value, size));
        self.total += size;
        Ok(())
    }

    /// Remove the oldest entry.
    pub fn pop(&mut self) -> Option<(T, f64)> {
        let (value, size) = self.entries.pop_front()?;
        self.total -= size;
        // Floating point drift
        if self.entries.is_empty() || self.total < 0.0 {
            self.total = 0.0;
        }
        Some((value, size))
    }

    pub fn peek(&self) -> Option<&T> {
        self.entries.front().map(|(value, _)| value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total = 0.0;
    }

    pub fn total_size(&self) -> f64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
