//! Queuing strategies: a chunk-size function plus a high-water mark.

use crate::error::{Result, StreamError};
use std::sync::Arc;

/// Default high-water mark for readable and writable streams.
pub const DEFAULT_HIGH_WATER_MARK: f64 = 1.0;

/// High-water mark of the readable side of a transform stream.
pub const TRANSFORM_READABLE_HIGH_WATER_MARK: f64 = 0.0;

/// Chunk-size function. A failing size function errors the stream.
pub type SizeFn<T> = Arc<dyn Fn(&T) -> Result<f64> + Send + Sync>;

/// Chunk-size function plus buffering threshold.
pub struct QueuingStrategy<T> {
    high_water_mark: f64,
    size: SizeFn<T>,
}

impl<T> Clone for QueuingStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            high_water_mark: self.high_water_mark,
            size: Arc::clone(&self.size),
        }
    }
}

impl<T> std::fmt::Debug for QueuingStrategy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> Default for QueuingStrategy<T> {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            size: Arc::new(|_: &T| Ok(1.0)),
        }
    }
}

fn validate_high_water_mark(high_water_mark: f64) -> Result<f64> {
    if high_water_mark.is_nan() || high_water_mark < 0.0 {
        return Err(StreamError::Range(format!(
            "high water mark must be a non-negative number, got {}",
            high_water_mark
        )));
    }
    Ok(high_water_mark)
}

impl<T: 'static> QueuingStrategy<T> {
    /// Every chunk counts as one (`CountQueuingStrategy`).
    pub fn count(high_water_mark: f64) -> Result<Self> {
        Ok(Self {
            high_water_mark: validate_high_water_mark(high_water_mark)?,
            size: Arc::new(|_: &T| Ok(1.0)),
        })
    }

    /// Infallible custom size function.
    pub fn with_size<F>(high_water_mark: f64, size: F) -> Result<Self>
    where
        F: Fn(&T) -> f64 + Send + Sync + 'static,
    {
        Ok(Self {
            high_water_mark: validate_high_water_mark(high_water_mark)?,
            size: Arc::new(move |chunk: &T| Ok(size(chunk))),
        })
    }

    /// Custom size function that may fail.
    pub fn try_with_size<F>(high_water_mark: f64, size: F) -> Result<Self>
    where
        F: Fn(&T) -> Result<f64> + Send + Sync + 'static,
    {
        Ok(Self {
            high_water_mark: validate_high_water_mark(high_water_mark)?,
            size: Arc::new(size),
        })
    }
}

impl<T> QueuingStrategy<T> {
    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    /// Size of a chunk as reported by the strategy.
    pub fn size_of(&self, chunk: &T) -> Result<f64> {
        (self.size)(chunk)
    }

    /// `highWaterMark - queued`.
    pub fn desired_size(&self, queued: f64) -> f64 {
        self.high_water_mark - queued
    }
}

impl<T: AsRef<[u8]> + 'static> QueuingStrategy<T> {
    /// Size is the chunk's byte length (`ByteLengthQueuingStrategy`).
    pub fn byte_length(high_water_mark: f64) -> Result<Self> {
        Ok(Self {
            high_water_mark: validate_high_water_mark(high_water_mark)?,
            size: Arc::new(|chunk: &T| Ok(chunk.as_ref().len() as f64)),
        })
    }
}
