//! Error types shared by every stream side.
//!
//! A single `StreamError` value may settle many outstanding requests (every
//! pending read, the `closed` signal, queued writes), so it is cheap to clone.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Result alias used throughout the crate.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// Operation is invalid for the stream's current state.
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Stream already has a reader or writer bound to it.
    #[error("stream is locked")]
    Locked,

    /// The reader or writer used for this call no longer holds the lock.
    #[error("lock was released")]
    Released,

    /// High-water mark or chunk size outside the accepted range.
    #[error("out of range: {0}")]
    Range(String),

    /// Default reason carried by an aborted signal.
    #[error("operation was aborted")]
    Aborted,

    /// Reason carried by a signal created with `AbortSignal::timeout`.
    #[error("operation timed out")]
    TimedOut,

    /// Caller-supplied reason for cancel, abort or error.
    #[error("{0}")]
    Reason(Arc<str>),

    /// Failure reported by a source, sink or transformer algorithm.
    #[error("{0:#}")]
    Other(Arc<anyhow::Error>),

    /// Cancellation reasons of both branches of a teed stream.
    #[error("{}", CombinedDisplay(.0))]
    Combined(Arc<[StreamError]>),
}

impl StreamError {
    pub fn state(msg: impl Into<Cow<'static, str>>) -> Self {
        StreamError::InvalidState(msg.into())
    }

    pub fn reason(text: impl AsRef<str>) -> Self {
        StreamError::Reason(Arc::from(text.as_ref()))
    }

    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        StreamError::Other(Arc::new(err.into()))
    }

    /// True for errors raised because a lock was held or released.
    pub fn is_lock_error(&self) -> bool {
        matches!(self, StreamError::Locked | StreamError::Released)
    }
}

impl From<anyhow::Error> for StreamError {
    fn from(err: anyhow::Error) -> Self {
        StreamError::Other(Arc::new(err))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::other(err)
    }
}

struct CombinedDisplay<'a>(&'a [StreamError]);

impl fmt::Display for CombinedDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}
