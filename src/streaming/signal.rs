//! Cancellation tokens carrying an abort reason.
//!
//! Used by the piping engine (`PipeOptions::signal`) and handed to sinks
//! through `WritableStreamController::signal`.

use crate::error::{Result, StreamError};
use crate::streaming::deferred::{Deferred, DeferredWait};
use std::time::Duration;

/// Owner side of an [`AbortSignal`].
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Abort with the default reason.
    pub fn abort(&self) {
        self.signal.fire(StreamError::Aborted);
    }

    pub fn abort_with(&self, reason: StreamError) {
        self.signal.fire(reason);
    }
}

/// Observer side: cheap to clone, fires at most once.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    reason: Deferred<StreamError>,
}

impl AbortSignal {
    /// A signal that has already fired.
    pub fn aborted_with(reason: StreamError) -> Self {
        Self {
            reason: Deferred::resolved(reason),
        }
    }

    /// A signal that fires with `StreamError::TimedOut` after `duration`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn timeout(duration: Duration) -> Self {
        let signal = Self::default();
        let fire = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            fire.fire(StreamError::TimedOut);
        });
        signal
    }

    pub fn aborted(&self) -> bool {
        self.reason.is_settled()
    }

    pub fn reason(&self) -> Option<StreamError> {
        self.reason.peek().and_then(|outcome| outcome.ok())
    }

    /// Resolves with the abort reason once the signal fires.
    pub fn cancelled(&self) -> AbortWait {
        AbortWait {
            inner: self.reason.wait(),
        }
    }

    /// Error out if the signal has fired.
    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    pub(crate) fn fire(&self, reason: StreamError) -> bool {
        let fired = self.reason.resolve(reason);
        if fired {
            tracing::trace!("abort signal fired");
        }
        fired
    }
}

/// Future returned by [`AbortSignal::cancelled`].
pub struct AbortWait {
    inner: DeferredWait<StreamError>,
}

impl std::future::Future for AbortWait {
    type Output = StreamError;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        std::pin::Pin::new(&mut self.inner)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|err| err))
    }
}
