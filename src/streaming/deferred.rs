//! Deferred completions.
//!
//! Every stream operation that has to wait hands back a [`Completion`]. The
//! request behind it is registered when the operation is called, not when the
//! future is first polled, so call order is request order.
//!
//! [`Deferred`] is the shared, settle-once cell behind signals that several
//! parties may await (`ready`, `closed`, close and abort requests).

use crate::error::{Result, StreamError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};

// =============================================================================
// Deferred: settle-once shared cell
// =============================================================================

/// A settle-once cell with any number of waiters.
///
/// Each waiter holds its own `watch` receiver, so a dropped wait leaves
/// nothing behind in the cell.
pub struct Deferred<T> {
    cell: Arc<watch::Sender<Option<Result<T>>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T> Deferred<T> {
    fn with(outcome: Option<Result<T>>) -> Self {
        let (cell, _) = watch::channel(outcome);
        Self {
            cell: Arc::new(cell),
        }
    }

    pub fn new() -> Self {
        Self::with(None)
    }

    pub fn resolved(value: T) -> Self {
        Self::with(Some(Ok(value)))
    }

    pub fn rejected(err: StreamError) -> Self {
        Self::with(Some(Err(err)))
    }

    /// Settle the cell. Returns false if it was already settled.
    pub fn settle(&self, outcome: Result<T>) -> bool {
        let mut outcome = Some(outcome);
        self.cell.send_if_modified(|cell| {
            if cell.is_some() {
                return false;
            }
            *cell = outcome.take();
            true
        })
    }

    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, err: StreamError) -> bool {
        self.settle(Err(err))
    }

    pub fn is_settled(&self) -> bool {
        self.cell.borrow().is_some()
    }

    pub fn is_pending(&self) -> bool {
        !self.is_settled()
    }
}

impl<T: Clone> Deferred<T> {
    /// Current outcome, if settled.
    pub fn peek(&self) -> Option<Result<T>> {
        self.cell.borrow().clone()
    }
}

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
    /// Future resolving with a clone of the settled outcome.
    pub fn wait(&self) -> DeferredWait<T> {
        let mut rx = self.cell.subscribe();
        let inner = async move {
            let settled = rx
                .wait_for(Option::is_some)
                .await
                .map(|cell| (*cell).clone());
            match settled {
                Ok(Some(outcome)) => outcome,
                _ => Err(StreamError::state("deferred dropped before settling")),
            }
        };
        DeferredWait {
            inner: inner.boxed(),
        }
    }

    pub fn completion(&self) -> Completion<T> {
        Completion::from_future(self.wait())
    }
}

/// Future returned by [`Deferred::wait`].
pub struct DeferredWait<T> {
    inner: BoxFuture<'static, Result<T>>,
}

impl<T> Future for DeferredWait<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

// =============================================================================
// Completion: the future handed back to callers
// =============================================================================

/// Sending half of a single-consumer completion.
pub(crate) type Settler<T> = oneshot::Sender<Result<T>>;

enum Inner<T> {
    Ready(Option<Result<T>>),
    Oneshot(oneshot::Receiver<Result<T>>),
    Boxed(BoxFuture<'static, Result<T>>),
}

/// Outcome of a stream operation that may finish later.
#[must_use = "completions report the outcome of an operation that already started"]
pub struct Completion<T> {
    inner: Inner<T>,
}

impl<T> Completion<T> {
    pub fn ready(outcome: Result<T>) -> Self {
        Self {
            inner: Inner::Ready(Some(outcome)),
        }
    }

    pub fn ok(value: T) -> Self {
        Self::ready(Ok(value))
    }

    pub fn err(err: StreamError) -> Self {
        Self::ready(Err(err))
    }

    /// Create a pending completion and the settler that finishes it.
    pub(crate) fn pending() -> (Settler<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                inner: Inner::Oneshot(rx),
            },
        )
    }

    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            inner: Inner::Boxed(fut.boxed()),
        }
    }

    /// True if the outcome is already known without polling.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, Inner::Ready(Some(_)))
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            Inner::Ready(_) => "ready",
            Inner::Oneshot(_) => "pending",
            Inner::Boxed(_) => "future",
        };
        f.debug_tuple("Completion").field(&kind).finish()
    }
}

impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Ready(outcome) => Poll::Ready(
                outcome
                    .take()
                    .unwrap_or_else(|| Err(StreamError::state("completion polled after finishing"))),
            ),
            Inner::Oneshot(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(_)) => {
                    Poll::Ready(Err(StreamError::state("stream dropped before settling request")))
                }
                Poll::Pending => Poll::Pending,
            },
            Inner::Boxed(fut) => fut.as_mut().poll(cx),
        }
    }
}

/// Settle a single-consumer request. Returns the value back if the waiter
/// is gone so the caller can hand it to someone else.
pub(crate) fn settle<T>(settler: Settler<T>, outcome: Result<T>) -> Option<Result<T>> {
    settler.send(outcome).err()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deferred_settles_once() {
        let deferred = Deferred::new();
        let wait = deferred.wait();

        assert!(deferred.resolve(7u32));
        assert!(!deferred.reject(StreamError::Aborted));
        assert_eq!(wait.await.unwrap(), 7);
        assert_eq!(deferred.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_deferred_wakes_all_waiters() {
        let deferred: Deferred<()> = Deferred::new();
        let a = tokio::spawn(deferred.wait());
        let b = tokio::spawn(deferred.wait());
        tokio::task::yield_now().await;

        deferred.reject(StreamError::reason("gone"));
        assert_eq!(a.await.unwrap().unwrap_err().to_string(), "gone");
        assert_eq!(b.await.unwrap().unwrap_err().to_string(), "gone");
    }

    #[tokio::test]
    async fn test_completion_pending_then_settled() {
        let (tx, completion) = Completion::pending();
        assert!(!completion.is_ready());
        assert!(settle(tx, Ok("done")).is_none());
        assert_eq!(completion.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_settle_returns_value_when_waiter_dropped() {
        let (tx, completion) = Completion::<u8>::pending();
        drop(completion);
        let back = settle(tx, Ok(3)).unwrap();
        assert_eq!(back.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dropped_settler_reports_state_error() {
        let (tx, completion) = Completion::<()>::pending();
        drop(tx);
        let err = completion.await.unwrap_err();
        assert!(matches!(err, StreamError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_dropped_waits_release_their_slot() {
        let deferred: Deferred<()> = Deferred::new();
        for _ in 0..1000 {
            assert!(deferred.wait().now_or_never().is_none());
        }
        assert_eq!(deferred.cell.receiver_count(), 0);

        let wait = deferred.wait();
        assert_eq!(deferred.cell.receiver_count(), 1);
        deferred.resolve(());
        wait.await.unwrap();
        assert_eq!(deferred.cell.receiver_count(), 0);
    }
}
