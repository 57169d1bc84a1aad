//! Ready-made sources: iterators and async streams.

use crate::error::{Result, StreamError};
use crate::streaming::readable::{ReadableStream, ReadableStreamController, UnderlyingSource};
use crate::streaming::strategy::QueuingStrategy;
use async_trait::async_trait;
use futures::{Stream, StreamExt};

/// Enqueues one item per pull and closes when the iterator runs dry.
struct IterSource<I> {
    iter: I,
}

#[async_trait]
impl<I> UnderlyingSource<I::Item> for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    async fn pull(&mut self, controller: &ReadableStreamController<I::Item>) -> Result<()> {
        match self.iter.next() {
            Some(chunk) => controller.enqueue(chunk),
            None => controller.close(),
        }
    }
}

/// Forwards items of an async stream; an `Err` item errors the readable.
struct AsyncSource<S> {
    inner: Option<S>,
}

#[async_trait]
impl<S, T> UnderlyingSource<T> for AsyncSource<S>
where
    S: Stream<Item = Result<T>> + Send + Unpin + 'static,
    T: Send + 'static,
{
    async fn pull(&mut self, controller: &ReadableStreamController<T>) -> Result<()> {
        let Some(inner) = self.inner.as_mut() else {
            return controller.close();
        };
        match inner.next().await {
            Some(Ok(chunk)) => controller.enqueue(chunk),
            Some(Err(err)) => Err(err),
            None => {
                self.inner = None;
                controller.close()
            }
        }
    }

    async fn cancel(&mut self, reason: StreamError) -> Result<()> {
        tracing::trace!(reason = %reason, "dropping cancelled async source");
        self.inner = None;
        Ok(())
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// A stream that yields every item of `iter`, then closes.
    #[allow(clippy::should_implement_trait)]
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(IterSource {
            iter: iter.into_iter(),
        })
    }

    /// Wrap an async stream of fallible items.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T>> + Send + Unpin + 'static,
    {
        Self::new(AsyncSource {
            inner: Some(stream),
        })
    }

    pub fn from_stream_with_strategy<S>(stream: S, strategy: QueuingStrategy<T>) -> Self
    where
        S: Stream<Item = Result<T>> + Send + Unpin + 'static,
    {
        Self::with_strategy(
            AsyncSource {
                inner: Some(stream),
            },
            strategy,
        )
    }
}
