//! Exclusive reader over a readable stream.

use crate::error::{Result, StreamError};
use crate::streaming::deferred::{Completion, Deferred};
use crate::streaming::readable::{ReadResult, ReadableShared, ReadableState};
use futures::Stream;
use std::sync::Arc;

/// Holds the stream's lock until released or dropped.
///
/// Every operation fails with [`StreamError::Released`] once the lock is no
/// longer held by this reader.
pub struct ReadableStreamReader<T> {
    shared: Arc<ReadableShared<T>>,
    lock_id: u64,
    closed: Deferred<()>,
}

impl<T> std::fmt::Debug for ReadableStreamReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadableStreamReader")
            .field("lock_id", &self.lock_id)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ReadableStreamReader<T> {
    pub(crate) fn acquire(shared: Arc<ReadableShared<T>>) -> Result<Self> {
        let (lock_id, closed) = shared.acquire_lock()?;
        Ok(Self {
            shared,
            lock_id,
            closed,
        })
    }

    /// Next chunk, or [`ReadResult::Done`] after the stream closed.
    ///
    /// The request is queued immediately; calling `read` twice before
    /// awaiting either yields chunks in call order.
    pub fn read(&self) -> Completion<ReadResult<T>> {
        self.shared.read(self.lock_id)
    }

    /// Cancel the underlying stream.
    pub fn cancel(&self, reason: StreamError) -> Completion<()> {
        if !self.shared.holds_lock(self.lock_id) {
            return Completion::err(StreamError::Released);
        }
        self.shared.cancel(reason)
    }

    /// Resolves when the stream closes, rejects when it errors or the
    /// lock is released first.
    pub fn closed(&self) -> Completion<()> {
        self.closed.completion()
    }

    pub(crate) fn stream_state(&self) -> ReadableState {
        self.shared.state()
    }

    pub(crate) fn errored_with(&self) -> Option<StreamError> {
        self.shared.errored_with()
    }

    /// Release the lock. Reads still pending stay pending.
    pub fn release_lock(self) {
        drop(self);
    }

    /// Adapt into a [`futures::Stream`]. The lock is released when the
    /// returned stream ends or is dropped.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send {
        futures::stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            match reader.read().await {
                Ok(ReadResult::Chunk(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(ReadResult::Done) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

impl<T> Drop for ReadableStreamReader<T> {
    fn drop(&mut self) {
        self.shared.release_lock(self.lock_id);
    }
}

#[cfg(test)]
mod tests {
    use crate::streaming::readable::ReadableStream;
    use crate::StreamError;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_into_stream_yields_all_chunks() {
        let stream = ReadableStream::from_iter(vec![1, 2, 3]);
        let reader = stream.get_reader().unwrap();
        let chunks: Vec<_> = reader
            .into_stream()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec![1, 2, 3]);
        assert!(!stream.locked());
    }

    #[tokio::test]
    async fn test_release_rejects_closed() {
        let stream = ReadableStream::from_iter(vec![1u8]);
        let reader = stream.get_reader().unwrap();
        let closed = reader.closed();
        reader.release_lock();
        assert!(matches!(closed.await, Err(StreamError::Released)));
    }

    #[tokio::test]
    async fn test_cancel_through_reader() {
        let stream = ReadableStream::from_iter(0..100);
        let reader = stream.get_reader().unwrap();
        reader.cancel(StreamError::reason("enough")).await.unwrap();
        assert!(reader.read().await.unwrap().is_done());
        reader.closed().await.unwrap();
    }
}
