//! Exclusive writer over a writable stream.

use crate::error::{Result, StreamError};
use crate::streaming::deferred::Completion;
use crate::streaming::writable::{WritableShared, WritableState};
use std::sync::Arc;

/// Holds the stream's lock until released or dropped.
pub struct WritableStreamWriter<T> {
    shared: Arc<WritableShared<T>>,
    lock_id: u64,
}

impl<T> std::fmt::Debug for WritableStreamWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableStreamWriter")
            .field("lock_id", &self.lock_id)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> WritableStreamWriter<T> {
    pub(crate) fn acquire(shared: Arc<WritableShared<T>>) -> Result<Self> {
        let lock_id = shared.acquire_lock()?;
        Ok(Self { shared, lock_id })
    }

    fn check_lock(&self) -> Result<()> {
        if self.shared.holds_lock(self.lock_id) {
            Ok(())
        } else {
            Err(StreamError::Released)
        }
    }

    /// Queue a chunk. Resolves once the sink has accepted it.
    ///
    /// Does not wait for [`ready`](Self::ready); writing past the
    /// high-water mark only grows the queue.
    pub fn write(&self, chunk: T) -> Completion<()> {
        if let Err(err) = self.check_lock() {
            return Completion::err(err);
        }
        self.shared.write(chunk)
    }

    /// Close after every queued write finishes.
    pub fn close(&self) -> Completion<()> {
        if let Err(err) = self.check_lock() {
            return Completion::err(err);
        }
        self.shared.close()
    }

    /// Abort: queued writes are discarded and the sink's `abort` runs once
    /// any in-flight operation completes.
    pub fn abort(&self, reason: StreamError) -> Completion<()> {
        if let Err(err) = self.check_lock() {
            return Completion::err(err);
        }
        self.shared.abort(reason)
    }

    /// Resolves whenever the desired size turns positive.
    pub fn ready(&self) -> Completion<()> {
        self.shared.ready(self.lock_id)
    }

    /// Resolves when the stream closes, rejects when it errors.
    pub fn closed(&self) -> Completion<()> {
        self.shared.closed(self.lock_id)
    }

    /// `None` while erroring or errored, `0` once closed.
    pub fn desired_size(&self) -> Result<Option<f64>> {
        self.shared.desired_size(self.lock_id)
    }

    pub(crate) fn stream_state(&self) -> WritableState {
        self.shared.state()
    }

    pub(crate) fn close_queued_or_closed(&self) -> bool {
        self.shared.close_queued_or_closed()
    }

    pub(crate) fn errored_with(&self) -> Option<StreamError> {
        self.shared.errored_with()
    }

    /// Close unless a close is already underway; used when forwarding a
    /// source's close through a pipe.
    pub(crate) fn close_with_error_propagation(&self) -> Completion<()> {
        if let Err(err) = self.check_lock() {
            return Completion::err(err);
        }
        if self.close_queued_or_closed() {
            return Completion::ok(());
        }
        if let Some(err) = self.errored_with() {
            return Completion::err(err);
        }
        self.shared.close()
    }

    /// Release the lock. `ready` and `closed` of this writer reject.
    pub fn release_lock(self) {
        drop(self);
    }
}

impl<T> Drop for WritableStreamWriter<T> {
    fn drop(&mut self) {
        self.shared.release_lock(self.lock_id);
    }
}

#[cfg(test)]
mod tests {
    use crate::streaming::writable::{UnderlyingSink, WritableStream, WritableStreamController};
    use crate::{Result, StreamError};
    use async_trait::async_trait;

    struct Discard;

    #[async_trait]
    impl UnderlyingSink<u8> for Discard {
        async fn write(&mut self, _chunk: u8, _controller: &WritableStreamController<u8>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_second_writer_rejected_until_release() {
        let stream = WritableStream::new(Discard);
        let writer = stream.get_writer().unwrap();
        assert!(matches!(stream.get_writer(), Err(StreamError::Locked)));
        assert!(matches!(stream.close().await, Err(StreamError::Locked)));

        writer.release_lock();
        let writer = stream.get_writer().unwrap();
        writer.write(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_with_error_propagation_is_idempotent() {
        let stream = WritableStream::new(Discard);
        let writer = stream.get_writer().unwrap();
        let first = writer.close_with_error_propagation();
        writer.close_with_error_propagation().await.unwrap();
        first.await.unwrap();
        writer.close_with_error_propagation().await.unwrap();
    }

    #[tokio::test]
    async fn test_desired_size_after_close() {
        let stream = WritableStream::new(Discard);
        let writer = stream.get_writer().unwrap();
        writer.close().await.unwrap();
        assert_eq!(writer.desired_size().unwrap(), Some(0.0));
    }
}
