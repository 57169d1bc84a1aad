//! Transform streams: a writable side feeding a readable side through a
//! [`Transformer`].
//!
//! The writable side only hands a chunk to the transformer while the
//! readable side wants data. With the default strategies (writable
//! high-water mark 1, readable 0) at most one chunk waits between the two.

use crate::error::{Result, StreamError};
use crate::streaming::deferred::{Deferred, DeferredWait};
use crate::streaming::pipe::PipeOptions;
use crate::streaming::readable::{ReadableStream, ReadableStreamController, UnderlyingSource};
use crate::streaming::strategy::{QueuingStrategy, TRANSFORM_READABLE_HIGH_WATER_MARK};
use crate::streaming::writable::{UnderlyingSink, WritableStream, WritableStreamController};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::Mutex as AsyncMutex;

/// User algorithms of a [`TransformStream`].
#[async_trait]
pub trait Transformer<I: Send + 'static, O: Send + 'static>: Send + 'static {
    async fn start(&mut self, _controller: &TransformStreamController<O>) -> Result<()> {
        Ok(())
    }

    async fn transform(&mut self, chunk: I, controller: &TransformStreamController<O>) -> Result<()>;

    /// Runs once when the writable side closes, before the readable closes.
    async fn flush(&mut self, _controller: &TransformStreamController<O>) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Shared state
// =============================================================================

struct Flow {
    backpressure: bool,
    change: Deferred<()>,
}

struct TransformShared<I, O> {
    transformer: AsyncMutex<Box<dyn Transformer<I, O>>>,
    readable: OnceLock<ReadableStreamController<O>>,
    writable: OnceLock<WritableStreamController<I>>,
    flow: Mutex<Flow>,
    started: Deferred<()>,
}

/// Operations a [`TransformStreamController`] forwards, erased over the
/// input type.
trait TransformOps<O>: Send + Sync {
    fn enqueue(&self, chunk: O) -> Result<()>;
    fn error(&self, err: StreamError);
    fn terminate(&self);
    fn desired_size(&self) -> Option<f64>;
}

impl<I: Send + 'static, O: Send + 'static> TransformShared<I, O> {
    fn readable(&self) -> Result<&ReadableStreamController<O>> {
        self.readable
            .get()
            .ok_or_else(|| StreamError::state("transform stream is not wired up"))
    }

    fn writable(&self) -> Result<&WritableStreamController<I>> {
        self.writable
            .get()
            .ok_or_else(|| StreamError::state("transform stream is not wired up"))
    }

    /// Flip the backpressure flag and wake anyone waiting for a change.
    /// Returns a wait on the next change.
    fn set_backpressure(&self, backpressure: bool) -> DeferredWait<()> {
        let mut flow = self.flow.lock();
        flow.change.resolve(());
        flow.change = Deferred::new();
        flow.backpressure = backpressure;
        flow.change.wait()
    }

    fn error_writable_and_unblock_write(&self, err: StreamError) {
        if let Ok(writable) = self.writable() {
            writable.error(err);
        }
        let backpressure = self.flow.lock().backpressure;
        if backpressure {
            let _ = self.set_backpressure(false);
        }
    }

    fn controller(self: &Arc<Self>) -> TransformStreamController<O> {
        let ops: Weak<dyn TransformOps<O>> = Arc::downgrade(self) as Weak<dyn TransformOps<O>>;
        TransformStreamController { ops }
    }

    async fn perform_transform(self: &Arc<Self>, chunk: I) -> Result<()> {
        let controller = self.controller();
        let result = self
            .transformer
            .lock()
            .await
            .transform(chunk, &controller)
            .await;
        if let Err(err) = &result {
            TransformOps::error(&**self, err.clone());
        }
        result
    }
}

impl<I: Send + 'static, O: Send + 'static> TransformOps<O> for TransformShared<I, O> {
    fn enqueue(&self, chunk: O) -> Result<()> {
        let readable = self.readable()?;
        if !readable.can_close_or_enqueue() {
            return Err(StreamError::state("readable side is not accepting chunks"));
        }
        if let Err(err) = readable.enqueue(chunk) {
            self.error_writable_and_unblock_write(err.clone());
            return Err(readable.errored_with().unwrap_or(err));
        }
        if readable.has_backpressure() && !self.flow.lock().backpressure {
            let _ = self.set_backpressure(true);
        }
        Ok(())
    }

    fn error(&self, err: StreamError) {
        tracing::debug!(error = %err, "transform stream errored");
        if let Ok(readable) = self.readable() {
            readable.error(err.clone());
        }
        self.error_writable_and_unblock_write(err);
    }

    fn terminate(&self) {
        tracing::debug!("transform stream terminated");
        if let Ok(readable) = self.readable() {
            let _ = readable.close();
        }
        self.error_writable_and_unblock_write(StreamError::state("transform stream terminated"));
    }

    fn desired_size(&self) -> Option<f64> {
        self.readable().ok().and_then(|readable| readable.desired_size())
    }
}

// =============================================================================
// TransformStreamController
// =============================================================================

/// Handle given to a [`Transformer`] for producing output.
pub struct TransformStreamController<O> {
    ops: Weak<dyn TransformOps<O>>,
}

impl<O> Clone for TransformStreamController<O> {
    fn clone(&self) -> Self {
        Self {
            ops: Weak::clone(&self.ops),
        }
    }
}

impl<O> std::fmt::Debug for TransformStreamController<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformStreamController").finish_non_exhaustive()
    }
}

impl<O> TransformStreamController<O> {
    fn ops(&self) -> Result<Arc<dyn TransformOps<O>>> {
        self.ops
            .upgrade()
            .ok_or_else(|| StreamError::state("transform stream was dropped"))
    }

    /// Emit a chunk on the readable side.
    pub fn enqueue(&self, chunk: O) -> Result<()> {
        self.ops()?.enqueue(chunk)
    }

    /// Error both sides.
    pub fn error(&self, err: StreamError) {
        if let Ok(ops) = self.ops() {
            ops.error(err);
        }
    }

    /// Close the readable side and error the writable side.
    pub fn terminate(&self) {
        if let Ok(ops) = self.ops() {
            ops.terminate();
        }
    }

    /// Desired size of the readable side.
    pub fn desired_size(&self) -> Option<f64> {
        self.ops().ok().and_then(|ops| ops.desired_size())
    }
}

// =============================================================================
// Internal source and sink
// =============================================================================

struct TransformSource<I, O> {
    shared: Arc<TransformShared<I, O>>,
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> UnderlyingSource<O> for TransformSource<I, O> {
    async fn start(&mut self, _controller: &ReadableStreamController<O>) -> Result<()> {
        self.shared.started.wait().await
    }

    /// Lift backpressure, then hold the pull open until it changes again.
    async fn pull(&mut self, _controller: &ReadableStreamController<O>) -> Result<()> {
        let change = self.shared.set_backpressure(false);
        let _ = change.await;
        Ok(())
    }

    async fn cancel(&mut self, reason: StreamError) -> Result<()> {
        self.shared.error_writable_and_unblock_write(reason);
        Ok(())
    }
}

struct TransformSink<I, O> {
    shared: Arc<TransformShared<I, O>>,
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> UnderlyingSink<I> for TransformSink<I, O> {
    async fn start(&mut self, _controller: &WritableStreamController<I>) -> Result<()> {
        self.shared.started.wait().await
    }

    async fn write(&mut self, chunk: I, controller: &WritableStreamController<I>) -> Result<()> {
        let blocked = {
            let flow = self.shared.flow.lock();
            flow.backpressure.then(|| flow.change.wait())
        };
        if let Some(change) = blocked {
            // Nobody may ever read; an abort must still get through.
            let abort = controller.signal();
            tokio::select! {
                _ = change => {}
                reason = abort.cancelled() => return Err(reason),
            }
            if let Some(err) = controller.erroring_with() {
                return Err(err);
            }
        }
        self.shared.perform_transform(chunk).await
    }

    async fn close(&mut self) -> Result<()> {
        let controller = self.shared.controller();
        let flushed = self.shared.transformer.lock().await.flush(&controller).await;
        let readable = self.shared.readable()?;
        if let Err(err) = flushed {
            readable.error(err.clone());
            return Err(err);
        }
        if let Some(err) = readable.errored_with() {
            return Err(err);
        }
        if readable.can_close_or_enqueue() {
            readable.close()?;
        }
        Ok(())
    }

    async fn abort(&mut self, reason: StreamError) -> Result<()> {
        self.shared.readable()?.error(reason);
        Ok(())
    }
}

// =============================================================================
// TransformStream
// =============================================================================

/// A writable/readable pair joined by a [`Transformer`].
pub struct TransformStream<I, O> {
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
}

impl<I, O> std::fmt::Debug for TransformStream<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformStream")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}

impl<I: Send + 'static, O: Send + 'static> TransformStream<I, O> {
    /// Default strategies: writable count 1, readable count 0.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(transformer: impl Transformer<I, O>) -> Result<Self> {
        Self::with_strategies(
            transformer,
            QueuingStrategy::default(),
            QueuingStrategy::count(TRANSFORM_READABLE_HIGH_WATER_MARK)?,
        )
    }

    pub fn with_strategies(
        transformer: impl Transformer<I, O>,
        writable_strategy: QueuingStrategy<I>,
        readable_strategy: QueuingStrategy<O>,
    ) -> Result<Self> {
        let shared = Arc::new(TransformShared {
            transformer: AsyncMutex::new(Box::new(transformer) as Box<dyn Transformer<I, O>>),
            readable: OnceLock::new(),
            writable: OnceLock::new(),
            flow: Mutex::new(Flow {
                backpressure: false,
                change: Deferred::new(),
            }),
            started: Deferred::new(),
        });

        let writable = WritableStream::unstarted(
            Box::new(TransformSink {
                shared: Arc::clone(&shared),
            }),
            writable_strategy,
        );
        let readable = ReadableStream::unstarted(
            Box::new(TransformSource {
                shared: Arc::clone(&shared),
            }),
            readable_strategy,
        );
        let _ = shared.readable.set(readable.controller());
        let _ = shared.writable.set(writable.controller());
        let _ = shared.set_backpressure(true);

        writable.start();
        readable.start();

        let starter = Arc::clone(&shared);
        tokio::spawn(async move {
            let controller = starter.controller();
            let result = starter.transformer.lock().await.start(&controller).await;
            starter.started.settle(result);
        });

        Ok(Self { readable, writable })
    }

    pub fn readable(&self) -> &ReadableStream<O> {
        &self.readable
    }

    pub fn writable(&self) -> &WritableStream<I> {
        &self.writable
    }

    pub fn into_parts(self) -> (WritableStream<I>, ReadableStream<O>) {
        (self.writable, self.readable)
    }
}

// =============================================================================
// Built-in transformers
// =============================================================================

struct Identity;

#[async_trait]
impl<T: Send + 'static> Transformer<T, T> for Identity {
    async fn transform(&mut self, chunk: T, controller: &TransformStreamController<T>) -> Result<()> {
        controller.enqueue(chunk)
    }
}

struct MapChunks<F, I> {
    map: F,
    _input: PhantomData<fn(I)>,
}

#[async_trait]
impl<F, I, O> Transformer<I, O> for MapChunks<F, I>
where
    F: FnMut(I) -> Result<O> + Send + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    async fn transform(&mut self, chunk: I, controller: &TransformStreamController<O>) -> Result<()> {
        let mapped = (self.map)(chunk)?;
        controller.enqueue(mapped)
    }
}

impl<T: Send + 'static> TransformStream<T, T> {
    /// Passes every chunk through unchanged.
    pub fn identity() -> Result<Self> {
        Self::new(Identity)
    }
}

impl<I: Send + 'static, O: Send + 'static> TransformStream<I, O> {
    /// One output chunk per input chunk. A mapping error errors both sides.
    pub fn map<F>(map: F) -> Result<Self>
    where
        F: FnMut(I) -> Result<O> + Send + 'static,
    {
        Self::new(MapChunks {
            map,
            _input: PhantomData,
        })
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Pipe into `transform`'s writable side and return its readable side.
    ///
    /// The pipe runs in the background; its outcome is observed through the
    /// returned stream.
    pub fn pipe_through<O: Send + 'static>(
        &self,
        transform: TransformStream<T, O>,
        options: PipeOptions,
    ) -> Result<ReadableStream<O>> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        let (writable, readable) = transform.into_parts();
        if writable.locked() {
            return Err(StreamError::Locked);
        }
        let pipe = self.pipe_to(&writable, options);
        tokio::spawn(async move {
            if let Err(err) = pipe.await {
                tracing::debug!(error = %err, "pipe_through finished with error");
            }
        });
        Ok(readable)
    }
}
