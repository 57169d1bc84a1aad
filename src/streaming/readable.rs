//! Readable streams.
//!
//! A lazy, pull-driven producer of chunks. The source is asked for more data
//! only while the internal queue sits below its high-water mark or a reader
//! is waiting on an empty queue.
//!
//! ```text
//! source --enqueue--> [ queue ] --read--> reader
//!    ^                    |
//!    +------- pull -------+   (desiredSize > 0 or pending read)
//! ```

use crate::error::{Result, StreamError};
use crate::streaming::deferred::{self, Completion, Deferred, Settler};
use crate::streaming::queue::SizedQueue;
use crate::streaming::reader::ReadableStreamReader;
use crate::streaming::strategy::QueuingStrategy;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;

// =============================================================================
// Public types
// =============================================================================

/// Lifecycle of a readable stream. `Closed` and `Errored` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableState {
    Readable,
    Closed,
    Errored,
}

/// Outcome of a successful read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult<T> {
    /// The oldest queued chunk
    Chunk(T),
    /// The stream closed and every chunk has been read
    Done,
}

impl<T> ReadResult<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, ReadResult::Done)
    }

    pub fn into_chunk(self) -> Option<T> {
        match self {
            ReadResult::Chunk(chunk) => Some(chunk),
            ReadResult::Done => None,
        }
    }
}

/// Producer side algorithms consumed by a [`ReadableStream`].
///
/// `start` runs once before the first `pull`. `pull` is never invoked while
/// a previous `pull` is outstanding. `cancel` runs at most once.
#[async_trait]
pub trait UnderlyingSource<T: Send + 'static>: Send + 'static {
    async fn start(&mut self, _controller: &ReadableStreamController<T>) -> Result<()> {
        Ok(())
    }

    async fn pull(&mut self, _controller: &ReadableStreamController<T>) -> Result<()> {
        Ok(())
    }

    async fn cancel(&mut self, _reason: StreamError) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Controller state
// =============================================================================

struct LockSlot {
    id: u64,
    closed: Deferred<()>,
}

pub(crate) struct ReadableCore<T> {
    state: ReadableState,
    stored_error: Option<StreamError>,
    disturbed: bool,
    queue: SizedQueue<T>,
    strategy: QueuingStrategy<T>,
    started: bool,
    pulling: bool,
    pull_again: bool,
    close_requested: bool,
    read_requests: VecDeque<Settler<ReadResult<T>>>,
    lock: Option<LockSlot>,
    next_lock_id: u64,
    pull_task: Option<AbortHandle>,
}

impl<T> ReadableCore<T> {
    fn new(strategy: QueuingStrategy<T>) -> Self {
        Self {
            state: ReadableState::Readable,
            stored_error: None,
            disturbed: false,
            queue: SizedQueue::new(),
            strategy,
            started: false,
            pulling: false,
            pull_again: false,
            close_requested: false,
            read_requests: VecDeque::new(),
            lock: None,
            next_lock_id: 1,
            pull_task: None,
        }
    }

    fn can_close_or_enqueue(&self) -> bool {
        !self.close_requested && self.state == ReadableState::Readable
    }

    fn desired_size(&self) -> Option<f64> {
        match self.state {
            ReadableState::Errored => None,
            ReadableState::Closed => Some(0.0),
            ReadableState::Readable => Some(self.strategy.desired_size(self.queue.total_size())),
        }
    }

    fn should_call_pull(&self) -> bool {
        if !self.can_close_or_enqueue() || !self.started {
            return false;
        }
        if self.read_requests.iter().any(|tx| !tx.is_closed()) {
            return true;
        }
        self.desired_size().is_some_and(|size| size > 0.0)
    }

    fn has_backpressure(&self) -> bool {
        !self.should_call_pull()
    }

    /// Transition to `Closed`: every pending read resolves as done.
    fn close_stream(&mut self) {
        self.state = ReadableState::Closed;
        for tx in self.read_requests.drain(..) {
            let _ = deferred::settle(tx, Ok(ReadResult::Done));
        }
        if let Some(slot) = &self.lock {
            slot.closed.resolve(());
        }
        tracing::debug!("readable stream closed");
    }

    /// Transition to `Errored`: the queue is dropped and every pending read
    /// rejects with `err`.
    fn error_stream(&mut self, err: StreamError) {
        if self.state != ReadableState::Readable {
            return;
        }
        tracing::debug!(error = %err, "readable stream errored");
        self.state = ReadableState::Errored;
        self.stored_error = Some(err.clone());
        self.queue.clear();
        for tx in self.read_requests.drain(..) {
            let _ = deferred::settle(tx, Err(err.clone()));
        }
        if let Some(slot) = &self.lock {
            slot.closed.reject(err);
        }
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::state("stream errored"))
    }

    fn enqueue(&mut self, chunk: T) -> Result<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::state(
                "cannot enqueue on a closed, closing or errored stream",
            ));
        }

        // The oldest live read request takes the chunk directly.
        let mut chunk = chunk;
        while let Some(tx) = self.read_requests.pop_front() {
            match deferred::settle(tx, Ok(ReadResult::Chunk(chunk))) {
                None => return Ok(()),
                Some(Ok(ReadResult::Chunk(returned))) => chunk = returned,
                Some(_) => return Ok(()),
            }
        }

        let size = match self.strategy.size_of(&chunk) {
            Ok(size) => size,
            Err(err) => {
                self.error_stream(err.clone());
                return Err(err);
            }
        };
        if let Err(err) = self.queue.push(chunk, size) {
            self.error_stream(err.clone());
            return Err(err);
        }
        Ok(())
    }

    fn request_close(&mut self) -> Result<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::state(
                "cannot close a closed, closing or errored stream",
            ));
        }
        self.close_requested = true;
        if self.queue.is_empty() {
            self.close_stream();
        }
        Ok(())
    }

    fn read(&mut self) -> Completion<ReadResult<T>> {
        self.disturbed = true;
        match self.state {
            ReadableState::Closed => Completion::ok(ReadResult::Done),
            ReadableState::Errored => Completion::err(self.stored_error()),
            ReadableState::Readable => {
                if let Some((chunk, _)) = self.queue.pop() {
                    if self.close_requested && self.queue.is_empty() {
                        self.close_stream();
                    }
                    Completion::ok(ReadResult::Chunk(chunk))
                } else {
                    let (tx, completion) = Completion::pending();
                    self.read_requests.push_back(tx);
                    completion
                }
            }
        }
    }

    fn holds_lock(&self, id: u64) -> bool {
        self.lock.as_ref().is_some_and(|slot| slot.id == id)
    }
}

// =============================================================================
// Shared stream state
// =============================================================================

pub(crate) struct ReadableShared<T> {
    core: Mutex<ReadableCore<T>>,
    source: AsyncMutex<Box<dyn UnderlyingSource<T>>>,
}

impl<T: Send + 'static> ReadableShared<T> {
    fn new(source: Box<dyn UnderlyingSource<T>>, strategy: QueuingStrategy<T>) -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(ReadableCore::new(strategy)),
            source: AsyncMutex::new(source),
        })
    }

    fn start(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let controller = ReadableStreamController::new(&shared);
            let result = shared.source.lock().await.start(&controller).await;
            {
                let mut core = shared.core.lock();
                core.started = true;
                if let Err(err) = result {
                    core.error_stream(err);
                    return;
                }
            }
            shared.call_pull_if_needed();
        });
    }

    /// Schedule a pull if the controller wants more data. A request made
    /// while a pull is outstanding collapses into a single re-pull.
    pub(crate) fn call_pull_if_needed(self: &Arc<Self>) {
        let mut core = self.core.lock();
        if !core.should_call_pull() {
            return;
        }
        if core.pulling {
            core.pull_again = true;
            return;
        }
        core.pulling = true;
        tracing::trace!("scheduling pull");

        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move { shared.run_pull().await });
        core.pull_task = Some(handle.abort_handle());
    }

    async fn run_pull(self: Arc<Self>) {
        let controller = ReadableStreamController::new(&self);
        let result = {
            let mut source = self.source.lock().await;
            if !self.core.lock().can_close_or_enqueue() {
                Ok(())
            } else {
                source.pull(&controller).await
            }
        };

        let pull_again = {
            let mut core = self.core.lock();
            core.pulling = false;
            core.pull_task = None;
            match result {
                Ok(()) => std::mem::take(&mut core.pull_again),
                Err(err) => {
                    core.error_stream(err);
                    false
                }
            }
        };
        if pull_again {
            self.call_pull_if_needed();
        }
    }

    pub(crate) fn enqueue(self: &Arc<Self>, chunk: T) -> Result<()> {
        self.core.lock().enqueue(chunk)?;
        self.call_pull_if_needed();
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<()> {
        self.core.lock().request_close()
    }

    pub(crate) fn error(&self, err: StreamError) {
        self.core.lock().error_stream(err);
    }

    pub(crate) fn desired_size(&self) -> Option<f64> {
        self.core.lock().desired_size()
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        self.core.lock().has_backpressure()
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.core.lock().can_close_or_enqueue()
    }

    pub(crate) fn state(&self) -> ReadableState {
        self.core.lock().state
    }

    pub(crate) fn errored_with(&self) -> Option<StreamError> {
        let core = self.core.lock();
        match core.state {
            ReadableState::Errored => Some(core.stored_error()),
            _ => None,
        }
    }

    pub(crate) fn cancel(self: &Arc<Self>, reason: StreamError) -> Completion<()> {
        {
            let mut core = self.core.lock();
            core.disturbed = true;
            match core.state {
                ReadableState::Closed => return Completion::ok(()),
                ReadableState::Errored => return Completion::err(core.stored_error()),
                ReadableState::Readable => {}
            }
            core.close_stream();
            core.queue.clear();
            if let Some(task) = core.pull_task.take() {
                task.abort();
            }
            core.pulling = false;
            core.pull_again = false;
        }
        tracing::debug!(reason = %reason, "readable stream cancelled");

        let (tx, completion) = Completion::pending();
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = shared.source.lock().await.cancel(reason).await;
            let _ = deferred::settle(tx, result);
        });
        completion
    }

    // -------------------------------------------------------------------------
    // Reader plumbing
    // -------------------------------------------------------------------------

    pub(crate) fn acquire_lock(&self) -> Result<(u64, Deferred<()>)> {
        let mut core = self.core.lock();
        if core.lock.is_some() {
            return Err(StreamError::Locked);
        }
        let id = core.next_lock_id;
        core.next_lock_id += 1;
        let closed = match core.state {
            ReadableState::Readable => Deferred::new(),
            ReadableState::Closed => Deferred::resolved(()),
            ReadableState::Errored => Deferred::rejected(core.stored_error()),
        };
        core.lock = Some(LockSlot {
            id,
            closed: closed.clone(),
        });
        Ok((id, closed))
    }

    pub(crate) fn read(self: &Arc<Self>, id: u64) -> Completion<ReadResult<T>> {
        let completion = {
            let mut core = self.core.lock();
            if !core.holds_lock(id) {
                return Completion::err(StreamError::Released);
            }
            core.read()
        };
        self.call_pull_if_needed();
        completion
    }

    pub(crate) fn holds_lock(&self, id: u64) -> bool {
        self.core.lock().holds_lock(id)
    }

    pub(crate) fn mark_disturbed(&self) {
        self.core.lock().disturbed = true;
    }
}

impl<T> ReadableShared<T> {
    pub(crate) fn release_lock(&self, id: u64) {
        let mut core = self.core.lock();
        if core.holds_lock(id) {
            if let Some(slot) = core.lock.take() {
                slot.closed.reject(StreamError::Released);
            }
        }
    }
}

// =============================================================================
// ReadableStreamController
// =============================================================================

/// Handle given to an [`UnderlyingSource`] for pushing chunks.
///
/// Holds a non-owning reference; once the stream is gone every call fails
/// with a state error.
pub struct ReadableStreamController<T> {
    shared: Weak<ReadableShared<T>>,
}

impl<T> Clone for ReadableStreamController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for ReadableStreamController<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadableStreamController").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ReadableStreamController<T> {
    fn new(shared: &Arc<ReadableShared<T>>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    fn upgrade(&self) -> Result<Arc<ReadableShared<T>>> {
        self.shared
            .upgrade()
            .ok_or_else(|| StreamError::state("readable stream was dropped"))
    }

    /// Queue a chunk, or hand it straight to the oldest pending read.
    pub fn enqueue(&self, chunk: T) -> Result<()> {
        self.upgrade()?.enqueue(chunk)
    }

    /// Close once the queue drains.
    pub fn close(&self) -> Result<()> {
        self.upgrade()?.close()
    }

    /// Error the stream. No effect unless the stream is still readable.
    pub fn error(&self, err: StreamError) {
        if let Ok(shared) = self.upgrade() {
            shared.error(err);
        }
    }

    /// `None` once errored, `0` once closed.
    pub fn desired_size(&self) -> Option<f64> {
        self.upgrade().ok().and_then(|shared| shared.desired_size())
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        self.upgrade().map(|s| s.has_backpressure()).unwrap_or(true)
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.upgrade().map(|s| s.can_close_or_enqueue()).unwrap_or(false)
    }

    pub(crate) fn errored_with(&self) -> Option<StreamError> {
        self.upgrade().ok().and_then(|s| s.errored_with())
    }
}

// =============================================================================
// ReadableStream
// =============================================================================

/// Shared handle to a readable stream.
pub struct ReadableStream<T> {
    pub(crate) shared: Arc<ReadableShared<T>>,
}

impl<T> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("ReadableStream")
            .field("state", &core.state)
            .field("locked", &core.lock.is_some())
            .field("queued", &core.queue.len())
            .finish()
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Create a stream with the default strategy (count, high-water mark 1).
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(source: impl UnderlyingSource<T>) -> Self {
        Self::with_strategy(source, QueuingStrategy::default())
    }

    pub fn with_strategy(source: impl UnderlyingSource<T>, strategy: QueuingStrategy<T>) -> Self {
        let stream = Self::unstarted(Box::new(source), strategy);
        stream.shared.start();
        stream
    }

    /// Build the stream without running `start`; the caller must call
    /// [`ReadableStream::start`] once any wiring that `start` relies on is
    /// in place.
    pub(crate) fn unstarted(
        source: Box<dyn UnderlyingSource<T>>,
        strategy: QueuingStrategy<T>,
    ) -> Self {
        Self {
            shared: ReadableShared::new(source, strategy),
        }
    }

    pub(crate) fn start(&self) {
        self.shared.start();
    }

    pub(crate) fn controller(&self) -> ReadableStreamController<T> {
        ReadableStreamController::new(&self.shared)
    }

    pub fn state(&self) -> ReadableState {
        self.shared.state()
    }

    /// True while a reader holds the lock.
    pub fn locked(&self) -> bool {
        self.shared.core.lock().lock.is_some()
    }

    /// True once anything has read from or cancelled the stream.
    pub fn is_disturbed(&self) -> bool {
        self.shared.core.lock().disturbed
    }

    /// Bind an exclusive reader. Fails with `Locked` if one is bound.
    pub fn get_reader(&self) -> Result<ReadableStreamReader<T>> {
        ReadableStreamReader::acquire(Arc::clone(&self.shared))
    }

    /// Cancel an unlocked stream.
    pub fn cancel(&self, reason: StreamError) -> Completion<()> {
        if self.locked() {
            return Completion::err(StreamError::Locked);
        }
        self.shared.cancel(reason)
    }

    /// Read every remaining chunk.
    pub async fn collect(&self) -> Result<Vec<T>> {
        let reader = self.get_reader()?;
        let mut chunks = Vec::new();
        loop {
            match reader.read().await? {
                ReadResult::Chunk(chunk) => chunks.push(chunk),
                ReadResult::Done => return Ok(chunks),
            }
        }
    }
}

impl ReadableStream<Bytes> {
    /// Read every remaining chunk into one contiguous buffer.
    pub async fn concat_bytes(&self) -> Result<Bytes> {
        let reader = self.get_reader()?;
        let mut buf = BytesMut::new();
        while let ReadResult::Chunk(chunk) = reader.read().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

// =============================================================================
// Tests
// =============================================================================
