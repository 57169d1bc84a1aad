//! Writable streams.
//!
//! Writes are queued with their strategy size and handed to the sink one at
//! a time. A single driver task owns the sink while an operation is in
//! flight; the queue state machine decides what the sink does next.
//!
//! ```text
//!                    abort / sink error
//!   Writable ─────────────────────────────▶ Erroring ──▶ Errored
//!      │  close() queued                         ▲
//!      ▼                                         │ sink error
//!   (Closing) ── close completes ──▶ Closed      │
//!      └─────────────────────────────────────────┘
//! ```

use crate::error::{Result, StreamError};
use crate::streaming::deferred::{self, Completion, Deferred, Settler};
use crate::streaming::queue::SizedQueue;
use crate::streaming::signal::{AbortController, AbortSignal};
use crate::streaming::strategy::QueuingStrategy;
use crate::streaming::writer::WritableStreamWriter;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;

// =============================================================================
// Public types
// =============================================================================

/// Observable state of a writable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    Writable,
    /// A close is queued or in flight; no further writes are accepted
    Closing,
    /// Aborted or failed; waiting for in-flight work before `Errored`
    Erroring,
    Closed,
    Errored,
}

/// Consumer side algorithms driven by a [`WritableStream`].
///
/// The stream never overlaps two sink calls. `close` runs only after every
/// queued write succeeded. `abort` replaces `close` when the stream is
/// aborted before closing.
#[async_trait]
pub trait UnderlyingSink<T: Send + 'static>: Send + 'static {
    async fn start(&mut self, _controller: &WritableStreamController<T>) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, chunk: T, controller: &WritableStreamController<T>) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn abort(&mut self, _reason: StreamError) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Queue state machine
// =============================================================================

enum WriteRecord<T> {
    Chunk(T),
    Close,
}

/// Next operation for the sink, produced by the state machine.
pub(crate) enum SinkOp<T> {
    Write(T),
    Close,
    Abort(StreamError),
}

struct PendingAbort {
    done: Deferred<()>,
    reason: StreamError,
    was_already_erroring: bool,
}

struct WriterSlot {
    id: u64,
    ready: Deferred<()>,
    closed: Deferred<()>,
}

/// Reject `deferred`, or replace it with a rejected one if it already settled.
fn ensure_rejected(deferred: &mut Deferred<()>, err: StreamError) {
    if !deferred.reject(err.clone()) {
        *deferred = Deferred::rejected(err);
    }
}

/// Internal state. `Closing` is never stored; it is derived from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Writable,
    Erroring,
    Errored,
    Closed,
}

pub(crate) struct WritableCore<T> {
    state: State,
    stored_error: Option<StreamError>,
    queue: SizedQueue<WriteRecord<T>>,
    strategy: QueuingStrategy<T>,
    started: bool,
    backpressure: bool,
    write_requests: VecDeque<Settler<()>>,
    in_flight_write: Option<Settler<()>>,
    in_flight_size: f64,
    close_request: Option<Deferred<()>>,
    in_flight_close: Option<Deferred<()>>,
    pending_abort: Option<PendingAbort>,
    in_flight_abort: Option<Deferred<()>>,
    lock: Option<WriterSlot>,
    next_lock_id: u64,
    abort_controller: AbortController,
}

impl<T> WritableCore<T> {
    fn new(strategy: QueuingStrategy<T>) -> Self {
        let mut core = Self {
            state: State::Writable,
            stored_error: None,
            queue: SizedQueue::new(),
            strategy,
            started: false,
            backpressure: false,
            write_requests: VecDeque::new(),
            in_flight_write: None,
            in_flight_size: 0.0,
            close_request: None,
            in_flight_close: None,
            pending_abort: None,
            in_flight_abort: None,
            lock: None,
            next_lock_id: 1,
            abort_controller: AbortController::new(),
        };
        core.backpressure = core.desired_size_raw() <= 0.0;
        core
    }

    fn public_state(&self) -> WritableState {
        match self.state {
            State::Writable if self.close_queued_or_in_flight() => WritableState::Closing,
            State::Writable => WritableState::Writable,
            State::Erroring => WritableState::Erroring,
            State::Errored => WritableState::Errored,
            State::Closed => WritableState::Closed,
        }
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    fn has_operation_in_flight(&self) -> bool {
        self.in_flight_write.is_some() || self.in_flight_close.is_some()
    }

    /// Queued sizes plus the chunk the sink is currently writing.
    fn desired_size_raw(&self) -> f64 {
        self.strategy
            .desired_size(self.queue.total_size() + self.in_flight_size)
    }

    fn desired_size(&self) -> Option<f64> {
        match self.state {
            State::Erroring | State::Errored => None,
            State::Closed => Some(0.0),
            State::Writable => Some(self.desired_size_raw()),
        }
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::state("stream errored"))
    }

    fn update_backpressure(&mut self, backpressure: bool) {
        if backpressure == self.backpressure {
            return;
        }
        if let Some(slot) = &mut self.lock {
            if backpressure {
                slot.ready = Deferred::new();
            } else {
                slot.ready.resolve(());
            }
        }
        self.backpressure = backpressure;
    }

    fn start_erroring(&mut self, reason: StreamError) -> Option<SinkOp<T>> {
        tracing::debug!(reason = %reason, "writable stream erroring");
        self.state = State::Erroring;
        self.stored_error = Some(reason.clone());
        if let Some(slot) = &mut self.lock {
            ensure_rejected(&mut slot.ready, reason);
        }
        if !self.has_operation_in_flight() && self.started {
            return self.finish_erroring();
        }
        None
    }

    fn finish_erroring(&mut self) -> Option<SinkOp<T>> {
        self.state = State::Errored;
        let err = self.stored_error();
        tracing::debug!(error = %err, "writable stream errored");
        self.queue.clear();
        for tx in self.write_requests.drain(..) {
            let _ = deferred::settle(tx, Err(err.clone()));
        }

        match self.pending_abort.take() {
            None => {
                self.reject_close_and_closed();
                None
            }
            Some(abort) if abort.was_already_erroring => {
                abort.done.reject(err);
                self.reject_close_and_closed();
                None
            }
            Some(abort) => {
                self.in_flight_abort = Some(abort.done);
                Some(SinkOp::Abort(abort.reason))
            }
        }
    }

    fn finish_abort(&mut self, result: Result<()>) {
        if let Some(done) = self.in_flight_abort.take() {
            done.settle(result);
        }
        self.reject_close_and_closed();
    }

    fn reject_close_and_closed(&mut self) {
        let err = self.stored_error();
        if let Some(close) = self.close_request.take() {
            close.reject(err.clone());
        }
        if let Some(slot) = &mut self.lock {
            ensure_rejected(&mut slot.closed, err);
        }
    }

    fn deal_with_rejection(&mut self, err: StreamError) -> Option<SinkOp<T>> {
        if self.state == State::Writable {
            return self.start_erroring(err);
        }
        self.finish_erroring()
    }

    /// Error from the sink side. No effect unless still writable.
    fn error_if_needed(&mut self, err: StreamError) -> Option<SinkOp<T>> {
        if self.state == State::Writable {
            return self.start_erroring(err);
        }
        None
    }

    /// Decide what the sink does next, if anything.
    fn advance_queue(&mut self) -> Option<SinkOp<T>> {
        if !self.started || self.in_flight_write.is_some() || self.in_flight_close.is_some() {
            return None;
        }
        match self.state {
            State::Closed | State::Errored => return None,
            State::Erroring => return self.finish_erroring(),
            State::Writable => {}
        }
        let (record, size) = self.queue.pop()?;
        match record {
            WriteRecord::Close => {
                self.in_flight_close = self.close_request.take();
                Some(SinkOp::Close)
            }
            WriteRecord::Chunk(chunk) => {
                self.in_flight_write = self.write_requests.pop_front();
                self.in_flight_size = size;
                Some(SinkOp::Write(chunk))
            }
        }
    }

    fn finish_write(&mut self, result: Result<()>) -> Option<SinkOp<T>> {
        self.in_flight_size = 0.0;
        let tx = self.in_flight_write.take();
        match result {
            Ok(()) => {
                if let Some(tx) = tx {
                    let _ = deferred::settle(tx, Ok(()));
                }
                if !self.close_queued_or_in_flight() && self.state == State::Writable {
                    let backpressure = self.desired_size_raw() <= 0.0;
                    self.update_backpressure(backpressure);
                }
                self.advance_queue()
            }
            Err(err) => {
                if let Some(tx) = tx {
                    let _ = deferred::settle(tx, Err(err.clone()));
                }
                self.deal_with_rejection(err)
            }
        }
    }

    fn finish_close(&mut self, result: Result<()>) -> Option<SinkOp<T>> {
        let close = self.in_flight_close.take();
        match result {
            Ok(()) => {
                if let Some(close) = close {
                    close.resolve(());
                }
                if self.state == State::Erroring {
                    self.stored_error = None;
                    if let Some(abort) = self.pending_abort.take() {
                        abort.done.resolve(());
                    }
                }
                self.state = State::Closed;
                if let Some(slot) = &self.lock {
                    slot.closed.resolve(());
                }
                tracing::debug!("writable stream closed");
                None
            }
            Err(err) => {
                if let Some(close) = close {
                    close.reject(err.clone());
                }
                if let Some(abort) = self.pending_abort.take() {
                    abort.done.reject(err.clone());
                }
                self.deal_with_rejection(err)
            }
        }
    }

    fn write(&mut self, chunk: T) -> (Completion<()>, Option<SinkOp<T>>) {
        let (size, mut op) = match self.strategy.size_of(&chunk) {
            Ok(size) => (size, None),
            Err(err) => (1.0, self.error_if_needed(err)),
        };

        match self.state {
            State::Errored | State::Erroring => return (Completion::err(self.stored_error()), op),
            State::Closed => {
                return (
                    Completion::err(StreamError::state("cannot write to a closed stream")),
                    op,
                )
            }
            State::Writable if self.close_queued_or_in_flight() => {
                return (
                    Completion::err(StreamError::state("cannot write to a closing stream")),
                    op,
                )
            }
            State::Writable => {}
        }

        let (tx, completion) = Completion::pending();
        self.write_requests.push_back(tx);
        match self.queue.push(WriteRecord::Chunk(chunk), size) {
            Ok(()) => {
                if self.state == State::Writable {
                    let backpressure = self.desired_size_raw() <= 0.0;
                    self.update_backpressure(backpressure);
                }
                op = self.advance_queue();
            }
            Err(err) => op = self.error_if_needed(err),
        }
        (completion, op)
    }

    fn close(&mut self) -> (Completion<()>, Option<SinkOp<T>>) {
        match self.state {
            State::Closed | State::Errored => {
                return (
                    Completion::err(StreamError::state(
                        "cannot close a stream that is closed or errored",
                    )),
                    None,
                )
            }
            _ if self.close_queued_or_in_flight() => {
                return (
                    Completion::err(StreamError::state("stream is already closing")),
                    None,
                )
            }
            _ => {}
        }

        let close = Deferred::new();
        self.close_request = Some(close.clone());
        if self.backpressure && self.state == State::Writable {
            if let Some(slot) = &self.lock {
                slot.ready.resolve(());
            }
        }
        // Close records carry no weight.
        let _ = self.queue.push(WriteRecord::Close, 0.0);
        let op = self.advance_queue();
        (close.completion(), op)
    }

    fn abort(&mut self, reason: StreamError) -> (Completion<()>, Option<SinkOp<T>>) {
        if matches!(self.state, State::Closed | State::Errored) {
            return (Completion::ok(()), None);
        }
        self.abort_controller.abort_with(reason.clone());

        if let Some(pending) = &self.pending_abort {
            return (pending.done.completion(), None);
        }

        let was_already_erroring = self.state == State::Erroring;
        let done = Deferred::new();
        self.pending_abort = Some(PendingAbort {
            done: done.clone(),
            reason: reason.clone(),
            was_already_erroring,
        });
        let op = if was_already_erroring {
            None
        } else {
            self.start_erroring(reason)
        };
        (done.completion(), op)
    }

    fn holds_lock(&self, id: u64) -> bool {
        self.lock.as_ref().is_some_and(|slot| slot.id == id)
    }
}

// =============================================================================
// Shared stream state and sink driver
// =============================================================================

pub(crate) struct WritableShared<T> {
    core: Mutex<WritableCore<T>>,
    sink: AsyncMutex<Box<dyn UnderlyingSink<T>>>,
}

impl<T: Send + 'static> WritableShared<T> {
    fn new(sink: Box<dyn UnderlyingSink<T>>, strategy: QueuingStrategy<T>) -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(WritableCore::new(strategy)),
            sink: AsyncMutex::new(sink),
        })
    }

    fn start(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let controller = WritableStreamController::new(&shared);
            let result = shared.sink.lock().await.start(&controller).await;
            let op = {
                let mut core = shared.core.lock();
                core.started = true;
                match result {
                    Ok(()) => core.advance_queue(),
                    Err(err) => core.deal_with_rejection(err),
                }
            };
            if let Some(op) = op {
                shared.drive(op).await;
            }
        });
    }

    fn dispatch(self: &Arc<Self>, op: Option<SinkOp<T>>) {
        if let Some(op) = op {
            let shared = Arc::clone(self);
            tokio::spawn(async move { shared.drive(op).await });
        }
    }

    /// Run sink operations until the state machine has nothing left.
    async fn drive(self: &Arc<Self>, first: SinkOp<T>) {
        let controller = WritableStreamController::new(self);
        let mut next = Some(first);
        while let Some(op) = next.take() {
            next = match op {
                SinkOp::Write(chunk) => {
                    tracing::trace!("sink write");
                    let result = self.sink.lock().await.write(chunk, &controller).await;
                    let mut core = self.core.lock();
                    core.finish_write(result)
                }
                SinkOp::Close => {
                    let result = self.sink.lock().await.close().await;
                    let mut core = self.core.lock();
                    core.finish_close(result)
                }
                SinkOp::Abort(reason) => {
                    let result = self.sink.lock().await.abort(reason).await;
                    let mut core = self.core.lock();
                    core.finish_abort(result);
                    None
                }
            };
        }
    }

    pub(crate) fn write(self: &Arc<Self>, chunk: T) -> Completion<()> {
        let (completion, op) = self.core.lock().write(chunk);
        self.dispatch(op);
        completion
    }

    pub(crate) fn close(self: &Arc<Self>) -> Completion<()> {
        let (completion, op) = self.core.lock().close();
        self.dispatch(op);
        completion
    }

    pub(crate) fn abort(self: &Arc<Self>, reason: StreamError) -> Completion<()> {
        let (completion, op) = self.core.lock().abort(reason);
        self.dispatch(op);
        completion
    }

    pub(crate) fn error(self: &Arc<Self>, err: StreamError) {
        let op = self.core.lock().error_if_needed(err);
        self.dispatch(op);
    }

    pub(crate) fn state(&self) -> WritableState {
        self.core.lock().public_state()
    }

    pub(crate) fn close_queued_or_closed(&self) -> bool {
        let core = self.core.lock();
        core.close_queued_or_in_flight() || core.state == State::Closed
    }

    pub(crate) fn errored_with(&self) -> Option<StreamError> {
        let core = self.core.lock();
        match core.state {
            State::Errored => Some(core.stored_error()),
            _ => None,
        }
    }

    pub(crate) fn erroring_with(&self) -> Option<StreamError> {
        let core = self.core.lock();
        match core.state {
            State::Erroring => Some(core.stored_error()),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Writer plumbing
    // -------------------------------------------------------------------------

    pub(crate) fn acquire_lock(&self) -> Result<u64> {
        let mut core = self.core.lock();
        if core.lock.is_some() {
            return Err(StreamError::Locked);
        }
        let id = core.next_lock_id;
        core.next_lock_id += 1;

        let (ready, closed) = match core.state {
            State::Writable => {
                let ready = if !core.close_queued_or_in_flight() && core.backpressure {
                    Deferred::new()
                } else {
                    Deferred::resolved(())
                };
                (ready, Deferred::new())
            }
            State::Erroring => (Deferred::rejected(core.stored_error()), Deferred::new()),
            State::Closed => (Deferred::resolved(()), Deferred::resolved(())),
            State::Errored => (
                Deferred::rejected(core.stored_error()),
                Deferred::rejected(core.stored_error()),
            ),
        };
        core.lock = Some(WriterSlot { id, ready, closed });
        Ok(id)
    }

    pub(crate) fn ready(&self, id: u64) -> Completion<()> {
        let core = self.core.lock();
        match &core.lock {
            Some(slot) if slot.id == id => slot.ready.completion(),
            _ => Completion::err(StreamError::Released),
        }
    }

    pub(crate) fn closed(&self, id: u64) -> Completion<()> {
        let core = self.core.lock();
        match &core.lock {
            Some(slot) if slot.id == id => slot.closed.completion(),
            _ => Completion::err(StreamError::Released),
        }
    }

    pub(crate) fn desired_size(&self, id: u64) -> Result<Option<f64>> {
        let core = self.core.lock();
        if !core.holds_lock(id) {
            return Err(StreamError::Released);
        }
        Ok(core.desired_size())
    }

    pub(crate) fn holds_lock(&self, id: u64) -> bool {
        self.core.lock().holds_lock(id)
    }
}

impl<T> WritableShared<T> {
    pub(crate) fn release_lock(&self, id: u64) {
        let mut core = self.core.lock();
        if !core.holds_lock(id) {
            return;
        }
        if let Some(mut slot) = core.lock.take() {
            ensure_rejected(&mut slot.ready, StreamError::Released);
            ensure_rejected(&mut slot.closed, StreamError::Released);
        }
    }
}

// =============================================================================
// WritableStreamController
// =============================================================================

/// Handle given to an [`UnderlyingSink`].
pub struct WritableStreamController<T> {
    shared: Weak<WritableShared<T>>,
}

impl<T> Clone for WritableStreamController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for WritableStreamController<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableStreamController").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> WritableStreamController<T> {
    fn new(shared: &Arc<WritableShared<T>>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    /// Error the stream from the sink side. No effect unless writable.
    pub fn error(&self, err: StreamError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.error(err);
        }
    }

    /// Fires with the abort reason when the stream is aborted, so a sink
    /// can give up on a long write early.
    pub fn signal(&self) -> AbortSignal {
        match self.shared.upgrade() {
            Some(shared) => shared.core.lock().abort_controller.signal(),
            None => AbortSignal::aborted_with(StreamError::state("writable stream was dropped")),
        }
    }

    pub(crate) fn erroring_with(&self) -> Option<StreamError> {
        self.shared.upgrade().and_then(|shared| shared.erroring_with())
    }
}

// =============================================================================
// WritableStream
// =============================================================================

/// Shared handle to a writable stream.
pub struct WritableStream<T> {
    pub(crate) shared: Arc<WritableShared<T>>,
}

impl<T> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for WritableStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("WritableStream")
            .field("state", &core.public_state())
            .field("locked", &core.lock.is_some())
            .field("queued", &core.queue.len())
            .finish()
    }
}

impl<T: Send + 'static> WritableStream<T> {
    /// Create a stream with the default strategy (count, high-water mark 1).
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(sink: impl UnderlyingSink<T>) -> Self {
        Self::with_strategy(sink, QueuingStrategy::default())
    }

    pub fn with_strategy(sink: impl UnderlyingSink<T>, strategy: QueuingStrategy<T>) -> Self {
        let stream = Self::unstarted(Box::new(sink), strategy);
        stream.start();
        stream
    }

    pub(crate) fn unstarted(sink: Box<dyn UnderlyingSink<T>>, strategy: QueuingStrategy<T>) -> Self {
        Self {
            shared: WritableShared::new(sink, strategy),
        }
    }

    pub(crate) fn start(&self) {
        self.shared.start();
    }

    pub(crate) fn controller(&self) -> WritableStreamController<T> {
        WritableStreamController::new(&self.shared)
    }

    pub fn state(&self) -> WritableState {
        self.shared.state()
    }

    pub fn locked(&self) -> bool {
        self.shared.core.lock().lock.is_some()
    }

    /// Bind an exclusive writer. Fails with `Locked` if one is bound.
    pub fn get_writer(&self) -> Result<WritableStreamWriter<T>> {
        WritableStreamWriter::acquire(Arc::clone(&self.shared))
    }

    /// Abort an unlocked stream, discarding queued writes.
    pub fn abort(&self, reason: StreamError) -> Completion<()> {
        if self.locked() {
            return Completion::err(StreamError::Locked);
        }
        self.shared.abort(reason)
    }

    /// Close an unlocked stream after queued writes finish.
    pub fn close(&self) -> Completion<()> {
        if self.locked() {
            return Completion::err(StreamError::Locked);
        }
        self.shared.close()
    }
}

// =============================================================================
// Tests
// =============================================================================
