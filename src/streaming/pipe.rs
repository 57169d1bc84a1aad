//! Piping engine: moves chunks from a readable stream to a writable stream
//! while respecting the destination's backpressure.
//!
//! The loop waits for the writer to be ready, reads one chunk and writes it,
//! never awaiting the write itself. Shutdown is triggered by whichever comes
//! first: the abort signal, an error on either side, the source closing or
//! the destination closing.

use crate::error::{Result, StreamError};
use crate::streaming::deferred::Completion;
use crate::streaming::readable::{ReadResult, ReadableState, ReadableStream};
use crate::streaming::reader::ReadableStreamReader;
use crate::streaming::signal::AbortSignal;
use crate::streaming::writable::{WritableState, WritableStream};
use crate::streaming::writer::WritableStreamWriter;
use std::future::Future;

/// Options controlling how a pipe reacts to either side ending.
#[derive(Debug, Clone, Default)]
pub struct PipeOptions {
    /// Leave the destination open when the source closes
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors
    pub prevent_abort: bool,
    /// Leave the source alone when the destination errors or closes
    pub prevent_cancel: bool,
    /// Stops the pipe when fired
    pub signal: Option<AbortSignal>,
}

impl PipeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prevent_close(mut self, prevent: bool) -> Self {
        self.prevent_close = prevent;
        self
    }

    pub fn prevent_abort(mut self, prevent: bool) -> Self {
        self.prevent_abort = prevent;
        self
    }

    pub fn prevent_cancel(mut self, prevent: bool) -> Self {
        self.prevent_cancel = prevent;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Why the pipe is shutting down.
#[derive(Debug)]
enum Shutdown {
    Aborted(StreamError),
    SourceErrored(StreamError),
    DestErrored(StreamError),
    SourceClosed,
    DestClosed,
}

/// Result of one ready/read/write step.
enum Step {
    Wrote,
    SourceDone,
    SourceFailed(StreamError),
    DestNotReady,
}

/// Resolve with the error that rejects `closed`; never resolve if it
/// fulfils instead.
async fn errored(closed: Completion<()>) -> StreamError {
    match closed.await {
        Err(err) => err,
        Ok(()) => std::future::pending().await,
    }
}

async fn aborted(signal: Option<AbortSignal>) -> StreamError {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

struct Pipe<T> {
    reader: ReadableStreamReader<T>,
    writer: WritableStreamWriter<T>,
    options: PipeOptions,
    pending_write: Option<Completion<()>>,
}

impl<T: Send + 'static> Pipe<T> {
    async fn run(mut self) -> Result<()> {
        let shutdown = match self.initial_shutdown() {
            Some(shutdown) => shutdown,
            None => self.pump().await,
        };
        tracing::debug!(reason = ?shutdown, "pipe shutting down");
        self.shutdown(shutdown).await
    }

    /// Conditions that hold before the first chunk moves, checked in the
    /// order they take precedence.
    fn initial_shutdown(&self) -> Option<Shutdown> {
        if let Some(reason) = self.options.signal.as_ref().and_then(|s| s.reason()) {
            return Some(Shutdown::Aborted(reason));
        }
        if let Some(err) = self.reader.errored_with() {
            return Some(Shutdown::SourceErrored(err));
        }
        if let Some(err) = self.writer.errored_with() {
            return Some(Shutdown::DestErrored(err));
        }
        if self.reader.stream_state() == ReadableState::Closed {
            return Some(Shutdown::SourceClosed);
        }
        if self.writer.close_queued_or_closed() {
            return Some(Shutdown::DestClosed);
        }
        None
    }

    async fn pump(&mut self) -> Shutdown {
        let source_errored = errored(self.reader.closed());
        let dest_errored = errored(self.writer.closed());
        let abort = aborted(self.options.signal.clone());
        tokio::pin!(source_errored, dest_errored, abort);

        let mut stalled = false;
        loop {
            tokio::select! {
                biased;
                reason = &mut abort => return Shutdown::Aborted(reason),
                err = &mut source_errored => return Shutdown::SourceErrored(err),
                err = &mut dest_errored => return Shutdown::DestErrored(err),
                step = self.step(), if !stalled => match step {
                    Step::Wrote => {}
                    Step::SourceDone => return Shutdown::SourceClosed,
                    Step::SourceFailed(err) => return Shutdown::SourceErrored(err),
                    // The destination is erroring; its closed signal follows.
                    Step::DestNotReady => stalled = true,
                },
            }
        }
    }

    async fn step(&mut self) -> Step {
        if self.writer.ready().await.is_err() {
            return Step::DestNotReady;
        }
        match self.reader.read().await {
            Ok(ReadResult::Chunk(chunk)) => {
                tracing::trace!("pipe forwarding chunk");
                self.pending_write = Some(self.writer.write(chunk));
                Step::Wrote
            }
            Ok(ReadResult::Done) => Step::SourceDone,
            Err(err) => Step::SourceFailed(err),
        }
    }

    async fn shutdown(mut self, shutdown: Shutdown) -> Result<()> {
        // Chunks already read are written out first, unless the
        // destination can no longer take them. An abort does not wait: the
        // write may be stuck behind backpressure the abort itself releases.
        let aborting = matches!(shutdown, Shutdown::Aborted(_));
        if !aborting && self.writer.stream_state() == WritableState::Writable {
            if let Some(write) = self.pending_write.take() {
                let _ = write.await;
            }
        }
        let pending_write = if aborting {
            self.pending_write.take()
        } else {
            None
        };

        let PipeOptions {
            prevent_close,
            prevent_abort,
            prevent_cancel,
            ..
        } = self.options;

        let (action, error): (Option<Completion<()>>, Option<StreamError>) = match shutdown {
            Shutdown::Aborted(reason) => {
                let abort_dest = !prevent_abort
                    && matches!(
                        self.writer.stream_state(),
                        WritableState::Writable | WritableState::Closing
                    );
                let cancel_source =
                    !prevent_cancel && self.reader.stream_state() == ReadableState::Readable;
                let abort = abort_dest.then(|| self.writer.abort(reason.clone()));
                let cancel = cancel_source.then(|| self.reader.cancel(reason.clone()));
                let action = Completion::from_future(async move {
                    let (aborted, cancelled) = futures::join!(optional(abort), optional(cancel));
                    aborted.and(cancelled)
                });
                (Some(action), Some(reason))
            }
            Shutdown::SourceErrored(err) => {
                let action = (!prevent_abort).then(|| self.writer.abort(err.clone()));
                (action, Some(err))
            }
            Shutdown::DestErrored(err) => {
                let action = (!prevent_cancel).then(|| self.reader.cancel(err.clone()));
                (action, Some(err))
            }
            Shutdown::SourceClosed => {
                let action = (!prevent_close).then(|| self.writer.close_with_error_propagation());
                (action, None)
            }
            Shutdown::DestClosed => {
                let err = StreamError::state("the destination writable stream closed before all data could be piped to it");
                let action = (!prevent_cancel).then(|| self.reader.cancel(err.clone()));
                (action, Some(err))
            }
        };

        let action_result = match action {
            Some(action) => {
                let (result, _) = futures::join!(action, optional(pending_write));
                result
            }
            None => Ok(()),
        };
        // Dropping the reader and writer releases both locks.
        drop(self);

        action_result?;
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn optional(completion: Option<Completion<()>>) -> Result<()> {
    match completion {
        Some(completion) => completion.await,
        None => Ok(()),
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Pipe every chunk into `dest`.
    ///
    /// Both streams are locked for the duration of the pipe. The returned
    /// completion settles once the pipe has shut down and released them.
    pub fn pipe_to(&self, dest: &WritableStream<T>, options: PipeOptions) -> Completion<()> {
        if self.locked() || dest.locked() {
            return Completion::err(StreamError::Locked);
        }
        let reader = match self.get_reader() {
            Ok(reader) => reader,
            Err(err) => return Completion::err(err),
        };
        let writer = match dest.get_writer() {
            Ok(writer) => writer,
            Err(err) => return Completion::err(err),
        };
        self.shared.mark_disturbed();

        let pipe = Pipe {
            reader,
            writer,
            options,
            pending_write: None,
        };
        spawn_completion(pipe.run())
    }
}

fn spawn_completion<F>(fut: F) -> Completion<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    Completion::from_future(async move {
        handle
            .await
            .map_err(|err| StreamError::state(format!("pipe task failed: {err}")))?
    })
}
