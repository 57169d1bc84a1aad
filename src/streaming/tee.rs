//! Tee: split one readable stream into two independent branches.
//!
//! Both branches see every chunk (cloned). The source is read at the pace of
//! the faster branch; a slow branch simply queues. The source is cancelled
//! only once both branches are cancelled, with the two reasons combined.

use crate::error::{Result, StreamError};
use crate::streaming::deferred::Deferred;
use crate::streaming::readable::{
    ReadResult, ReadableStream, ReadableStreamController, UnderlyingSource,
};
use crate::streaming::reader::ReadableStreamReader;
use crate::streaming::strategy::QueuingStrategy;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

#[derive(Default)]
struct TeeFlags {
    reading: bool,
    read_again: bool,
    canceled: [bool; 2],
    reasons: [Option<StreamError>; 2],
}

struct TeeState<T> {
    reader: ReadableStreamReader<T>,
    flags: Mutex<TeeFlags>,
    branches: OnceLock<[ReadableStreamController<T>; 2]>,
    cancel_done: Deferred<()>,
}

impl<T: Clone + Send + 'static> TeeState<T> {
    fn branches(&self) -> Result<&[ReadableStreamController<T>; 2]> {
        self.branches
            .get()
            .ok_or_else(|| StreamError::state("tee branches are not wired up"))
    }

    /// Start a read unless one is already running; in that case ask it to
    /// go round once more.
    fn pull(self: &Arc<Self>) {
        {
            let mut flags = self.flags.lock();
            if flags.reading {
                flags.read_again = true;
                return;
            }
            flags.reading = true;
        }
        let state = Arc::clone(self);
        tokio::spawn(async move { state.read_loop().await });
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            let result = self.reader.read().await;
            let canceled = self.flags.lock().canceled;
            match result {
                Ok(ReadResult::Chunk(chunk)) => {
                    if let Ok([first, second]) = self.branches() {
                        if !canceled[0] {
                            let _ = first.enqueue(chunk.clone());
                        }
                        if !canceled[1] {
                            let _ = second.enqueue(chunk);
                        }
                    }
                }
                Ok(ReadResult::Done) => {
                    tracing::trace!("tee source finished");
                    self.flags.lock().reading = false;
                    if let Ok(branches) = self.branches() {
                        for (branch, canceled) in branches.iter().zip(canceled) {
                            if !canceled {
                                let _ = branch.close();
                            }
                        }
                    }
                    if !(canceled[0] && canceled[1]) {
                        self.cancel_done.resolve(());
                    }
                    return;
                }
                Err(_) => {
                    // The closed watcher errors both branches.
                    self.flags.lock().reading = false;
                    return;
                }
            }

            let mut flags = self.flags.lock();
            if !std::mem::take(&mut flags.read_again) {
                flags.reading = false;
                return;
            }
        }
    }

    async fn cancel_branch(self: &Arc<Self>, index: usize, reason: StreamError) -> Result<()> {
        let combined = {
            let mut flags = self.flags.lock();
            flags.canceled[index] = true;
            flags.reasons[index] = Some(reason);
            if flags.canceled[0] && flags.canceled[1] {
                let reasons: Vec<StreamError> = flags.reasons.iter_mut().filter_map(Option::take).collect();
                Some(StreamError::Combined(reasons.into()))
            } else {
                None
            }
        };
        if let Some(combined) = combined {
            tracing::debug!("both tee branches cancelled");
            let result = self.reader.cancel(combined).await;
            self.cancel_done.settle(result);
        }
        self.cancel_done.wait().await
    }

    /// Error both branches when the source errors.
    fn watch_source(self: &Arc<Self>) {
        let state = Arc::clone(self);
        let closed = self.reader.closed();
        tokio::spawn(async move {
            if let Err(err) = closed.await {
                if matches!(err, StreamError::Released) {
                    return;
                }
                if let Ok(branches) = state.branches() {
                    for branch in branches {
                        branch.error(err.clone());
                    }
                }
                let both_canceled = {
                    let flags = state.flags.lock();
                    flags.canceled[0] && flags.canceled[1]
                };
                if !both_canceled {
                    state.cancel_done.resolve(());
                }
            }
        });
    }
}

struct TeeBranch<T> {
    state: Arc<TeeState<T>>,
    index: usize,
}

#[async_trait]
impl<T: Clone + Send + 'static> UnderlyingSource<T> for TeeBranch<T> {
    async fn pull(&mut self, _controller: &ReadableStreamController<T>) -> Result<()> {
        self.state.pull();
        Ok(())
    }

    async fn cancel(&mut self, reason: StreamError) -> Result<()> {
        self.state.cancel_branch(self.index, reason).await
    }
}

impl<T: Clone + Send + 'static> ReadableStream<T> {
    /// Split into two branches. The source stays locked for good.
    pub fn tee(&self) -> Result<(ReadableStream<T>, ReadableStream<T>)> {
        let reader = self.get_reader()?;
        let state = Arc::new(TeeState {
            reader,
            flags: Mutex::new(TeeFlags::default()),
            branches: OnceLock::new(),
            cancel_done: Deferred::new(),
        });

        let branch = |index| {
            ReadableStream::unstarted(
                Box::new(TeeBranch {
                    state: Arc::clone(&state),
                    index,
                }),
                QueuingStrategy::default(),
            )
        };
        let first = branch(0);
        let second = branch(1);
        let _ = state
            .branches
            .set([first.controller(), second.controller()]);

        state.watch_source();
        first.start();
        second.start();
        Ok((first, second))
    }
}
