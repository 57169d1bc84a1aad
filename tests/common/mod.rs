#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use webstreams::{
    ReadableStreamController, Result, StreamError, UnderlyingSink, UnderlyingSource,
    WritableStreamController,
};

/// Route `tracing` output through the test harness. Honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let spawned start/pull/write tasks run to quiescence.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Everything a [`RecordingSink`] saw, in order.
#[derive(Default)]
pub struct SinkLog {
    events: Mutex<Vec<String>>,
}

impl SinkLog {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix("write:").map(str::to_string))
            .collect()
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

/// Sink that logs every call and can be told to fail or stall.
pub struct RecordingSink {
    pub log: Arc<SinkLog>,
    pub fail_on: Option<String>,
    pub write_delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> (Self, Arc<SinkLog>) {
        let log = Arc::new(SinkLog::default());
        (
            Self {
                log: Arc::clone(&log),
                fail_on: None,
                write_delay: None,
            },
            log,
        )
    }
}

#[async_trait]
impl<T: std::fmt::Display + Send + 'static> UnderlyingSink<T> for RecordingSink {
    async fn write(&mut self, chunk: T, _controller: &WritableStreamController<T>) -> Result<()> {
        let text = chunk.to_string();
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        self.log.push(format!("write:{text}"));
        if self.fail_on.as_deref() == Some(text.as_str()) {
            return Err(StreamError::reason(format!("sink failed on {text}")));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.log.push("close".to_string());
        Ok(())
    }

    async fn abort(&mut self, reason: StreamError) -> Result<()> {
        self.log.push(format!("abort:{reason}"));
        Ok(())
    }
}

/// Source whose controller is handed to the test after `start`.
pub struct ManualSource<T> {
    controller: Arc<Mutex<Option<ReadableStreamController<T>>>>,
    pub cancelled_with: Arc<Mutex<Option<String>>>,
}

pub struct ManualHandle<T> {
    controller: Arc<Mutex<Option<ReadableStreamController<T>>>>,
    pub cancelled_with: Arc<Mutex<Option<String>>>,
}

impl<T> ManualSource<T> {
    pub fn new() -> (Self, ManualHandle<T>) {
        let controller = Arc::new(Mutex::new(None));
        let cancelled_with = Arc::new(Mutex::new(None));
        (
            Self {
                controller: Arc::clone(&controller),
                cancelled_with: Arc::clone(&cancelled_with),
            },
            ManualHandle {
                controller,
                cancelled_with,
            },
        )
    }
}

impl<T: Send + 'static> ManualHandle<T> {
    /// The source's controller; only available once `start` has run.
    pub fn controller(&self) -> ReadableStreamController<T> {
        self.controller
            .lock()
            .clone()
            .expect("source has not started yet")
    }

    pub fn cancelled_with(&self) -> Option<String> {
        self.cancelled_with.lock().clone()
    }
}

#[async_trait]
impl<T: Send + 'static> UnderlyingSource<T> for ManualSource<T> {
    async fn start(&mut self, controller: &ReadableStreamController<T>) -> Result<()> {
        *self.controller.lock() = Some(controller.clone());
        Ok(())
    }

    async fn cancel(&mut self, reason: StreamError) -> Result<()> {
        *self.cancelled_with.lock() = Some(reason.to_string());
        Ok(())
    }
}
