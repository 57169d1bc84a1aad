//! webstreams: readable, writable and transform streams with backpressure.
//!
//! ```no_run
//! use webstreams::{PipeOptions, ReadableStream, TransformStream};
//!
//! # async fn demo() -> webstreams::Result<()> {
//! let source = ReadableStream::from_iter(1..=3);
//! let doubled = source.pipe_through(
//!     TransformStream::map(|n: i32| Ok(n * 2))?,
//!     PipeOptions::default(),
//! )?;
//! assert_eq!(doubled.collect().await?, vec![2, 4, 6]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod streaming;

pub use config::{ConfigError, PipeConfig, SizeMode, StrategyConfig, StreamConfig};
pub use error::{Result, StreamError};
pub use streaming::{
    AbortController, AbortSignal, Completion, PipeOptions, QueuingStrategy, ReadResult,
    ReadableState, ReadableStream, ReadableStreamController, ReadableStreamReader,
    TransformStream, TransformStreamController, Transformer, UnderlyingSink, UnderlyingSource,
    WritableState, WritableStream, WritableStreamController, WritableStreamWriter,
};
