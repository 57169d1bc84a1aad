//! Backpressure-aware streams.
//!
//! Producers and consumers run at different speeds; each stream keeps a
//! queue measured by a queuing strategy and signals through its desired
//! size whether the other side should slow down.
//!
//! # Architecture
//!
//! ```text
//! +--------------------+   pipe_to    +--------------------+
//! |   ReadableStream   | -----------> |   WritableStream   |
//! | (UnderlyingSource) |              |  (UnderlyingSink)  |
//! +--------------------+              +--------------------+
//!           |
//!           | pipe_through
//!           v
//! +----------------------------------------------------------+
//! | TransformStream:  writable --> Transformer --> readable  |
//! +----------------------------------------------------------+
//! ```
//!
//! Source, sink and transformer algorithms are async trait methods; the
//! streams run them on spawned tokio tasks, so every stream must be created
//! inside a tokio runtime.

pub mod deferred;
pub mod pipe;
pub mod queue;
pub mod readable;
pub mod reader;
pub mod signal;
pub mod sources;
pub mod strategy;
pub mod tee;
pub mod transform;
pub mod writable;
pub mod writer;

pub use deferred::{Completion, Deferred};
pub use pipe::PipeOptions;
pub use readable::{
    ReadResult, ReadableState, ReadableStream, ReadableStreamController, UnderlyingSource,
};
pub use reader::ReadableStreamReader;
pub use signal::{AbortController, AbortSignal};
pub use strategy::{QueuingStrategy, SizeFn, DEFAULT_HIGH_WATER_MARK};
pub use transform::{TransformStream, TransformStreamController, Transformer};
pub use writable::{UnderlyingSink, WritableState, WritableStream, WritableStreamController};
pub use writer::WritableStreamWriter;
