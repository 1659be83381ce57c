//! nodestream - A Node.js compatible stream engine
//!
//! nodestream reproduces the observable behaviour of Node's stream module on
//! a single-threaded cooperative scheduler:
//! - Readable, Writable, Duplex and Transform streams sharing one state model
//! - pipe with per-destination backpressure, plus unpipe
//! - idempotent destroy with deferred error and close events
//! - `finished`, `pipeline` and async iteration helpers
//!
//! Every stream is bound to a [`Scheduler`]. Deferred work runs when the
//! scheduler is driven, either by [`Scheduler::run_until_idle`] or by polling
//! a [`ReadableIter`].

pub mod async_iter;
mod buffer_list;
pub mod chunk;
pub mod config;
mod destroy;
pub mod duplex;
pub mod encoding;
pub mod error;
pub mod events;
pub mod finished;
pub mod hooks;
pub mod io;
mod pipe;
pub mod pipeline;
pub mod readable;
pub mod scheduler;
pub mod stream;
pub mod string_decoder;
pub mod transform;
pub mod writable;

// Re-export commonly used types
pub use async_iter::ReadableIter;
pub use chunk::Chunk;
pub use config::{DuplexOptions, FinishedOptions, PipeOptions, ReadableOptions, WritableOptions};
pub use duplex::DuplexStream;
pub use encoding::Encoding;
pub use error::{StreamError, StreamResult};
pub use events::{Event, EventKind, ListenerId};
pub use finished::{Subscription, finished};
pub use hooks::{
    Completion, ReadController, Sink, Source, Transformer, sink_fn, source_fn, transform_fn,
};
pub use io::{ReaderSource, WriterSink};
pub use pipeline::pipeline;
pub use readable::{Readable, ReadableStream};
pub use scheduler::Scheduler;
pub use stream::{AsStream, Stream, WeakStream};
pub use transform::{PassThrough, TransformStream};
pub use writable::{Writable, WritableStream, WriteCallback};

/// Traits needed to call stream methods
pub mod prelude {
    pub use crate::readable::Readable;
    pub use crate::stream::AsStream;
    pub use crate::writable::Writable;
}
