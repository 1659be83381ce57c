//! Injection points for stream implementations
//!
//! A stream's data source and sink are supplied as trait objects:
//! - [`Source`] produces data for a readable when the engine pulls
//! - [`Sink`] consumes data written to a writable
//! - [`Transformer`] maps written chunks to readable output
//!
//! Every asynchronous hook receives a [`Completion`] and reports through it
//! exactly once. Completions can be cloned and stashed; completing one twice
//! is a programming error that is routed to the stream's error path as
//! [`StreamError::MultipleCallback`].

use crate::{
    chunk::Chunk,
    destroy,
    encoding::Encoding,
    error::{StreamError, StreamResult},
    readable,
    stream::{Stream, WeakStream},
};
use std::{cell::RefCell, fmt, rc::Rc};

type Callback<T> = Box<dyn FnOnce(StreamResult<T>)>;

struct CompletionInner<T> {
    callback: RefCell<Option<Callback<T>>>,
    stream: WeakStream,
}

/// One-shot completion handle given to hooks
pub struct Completion<T = ()> {
    inner: Rc<CompletionInner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.inner.callback.borrow().is_none())
            .finish()
    }
}

impl<T: 'static> Completion<T> {
    pub(crate) fn new(stream: &Stream, callback: impl FnOnce(StreamResult<T>) + 'static) -> Self {
        Self {
            inner: Rc::new(CompletionInner {
                callback: RefCell::new(Some(Box::new(callback))),
                stream: stream.downgrade(),
            }),
        }
    }

    /// Report the outcome of the hook
    pub fn complete(&self, result: StreamResult<T>) {
        let callback = self.inner.callback.borrow_mut().take();
        match callback {
            Some(callback) => callback(result),
            None => {
                log::warn!("stream hook completed more than once");
                if let Some(stream) = self.inner.stream.upgrade() {
                    destroy::error_or_destroy(&stream, StreamError::MultipleCallback, false);
                }
            }
        }
    }

    pub fn error(&self, err: StreamError) {
        self.complete(Err(err));
    }

    pub fn is_completed(&self) -> bool {
        self.inner.callback.borrow().is_none()
    }
}

impl Completion<()> {
    pub fn ok(&self) {
        self.complete(Ok(()));
    }
}

/// Handle a source or transformer uses to feed the readable side
#[derive(Clone, Debug)]
pub struct ReadController {
    stream: Stream,
}

impl ReadController {
    pub(crate) fn new(stream: Stream) -> Self {
        Self { stream }
    }

    /// Append a chunk. Returns false once the buffer reached the high-water mark.
    pub fn push(&self, chunk: impl Into<Chunk>) -> bool {
        readable::push(&self.stream, Some(chunk.into()))
    }

    /// Signal end of data
    pub fn push_end(&self) -> bool {
        readable::push(&self.stream, None)
    }

    pub fn unshift(&self, chunk: impl Into<Chunk>) -> bool {
        readable::unshift(&self.stream, chunk.into())
    }

    pub fn destroy(&self, err: Option<StreamError>) {
        destroy::destroy(&self.stream, err);
    }

    pub fn is_destroyed(&self) -> bool {
        self.stream.is_destroyed()
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }
}

/// Data source behind a readable
pub trait Source: 'static {
    /// Produce up to `size` units via `ctl.push`, now or later
    fn read(&self, ctl: &ReadController, size: usize);

    /// Release resources; runs once per stream
    fn destroy(&self, err: Option<StreamError>, done: Completion) {
        done.complete(err.map_or(Ok(()), Err));
    }
}

/// Data sink behind a writable
pub trait Sink: 'static {
    /// Consume one chunk and complete `done` when it is handled
    fn write(&self, chunk: Chunk, encoding: Encoding, done: Completion);

    /// Whether `writev` may be used to flush several buffered chunks at once
    fn supports_writev(&self) -> bool {
        false
    }

    /// Consume a batch of buffered chunks, in write order
    fn writev(&self, chunks: Vec<(Chunk, Encoding)>, done: Completion) {
        let _ = chunks;
        done.error(StreamError::MethodNotImplemented("writev"));
    }

    /// Runs once after every write completed and before `finish`
    fn finalize(&self, done: Completion) {
        done.ok();
    }

    /// Release resources; runs once per stream
    fn destroy(&self, err: Option<StreamError>, done: Completion) {
        done.complete(err.map_or(Ok(()), Err));
    }
}

/// Write-to-read mapping behind a transform stream
pub trait Transformer: 'static {
    /// Handle one written chunk: push zero or more outputs through `ctl`,
    /// then complete `done`, optionally with one more output chunk
    fn transform(
        &self,
        ctl: &ReadController,
        chunk: Chunk,
        encoding: Encoding,
        done: Completion<Option<Chunk>>,
    );

    /// Runs once after the last write, before the readable side ends
    fn flush(&self, ctl: &ReadController, done: Completion<Option<Chunk>>) {
        let _ = ctl;
        done.complete(Ok(None));
    }

    fn destroy(&self, err: Option<StreamError>, done: Completion) {
        done.complete(err.map_or(Ok(()), Err));
    }
}

/// Source backed by a closure
pub struct FnSource<F>(pub F);

impl<F> Source for FnSource<F>
where
    F: Fn(&ReadController, usize) + 'static,
{
    fn read(&self, ctl: &ReadController, size: usize) {
        (self.0)(ctl, size)
    }
}

/// Wrap a closure as a [`Source`]
pub fn source_fn<F>(f: F) -> FnSource<F>
where
    F: Fn(&ReadController, usize) + 'static,
{
    FnSource(f)
}

/// Sink backed by a closure
pub struct FnSink<F>(pub F);

impl<F> Sink for FnSink<F>
where
    F: Fn(Chunk, Encoding, Completion) + 'static,
{
    fn write(&self, chunk: Chunk, encoding: Encoding, done: Completion) {
        (self.0)(chunk, encoding, done)
    }
}

/// Wrap a closure as a [`Sink`]
pub fn sink_fn<F>(f: F) -> FnSink<F>
where
    F: Fn(Chunk, Encoding, Completion) + 'static,
{
    FnSink(f)
}

/// Transformer backed by a closure
pub struct FnTransformer<F>(pub F);

impl<F> Transformer for FnTransformer<F>
where
    F: Fn(&ReadController, Chunk, Encoding, Completion<Option<Chunk>>) + 'static,
{
    fn transform(
        &self,
        ctl: &ReadController,
        chunk: Chunk,
        encoding: Encoding,
        done: Completion<Option<Chunk>>,
    ) {
        (self.0)(ctl, chunk, encoding, done)
    }
}

/// Wrap a closure as a [`Transformer`]
pub fn transform_fn<F>(f: F) -> FnTransformer<F>
where
    F: Fn(&ReadController, Chunk, Encoding, Completion<Option<Chunk>>) + 'static,
{
    FnTransformer(f)
}

/// Source that yields the items of an iterator, one per pull
pub(crate) struct IterSource {
    items: RefCell<Box<dyn Iterator<Item = Chunk>>>,
}

impl IterSource {
    pub(crate) fn new(items: impl Iterator<Item = Chunk> + 'static) -> Self {
        Self {
            items: RefCell::new(Box::new(items)),
        }
    }
}

impl Source for IterSource {
    fn read(&self, ctl: &ReadController, _size: usize) {
        let next = self.items.borrow_mut().next();
        match next {
            Some(chunk) => {
                ctl.push(chunk);
            }
            None => {
                ctl.push_end();
            }
        }
    }
}
