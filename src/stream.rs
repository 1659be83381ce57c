//! Shared stream handle
//!
//! A [`Stream`] is the entity every role is built on: it composes an optional
//! readable state and an optional writable state with one event emitter and
//! the hooks that feed or drain it. Readable, Writable, Duplex and Transform
//! streams are thin typed wrappers over this handle.

use crate::{
    chunk::Chunk,
    destroy,
    encoding::Encoding,
    error::StreamError,
    events::{Event, EventEmitter, EventKind, ListenerId},
    hooks::{Completion, ReadController, Sink, Source, Transformer},
    readable::{self, ReadableState},
    scheduler::Scheduler,
    transform::{self, TransformState},
    writable::WritableState,
};
use std::{
    cell::{RefCell, RefMut},
    fmt,
    rc::{Rc, Weak},
};

/// Hooks a stream dispatches to, per role
pub(crate) enum Hooks {
    /// `None` leaves the read hook abstract
    Readable(Option<Rc<dyn Source>>),
    Writable(Rc<dyn Sink>),
    Duplex {
        source: Rc<dyn Source>,
        sink: Rc<dyn Sink>,
    },
    Transform {
        transformer: Rc<dyn Transformer>,
        state: RefCell<TransformState>,
    },
}

impl Hooks {
    fn name(&self) -> &'static str {
        match self {
            Hooks::Readable(_) => "Readable",
            Hooks::Writable(_) => "Writable",
            Hooks::Duplex { .. } => "Duplex",
            Hooks::Transform { .. } => "Transform",
        }
    }
}

pub(crate) struct Inner {
    pub(crate) scheduler: Scheduler,
    pub(crate) events: EventEmitter,
    pub(crate) readable: Option<RefCell<ReadableState>>,
    pub(crate) writable: Option<RefCell<WritableState>>,
    pub(crate) hooks: Hooks,
    pub(crate) allow_half_open: bool,
}

/// Cloneable handle to a stream entity
#[derive(Clone)]
pub struct Stream {
    pub(crate) inner: Rc<Inner>,
}

/// Non-owning handle, used by listeners that must not keep a stream alive
#[derive(Clone, Debug)]
pub struct WeakStream {
    inner: Weak<Inner>,
}

impl WeakStream {
    pub fn upgrade(&self) -> Option<Stream> {
        self.inner.upgrade().map(|inner| Stream { inner })
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("kind", &self.inner.hooks.name())
            .field("destroyed", &self.is_destroyed())
            .field("events", &self.inner.events)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(
        scheduler: &Scheduler,
        readable: Option<ReadableState>,
        writable: Option<WritableState>,
        hooks: Hooks,
        allow_half_open: bool,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                scheduler: scheduler.clone(),
                events: EventEmitter::new(),
                readable: readable.map(RefCell::new),
                writable: writable.map(RefCell::new),
                hooks,
                allow_half_open,
            }),
        }
    }

    pub(crate) fn rstate(&self) -> Option<RefMut<'_, ReadableState>> {
        self.inner.readable.as_ref().map(|state| state.borrow_mut())
    }

    pub(crate) fn wstate(&self) -> Option<RefMut<'_, WritableState>> {
        self.inner.writable.as_ref().map(|state| state.borrow_mut())
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Whether this entity has a readable side
    pub fn has_readable(&self) -> bool {
        self.inner.readable.is_some()
    }

    /// Whether this entity has a writable side
    pub fn has_writable(&self) -> bool {
        self.inner.writable.is_some()
    }

    pub fn downgrade(&self) -> WeakStream {
        WeakStream {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Whether both handles refer to the same stream
    pub fn ptr_eq(&self, other: &Stream) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe to an event
    ///
    /// Attaching a `Data` listener switches a readable into flowing mode;
    /// attaching a `Readable` listener switches it into paused mode.
    pub fn on(&self, kind: EventKind, listener: impl Fn(&Event) + 'static) -> ListenerId {
        let id = self.inner.events.on(kind, listener);
        readable::on_listener_added(self, kind);
        id
    }

    pub fn once(&self, kind: EventKind, listener: impl Fn(&Event) + 'static) -> ListenerId {
        let id = self.inner.events.once(kind, listener);
        readable::on_listener_added(self, kind);
        id
    }

    pub fn prepend(&self, kind: EventKind, listener: impl Fn(&Event) + 'static) -> ListenerId {
        let id = self.inner.events.prepend(kind, listener);
        readable::on_listener_added(self, kind);
        id
    }

    /// Unsubscribe. Returns false if the listener was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        match self.inner.events.off(id) {
            Some(kind) => {
                if kind == EventKind::Readable {
                    readable::on_readable_listener_removed(self);
                }
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.events.listener_count(kind)
    }

    /// Dispatch an event. An `Error` nobody listens to is reported to the
    /// scheduler as uncaught.
    pub(crate) fn emit(&self, event: Event) -> bool {
        let handled = self.inner.events.emit(&event);
        if !handled {
            if let Event::Error(err) = event {
                self.inner.scheduler.report_uncaught(err);
            }
        }
        handled
    }

    /// Tear the stream down. Idempotent: only the first call runs the
    /// destroy hook.
    pub fn destroy(&self, err: Option<StreamError>) {
        destroy::destroy(self, err);
    }

    pub fn is_destroyed(&self) -> bool {
        let readable = self.inner.readable.as_ref().is_some_and(|r| r.borrow().destroyed);
        let writable = self.inner.writable.as_ref().is_some_and(|w| w.borrow().destroyed);
        readable || writable
    }

    /// The error the stream failed with, if any
    pub fn errored(&self) -> Option<StreamError> {
        let readable = self.inner.readable.as_ref().and_then(|r| r.borrow().errored.clone());
        readable.or_else(|| {
            self.inner
                .writable
                .as_ref()
                .and_then(|w| w.borrow().errored.clone())
        })
    }

    /// Whether the destroy hook completed
    pub fn is_closed(&self) -> bool {
        let readable = self.inner.readable.as_ref().is_some_and(|r| r.borrow().closed);
        let writable = self.inner.writable.as_ref().is_some_and(|w| w.borrow().closed);
        readable || writable
    }

    // --- hook dispatch -----------------------------------------------------

    pub(crate) fn call_read(&self, size: usize) {
        match &self.inner.hooks {
            Hooks::Readable(Some(source)) | Hooks::Duplex { source, .. } => {
                let source = source.clone();
                source.read(&ReadController::new(self.clone()), size);
            }
            Hooks::Readable(None) => {
                destroy::error_or_destroy(self, StreamError::MethodNotImplemented("read"), false);
            }
            Hooks::Transform { .. } => transform::on_read(self, size),
            Hooks::Writable(_) => {}
        }
    }

    pub(crate) fn supports_writev(&self) -> bool {
        match &self.inner.hooks {
            Hooks::Writable(sink) | Hooks::Duplex { sink, .. } => sink.supports_writev(),
            _ => false,
        }
    }

    pub(crate) fn call_write(&self, chunk: Chunk, encoding: Encoding, done: Completion) {
        match &self.inner.hooks {
            Hooks::Writable(sink) | Hooks::Duplex { sink, .. } => {
                let sink = sink.clone();
                sink.write(chunk, encoding, done);
            }
            Hooks::Transform { .. } => transform::on_write(self, chunk, encoding, done),
            Hooks::Readable(_) => done.error(StreamError::MethodNotImplemented("write")),
        }
    }

    pub(crate) fn call_writev(&self, chunks: Vec<(Chunk, Encoding)>, done: Completion) {
        match &self.inner.hooks {
            Hooks::Writable(sink) | Hooks::Duplex { sink, .. } => {
                let sink = sink.clone();
                sink.writev(chunks, done);
            }
            _ => done.error(StreamError::MethodNotImplemented("writev")),
        }
    }

    pub(crate) fn call_final(&self, done: Completion) {
        match &self.inner.hooks {
            Hooks::Writable(sink) | Hooks::Duplex { sink, .. } => {
                let sink = sink.clone();
                sink.finalize(done);
            }
            Hooks::Transform { .. } => transform::on_final(self, done),
            Hooks::Readable(_) => done.ok(),
        }
    }

    pub(crate) fn call_destroy(&self, err: Option<StreamError>, done: Completion) {
        match &self.inner.hooks {
            Hooks::Readable(Some(source)) => source.clone().destroy(err, done),
            Hooks::Readable(None) => done.complete(err.map_or(Ok(()), Err)),
            Hooks::Writable(sink) => sink.clone().destroy(err, done),
            Hooks::Duplex { source, sink } => {
                // Source first, then sink with whatever error the source left
                let sink = sink.clone();
                let weak = self.downgrade();
                let next = Completion::new(self, move |result: Result<(), StreamError>| {
                    if let Some(stream) = weak.upgrade() {
                        let chained = Completion::new(&stream, move |result| done.complete(result));
                        sink.destroy(result.err(), chained);
                    }
                });
                source.clone().destroy(err, next);
            }
            Hooks::Transform { transformer, .. } => transformer.clone().destroy(err, done),
        }
    }
}

/// Access to the underlying [`Stream`] of a typed stream handle
pub trait AsStream {
    fn as_stream(&self) -> &Stream;

    /// A cloned handle, e.g. for `pipeline`
    fn handle(&self) -> Stream {
        self.as_stream().clone()
    }

    fn on(&self, kind: EventKind, listener: impl Fn(&Event) + 'static) -> ListenerId
    where
        Self: Sized,
    {
        self.as_stream().on(kind, listener)
    }

    fn once(&self, kind: EventKind, listener: impl Fn(&Event) + 'static) -> ListenerId
    where
        Self: Sized,
    {
        self.as_stream().once(kind, listener)
    }

    fn off(&self, id: ListenerId) -> bool {
        self.as_stream().off(id)
    }

    fn listener_count(&self, kind: EventKind) -> usize {
        self.as_stream().listener_count(kind)
    }

    fn destroy(&self, err: Option<StreamError>) {
        self.as_stream().destroy(err)
    }

    fn is_destroyed(&self) -> bool {
        self.as_stream().is_destroyed()
    }

    fn errored(&self) -> Option<StreamError> {
        self.as_stream().errored()
    }

    fn scheduler(&self) -> &Scheduler {
        self.as_stream().scheduler()
    }
}

impl AsStream for Stream {
    fn as_stream(&self) -> &Stream {
        self
    }
}
