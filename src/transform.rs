//! Transform streams
//!
//! A duplex whose written chunks are handed to a [`Transformer`] and whose
//! readable side carries what the transformer pushes. One transform runs at a
//! time: the next buffered write is dispatched only after the current one
//! completed. On end, `flush` runs once and the readable side is ended.

use crate::{
    chunk::Chunk,
    config::DuplexOptions,
    encoding::Encoding,
    error::{StreamError, StreamResult},
    hooks::{Completion, ReadController, Transformer},
    readable::{self, Readable, ReadableState},
    scheduler::Scheduler,
    stream::{AsStream, Hooks, Stream},
    writable::{Writable, WritableState},
};
use std::{cell::RefCell, rc::Rc};

#[derive(Default)]
pub(crate) struct TransformState {
    transforming: bool,
    need_transform: bool,
    write_chunk: Option<(Chunk, Encoding)>,
    write_cb: Option<Completion>,
}

fn transform_parts(stream: &Stream) -> Option<(&Rc<dyn Transformer>, &RefCell<TransformState>)> {
    match &stream.inner.hooks {
        Hooks::Transform { transformer, state } => Some((transformer, state)),
        _ => None,
    }
}

/// Any push answers the readable side's outstanding request for data
pub(crate) fn clear_need_transform(stream: &Stream) {
    if let Some((_, state)) = transform_parts(stream) {
        state.borrow_mut().need_transform = false;
    }
}

fn wants_data(stream: &Stream) -> Option<usize> {
    stream.rstate().and_then(|r| {
        (r.need_readable || r.length() < r.high_water_mark).then_some(r.high_water_mark)
    })
}

/// Write hook: park the chunk until the readable side asks for data
pub(crate) fn on_write(stream: &Stream, chunk: Chunk, encoding: Encoding, done: Completion) {
    let Some((_, state)) = transform_parts(stream) else {
        done.error(StreamError::MethodNotImplemented("transform"));
        return;
    };
    let (transforming, need_transform) = {
        let mut ts = state.borrow_mut();
        ts.write_cb = Some(done);
        ts.write_chunk = Some((chunk, encoding));
        (ts.transforming, ts.need_transform)
    };
    if transforming {
        return;
    }
    let hwm = stream.rstate().map_or(0, |r| r.high_water_mark);
    if need_transform {
        on_read(stream, hwm);
    } else if let Some(size) = wants_data(stream) {
        on_read(stream, size);
    }
}

/// Read hook: run the transformer on the parked chunk, if any
pub(crate) fn on_read(stream: &Stream, _size: usize) {
    let Some((transformer, state)) = transform_parts(stream) else {
        return;
    };
    let next = {
        let mut ts = state.borrow_mut();
        if ts.write_chunk.is_some() && !ts.transforming {
            ts.transforming = true;
            ts.write_chunk.take()
        } else {
            ts.need_transform = true;
            None
        }
    };
    if let Some((chunk, encoding)) = next {
        let target = stream.clone();
        let done = Completion::new(stream, move |result| after_transform(&target, result));
        let transformer = transformer.clone();
        transformer.transform(&ReadController::new(stream.clone()), chunk, encoding, done);
    }
}

fn after_transform(stream: &Stream, result: StreamResult<Option<Chunk>>) {
    let Some((_, state)) = transform_parts(stream) else {
        return;
    };
    let callback = {
        let mut ts = state.borrow_mut();
        ts.transforming = false;
        ts.write_chunk = None;
        ts.write_cb.take()
    };
    let Some(callback) = callback else {
        crate::destroy::error_or_destroy(stream, StreamError::MultipleCallback, false);
        return;
    };

    match result {
        Ok(data) => {
            if let Some(data) = data {
                readable::push(stream, Some(data));
            }
            callback.ok();
        }
        Err(err) => callback.error(err),
    }

    if let Some(mut r) = stream.rstate() {
        r.reading = false;
    }
    if let Some(size) = wants_data(stream) {
        on_read(stream, size);
    }
}

/// Final hook: flush, then end the readable side
pub(crate) fn on_final(stream: &Stream, done: Completion) {
    let Some((transformer, _)) = transform_parts(stream) else {
        done.ok();
        return;
    };
    let destroyed = stream.rstate().is_some_and(|r| r.destroyed);
    if destroyed {
        flush_done(stream, Ok(None), done);
        return;
    }
    let target = stream.clone();
    let flushed = Completion::new(stream, move |result| flush_done(&target, result, done));
    let transformer = transformer.clone();
    transformer.flush(&ReadController::new(stream.clone()), flushed);
}

fn flush_done(stream: &Stream, result: StreamResult<Option<Chunk>>, done: Completion) {
    let data = match result {
        Ok(data) => data,
        Err(err) => {
            done.error(err);
            return;
        }
    };
    if let Some(data) = data {
        readable::push(stream, Some(data));
    }
    if stream.wstate().is_some_and(|w| w.length != 0) {
        done.error(StreamError::TransformWithLengthZero);
        return;
    }
    let transforming = transform_parts(stream).is_some_and(|(_, state)| state.borrow().transforming);
    if transforming {
        done.error(StreamError::TransformAlreadyTransforming);
        return;
    }
    log::trace!("transform flushed");
    readable::push(stream, None);
    done.ok();
}

/// Transformer that forwards every chunk unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl Transformer for PassThrough {
    fn transform(
        &self,
        _ctl: &ReadController,
        chunk: Chunk,
        _encoding: Encoding,
        done: Completion<Option<Chunk>>,
    ) {
        done.complete(Ok(Some(chunk)));
    }
}

/// A duplex stream driven by a [`Transformer`]
#[derive(Clone, Debug)]
pub struct TransformStream {
    stream: Stream,
}

impl AsStream for TransformStream {
    fn as_stream(&self) -> &Stream {
        &self.stream
    }
}

impl Readable for TransformStream {}
impl Writable for TransformStream {}

impl TransformStream {
    pub fn new(scheduler: &Scheduler, options: DuplexOptions, transformer: impl Transformer) -> Self {
        let mut readable = ReadableState::new(&options.readable);
        // Writes must be able to trigger the first transform
        readable.need_readable = true;
        readable.sync = false;
        let writable = WritableState::new(&options.writable);
        let hooks = Hooks::Transform {
            transformer: Rc::new(transformer),
            state: RefCell::new(TransformState::default()),
        };
        Self {
            stream: Stream::new(
                scheduler,
                Some(readable),
                Some(writable),
                hooks,
                options.allow_half_open,
            ),
        }
    }

    pub fn pass_through(scheduler: &Scheduler, options: DuplexOptions) -> Self {
        Self::new(scheduler, options, PassThrough)
    }
}
