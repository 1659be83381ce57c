//! Writable side of a stream
//!
//! Writes go straight to the [`Sink`] when nothing is in flight and the
//! stream is not corked; otherwise they wait in an ordered request queue.
//! `write()` returns false once the buffered length reaches the high-water
//! mark, and a single `drain` follows when it falls back to zero. Buffering
//! is advisory: a producer that ignores the signal keeps buffering.
//!
//! Ending runs the sink's `finalize` hook once, emits `prefinish`, and emits
//! `finish` on a later turn once no write callback is outstanding.

use crate::{
    chunk::Chunk,
    config::WritableOptions,
    destroy,
    encoding::Encoding,
    error::{StreamError, StreamResult},
    events::Event,
    hooks::{Completion, Sink},
    scheduler::Scheduler,
    stream::{AsStream, Hooks, Stream},
};
use std::{collections::VecDeque, rc::Rc};

/// Callback invoked once a write, or `end`, has been handled
pub type WriteCallback = Box<dyn FnOnce(StreamResult<()>)>;

fn noop_callback() -> WriteCallback {
    Box::new(|_| {})
}

pub(crate) struct WriteRequest {
    chunk: Chunk,
    encoding: Encoding,
    callback: WriteCallback,
}

pub(crate) struct WritableState {
    pub(crate) object_mode: bool,
    pub(crate) high_water_mark: usize,
    pub(crate) decode_strings: bool,
    pub(crate) default_encoding: Encoding,
    pub(crate) final_called: bool,
    pub(crate) need_drain: bool,
    /// `end()` was called
    pub(crate) ending: bool,
    /// `end()` returned
    pub(crate) ended: bool,
    pub(crate) finished: bool,
    pub(crate) destroyed: bool,
    /// Buffered plus in-flight units
    pub(crate) length: usize,
    pub(crate) writing: bool,
    pub(crate) corked: u32,
    /// Inside a synchronous call to the sink
    pub(crate) sync: bool,
    pub(crate) buffer_processing: bool,
    writecb: Option<WriteCallback>,
    writelen: usize,
    buffered: VecDeque<WriteRequest>,
    /// Callbacks that still have to run before `finish`
    pub(crate) pending_cb: usize,
    pub(crate) prefinished: bool,
    pub(crate) error_emitted: bool,
    pub(crate) emit_close: bool,
    pub(crate) auto_destroy: bool,
    pub(crate) errored: Option<StreamError>,
    pub(crate) closed: bool,
    pub(crate) close_emitted: bool,
    /// `end` callbacks waiting for `finish`
    on_finished: Vec<WriteCallback>,
}

impl WritableState {
    pub(crate) fn new(options: &WritableOptions) -> Self {
        Self {
            object_mode: options.object_mode,
            high_water_mark: options.resolved_high_water_mark(),
            decode_strings: options.decode_strings,
            default_encoding: options.default_encoding,
            final_called: false,
            need_drain: false,
            ending: false,
            ended: false,
            finished: false,
            destroyed: false,
            length: 0,
            writing: false,
            corked: 0,
            sync: true,
            buffer_processing: false,
            writecb: None,
            writelen: 0,
            buffered: VecDeque::new(),
            pending_cb: 0,
            prefinished: false,
            error_emitted: false,
            emit_close: options.emit_close,
            auto_destroy: options.auto_destroy,
            errored: None,
            closed: false,
            close_emitted: false,
            on_finished: Vec::new(),
        }
    }

    fn unit_len(&self, chunk: &Chunk) -> usize {
        if self.object_mode { 1 } else { chunk.len() }
    }

    pub(crate) fn has_pending_callbacks(&self) -> bool {
        !self.buffered.is_empty() || !self.on_finished.is_empty()
    }

    fn need_finish(&self) -> bool {
        self.ending
            && self.length == 0
            && self.errored.is_none()
            && self.buffered.is_empty()
            && !self.finished
            && !self.writing
            && !self.error_emitted
            && !self.close_emitted
    }
}

/// Validate a chunk and convert it to what the sink receives
fn prepare_chunk(
    state: &WritableState,
    chunk: Chunk,
    encoding: Encoding,
) -> StreamResult<(Chunk, Encoding)> {
    if chunk.is_null_value() {
        return Err(StreamError::NullValues);
    }
    if state.object_mode {
        return Ok((chunk, encoding));
    }
    match chunk {
        Chunk::Object(_) => Err(StreamError::InvalidChunk),
        Chunk::Bytes(bytes) => Ok((Chunk::Bytes(bytes), Encoding::Buffer)),
        Chunk::Text(text) if state.decode_strings => {
            Ok((Chunk::Bytes(encoding.encode(&text)?), Encoding::Buffer))
        }
        Chunk::Text(text) => Ok((Chunk::Text(text), encoding)),
    }
}

/// Queue or dispatch a write. Returns false when the caller should wait
/// for `drain`.
pub(crate) fn write(
    stream: &Stream,
    chunk: Chunk,
    encoding: Option<Encoding>,
    callback: Option<WriteCallback>,
) -> bool {
    let callback = callback.unwrap_or_else(noop_callback);
    let Some(mut w) = stream.wstate() else {
        callback(Err(StreamError::MethodNotImplemented("write")));
        return false;
    };
    let encoding = encoding.unwrap_or(w.default_encoding);
    let prepared = prepare_chunk(&w, chunk, encoding).and_then(|prepared| {
        if w.ending {
            Err(StreamError::WriteAfterEnd)
        } else if w.destroyed {
            Err(StreamError::Destroyed("write"))
        } else {
            Ok(prepared)
        }
    });
    match prepared {
        Ok((chunk, encoding)) => {
            w.pending_cb += 1;
            drop(w);
            write_or_buffer(stream, chunk, encoding, callback)
        }
        Err(err) => {
            drop(w);
            log::debug!("rejecting write: {}", err);
            let delivered = err.clone();
            stream
                .scheduler()
                .next_tick(move || callback(Err(delivered)));
            destroy::error_or_destroy(stream, err, true);
            false
        }
    }
}

fn write_or_buffer(
    stream: &Stream,
    chunk: Chunk,
    encoding: Encoding,
    callback: WriteCallback,
) -> bool {
    let Some(mut w) = stream.wstate() else {
        return false;
    };
    let len = w.unit_len(&chunk);
    w.length += len;
    let ret = w.length < w.high_water_mark;
    if !ret {
        w.need_drain = true;
    }
    if w.writing || w.corked > 0 || w.errored.is_some() {
        w.buffered.push_back(WriteRequest {
            chunk,
            encoding,
            callback,
        });
        drop(w);
    } else {
        drop(w);
        do_write(stream, len, chunk, encoding, callback);
    }
    stream
        .wstate()
        .is_some_and(|w| ret && w.errored.is_none() && !w.destroyed)
}

fn write_completion(stream: &Stream) -> Completion {
    let target = stream.clone();
    Completion::new(stream, move |result| on_write(&target, result))
}

/// Mark a write in flight; returns false if the stream was destroyed
fn begin_write(stream: &Stream, len: usize, callback: WriteCallback) -> bool {
    let Some(mut w) = stream.wstate() else {
        return false;
    };
    w.writelen = len;
    w.writecb = Some(callback);
    w.writing = true;
    w.sync = true;
    !w.destroyed
}

fn end_sync(stream: &Stream) {
    if let Some(mut w) = stream.wstate() {
        w.sync = false;
    }
}

fn do_write(stream: &Stream, len: usize, chunk: Chunk, encoding: Encoding, callback: WriteCallback) {
    if begin_write(stream, len, callback) {
        stream.call_write(chunk, encoding, write_completion(stream));
    } else {
        on_write(stream, Err(StreamError::Destroyed("write")));
    }
    end_sync(stream);
}

fn do_writev(stream: &Stream, len: usize, chunks: Vec<(Chunk, Encoding)>, callback: WriteCallback) {
    if begin_write(stream, len, callback) {
        stream.call_writev(chunks, write_completion(stream));
    } else {
        on_write(stream, Err(StreamError::Destroyed("write")));
    }
    end_sync(stream);
}

fn on_write(stream: &Stream, result: StreamResult<()>) {
    let (sync, callback, has_buffered) = {
        let Some(mut w) = stream.wstate() else {
            return;
        };
        let Some(callback) = w.writecb.take() else {
            drop(w);
            destroy::error_or_destroy(stream, StreamError::MultipleCallback, false);
            return;
        };
        let writelen = w.writelen;
        w.writing = false;
        w.length = w.length.saturating_sub(writelen);
        w.writelen = 0;
        if let Err(err) = &result {
            if w.errored.is_none() {
                w.errored = Some(err.clone());
            }
        }
        (w.sync, callback, !w.buffered.is_empty())
    };

    match result {
        Err(err) => {
            if sync {
                let stream = stream.clone();
                stream
                    .scheduler()
                    .clone()
                    .next_tick(move || on_write_error(&stream, err, callback));
            } else {
                on_write_error(stream, err, callback);
            }
        }
        Ok(()) => {
            if has_buffered {
                clear_buffer(stream);
            }
            if sync {
                let stream = stream.clone();
                stream
                    .scheduler()
                    .clone()
                    .next_tick(move || after_write(&stream, callback));
            } else {
                after_write(stream, callback);
            }
        }
    }
}

fn on_write_error(stream: &Stream, err: StreamError, callback: WriteCallback) {
    if let Some(mut w) = stream.wstate() {
        w.pending_cb = w.pending_cb.saturating_sub(1);
    }
    callback(Err(err.clone()));
    error_buffer(stream);
    destroy::error_or_destroy(stream, err, false);
}

fn after_write(stream: &Stream, callback: WriteCallback) {
    let destroyed = stream.is_destroyed();
    let (need_drain, terminal) = {
        let Some(mut w) = stream.wstate() else {
            return;
        };
        let need_drain = !w.ending && !destroyed && w.length == 0 && w.need_drain;
        if need_drain {
            w.need_drain = false;
        }
        w.pending_cb = w.pending_cb.saturating_sub(1);
        let terminal = w
            .destroyed
            .then(|| w.errored.clone().unwrap_or(StreamError::Destroyed("write")));
        (need_drain, terminal)
    };

    if need_drain {
        stream.emit(Event::Drain);
    }
    match terminal {
        Some(err) => {
            callback(Err(err));
            error_buffer(stream);
        }
        None => callback(Ok(())),
    }
    finish_maybe(stream, false);
}

/// Fail every queued write and `end` callback with the terminal error
pub(crate) fn error_buffer(stream: &Stream) {
    let (requests, on_finished, write_err, end_err) = {
        let Some(mut w) = stream.wstate() else {
            return;
        };
        if w.writing {
            return;
        }
        let requests: Vec<WriteRequest> = w.buffered.drain(..).collect();
        let released: usize = requests.iter().map(|r| w.unit_len(&r.chunk)).sum();
        w.length = w.length.saturating_sub(released);
        w.pending_cb = w.pending_cb.saturating_sub(requests.len());
        let on_finished: Vec<WriteCallback> = w.on_finished.drain(..).collect();
        let write_err = w.errored.clone().unwrap_or(StreamError::Destroyed("write"));
        let end_err = w.errored.clone().unwrap_or(StreamError::Destroyed("end"));
        (requests, on_finished, write_err, end_err)
    };
    for request in requests {
        (request.callback)(Err(write_err.clone()));
    }
    for callback in on_finished {
        callback(Err(end_err.clone()));
    }
}

/// Flush queued writes, batched through `writev` when the sink supports it
fn clear_buffer(stream: &Stream) {
    let supports_writev = stream.supports_writev();
    let batch = {
        let Some(mut w) = stream.wstate() else {
            return;
        };
        if w.corked > 0 || w.buffer_processing || w.destroyed || w.buffered.is_empty() {
            return;
        }
        w.buffer_processing = true;
        w.buffered.len() > 1 && supports_writev
    };

    if batch {
        let (requests, len) = {
            let Some(mut w) = stream.wstate() else {
                return;
            };
            let count = w.buffered.len();
            w.pending_cb = w.pending_cb.saturating_sub(count - 1);
            let requests: Vec<WriteRequest> = w.buffered.drain(..).collect();
            (requests, w.length)
        };
        log::trace!("flushing {} buffered writes as one batch", requests.len());
        let mut chunks = Vec::with_capacity(requests.len());
        let mut callbacks = Vec::with_capacity(requests.len());
        for request in requests {
            chunks.push((request.chunk, request.encoding));
            callbacks.push(request.callback);
        }
        let callback: WriteCallback = Box::new(move |result: StreamResult<()>| {
            for callback in callbacks {
                callback(result.clone());
            }
        });
        do_writev(stream, len, chunks, callback);
    } else {
        loop {
            let next = stream.wstate().and_then(|mut w| {
                let request = w.buffered.pop_front()?;
                let len = w.unit_len(&request.chunk);
                Some((request, len))
            });
            let Some((request, len)) = next else {
                break;
            };
            do_write(stream, len, request.chunk, request.encoding, request.callback);
            if stream.wstate().is_none_or(|w| w.writing) {
                break;
            }
        }
    }

    if let Some(mut w) = stream.wstate() {
        w.buffer_processing = false;
    }
}

pub(crate) fn cork(stream: &Stream) {
    if let Some(mut w) = stream.wstate() {
        w.corked += 1;
    }
}

pub(crate) fn uncork(stream: &Stream) {
    let flush = match stream.wstate() {
        Some(mut w) if w.corked > 0 => {
            w.corked -= 1;
            !w.writing
        }
        _ => false,
    };
    if flush {
        clear_buffer(stream);
    }
}

/// Signal that no more data will be written
pub(crate) fn end(stream: &Stream, chunk: Option<Chunk>, callback: Option<WriteCallback>) {
    if let Some(chunk) = chunk {
        write(stream, chunk, None, None);
    }

    let corked = stream.wstate().is_some_and(|w| w.corked > 0);
    if corked {
        if let Some(mut w) = stream.wstate() {
            w.corked = 1;
        }
        uncork(stream);
    }

    let starting = match stream.wstate() {
        Some(mut w) if w.errored.is_none() && !w.ending => {
            w.ending = true;
            true
        }
        Some(_) => false,
        None => return,
    };

    let err = if starting {
        log::debug!("writable ending");
        finish_maybe(stream, true);
        if let Some(mut w) = stream.wstate() {
            w.ended = true;
        }
        None
    } else {
        stream.wstate().and_then(|w| {
            if w.finished {
                Some(StreamError::AlreadyFinished("end"))
            } else if w.destroyed {
                Some(StreamError::Destroyed("end"))
            } else {
                None
            }
        })
    };

    let Some(callback) = callback else {
        return;
    };
    let finished = stream.wstate().is_some_and(|w| w.finished);
    if err.is_some() || finished {
        stream
            .scheduler()
            .next_tick(move || callback(err.map_or(Ok(()), Err)));
    } else if let Some(mut w) = stream.wstate() {
        w.on_finished.push(callback);
    }
}

pub(crate) fn finish_maybe(stream: &Stream, sync: bool) {
    if !stream.wstate().is_some_and(|w| w.need_finish()) {
        return;
    }
    prefinish(stream);
    let schedule = match stream.wstate() {
        Some(mut w) if w.pending_cb == 0 && w.need_finish() => {
            w.pending_cb += 1;
            true
        }
        _ => false,
    };
    if schedule {
        if sync {
            let stream = stream.clone();
            stream.scheduler().clone().next_tick(move || finish(&stream));
        } else {
            finish(stream);
        }
    }
}

fn prefinish(stream: &Stream) {
    // Some(true): run the finalize hook; Some(false): destroyed, skip it
    let run_final = match stream.wstate() {
        Some(mut w) if !w.prefinished && !w.final_called => {
            if w.destroyed {
                w.prefinished = true;
                Some(false)
            } else {
                w.final_called = true;
                Some(true)
            }
        }
        _ => None,
    };
    match run_final {
        Some(true) => call_final(stream),
        Some(false) => {
            stream.emit(Event::Prefinish);
        }
        None => {}
    }
}

fn call_final(stream: &Stream) {
    if let Some(mut w) = stream.wstate() {
        w.sync = true;
        w.pending_cb += 1;
    }
    let target = stream.clone();
    let done = Completion::new(stream, move |result| on_final(&target, result));
    stream.call_final(done);
    end_sync(stream);
}

fn on_final(stream: &Stream, result: StreamResult<()>) {
    let sync = match stream.wstate() {
        Some(mut w) => {
            w.pending_cb = w.pending_cb.saturating_sub(1);
            w.sync
        }
        None => return,
    };
    match result {
        Err(err) => {
            let callbacks: Vec<WriteCallback> = stream
                .wstate()
                .map(|mut w| w.on_finished.drain(..).collect())
                .unwrap_or_default();
            for callback in callbacks {
                callback(Err(err.clone()));
            }
            destroy::error_or_destroy(stream, err, sync);
        }
        Ok(()) => {
            let ready = match stream.wstate() {
                Some(mut w) if w.need_finish() => {
                    w.prefinished = true;
                    true
                }
                _ => false,
            };
            if ready {
                stream.emit(Event::Prefinish);
                if let Some(mut w) = stream.wstate() {
                    w.pending_cb += 1;
                }
                let stream = stream.clone();
                stream.scheduler().clone().next_tick(move || finish(&stream));
            }
        }
    }
}

fn finish(stream: &Stream) {
    let (callbacks, auto_destroy) = {
        let Some(mut w) = stream.wstate() else {
            return;
        };
        w.pending_cb = w.pending_cb.saturating_sub(1);
        w.finished = true;
        let callbacks: Vec<WriteCallback> = w.on_finished.drain(..).collect();
        (callbacks, w.auto_destroy)
    };
    for callback in callbacks {
        callback(Ok(()));
    }
    log::debug!("writable finished");
    stream.emit(Event::Finish);

    if auto_destroy {
        let readable_done = match stream.rstate() {
            Some(r) => r.auto_destroy && r.end_emitted,
            None => true,
        };
        if readable_done {
            destroy::destroy(stream, None);
        }
    }
}

/// Producer-side operations of anything with a writable side
pub trait Writable: AsStream {
    /// Write a chunk. Returns false once the buffer reached the
    /// high-water mark; wait for `drain` before writing more.
    fn write(&self, chunk: impl Into<Chunk>) -> bool
    where
        Self: Sized,
    {
        write(self.as_stream(), chunk.into(), None, None)
    }

    /// Write with an explicit encoding and a completion callback
    fn write_with(
        &self,
        chunk: impl Into<Chunk>,
        encoding: Option<Encoding>,
        callback: impl FnOnce(StreamResult<()>) + 'static,
    ) -> bool
    where
        Self: Sized,
    {
        write(self.as_stream(), chunk.into(), encoding, Some(Box::new(callback)))
    }

    fn end(&self) {
        end(self.as_stream(), None, None)
    }

    /// Optionally write a last chunk, then end; `callback` runs after
    /// `finish` or with the error that prevented it
    fn end_with(&self, chunk: Option<Chunk>, callback: impl FnOnce(StreamResult<()>) + 'static)
    where
        Self: Sized,
    {
        end(self.as_stream(), chunk, Some(Box::new(callback)))
    }

    /// Buffer writes until the matching `uncork`
    fn cork(&self) {
        cork(self.as_stream())
    }

    fn uncork(&self) {
        uncork(self.as_stream())
    }

    fn set_default_encoding(&self, encoding: Encoding) {
        if let Some(mut w) = self.as_stream().wstate() {
            w.default_encoding = encoding;
        }
    }

    fn writable_length(&self) -> usize {
        self.as_stream().wstate().map_or(0, |w| w.length)
    }

    fn writable_high_water_mark(&self) -> usize {
        self.as_stream().wstate().map_or(0, |w| w.high_water_mark)
    }

    /// Whether `end` was called
    fn writable_ended(&self) -> bool {
        self.as_stream().wstate().is_some_and(|w| w.ending)
    }

    fn writable_finished(&self) -> bool {
        self.as_stream().wstate().is_some_and(|w| w.finished)
    }

    fn writable_need_drain(&self) -> bool {
        self.as_stream().wstate().is_some_and(|w| w.need_drain)
    }

    fn writable_corked(&self) -> u32 {
        self.as_stream().wstate().map_or(0, |w| w.corked)
    }

    fn writable_object_mode(&self) -> bool {
        self.as_stream().wstate().is_some_and(|w| w.object_mode)
    }
}

impl Writable for Stream {}

/// A stream with only a writable side
#[derive(Clone, Debug)]
pub struct WritableStream {
    stream: Stream,
}

impl AsStream for WritableStream {
    fn as_stream(&self) -> &Stream {
        &self.stream
    }
}

impl Writable for WritableStream {}

impl WritableStream {
    pub fn new(scheduler: &Scheduler, options: WritableOptions, sink: impl Sink) -> Self {
        let state = WritableState::new(&options);
        Self {
            stream: Stream::new(
                scheduler,
                None,
                Some(state),
                Hooks::Writable(Rc::new(sink)),
                true,
            ),
        }
    }
}
