//! Readable side of a stream
//!
//! Buffers chunks produced by a [`Source`] and hands them to the consumer in
//! one of two modes:
//! - paused: the consumer pulls with `read()`, usually from a `readable`
//!   listener
//! - flowing: chunks are emitted as `data` events as soon as they arrive
//!
//! A source is pulled whenever the buffer is below the high-water mark and no
//! pull is already outstanding. `readable` notifications are deferred one
//! turn, so a burst of synchronous pushes produces a single notification.
//! Once the stream ended and the buffer drained, `end` is emitted exactly once.

use crate::{
    async_iter::ReadableIter,
    buffer_list::BufferList,
    chunk::Chunk,
    config::{MAX_HIGH_WATER_MARK, PipeOptions, ReadableOptions},
    destroy,
    encoding::Encoding,
    error::StreamError,
    events::{Event, EventKind},
    hooks::{IterSource, Source, source_fn},
    pipe,
    scheduler::Scheduler,
    stream::{AsStream, Hooks, Stream},
    string_decoder::StringDecoder,
    transform,
    writable::{self, Writable},
};
use std::rc::Rc;

/// A destination attached with `pipe`
pub(crate) struct PipeRegistration {
    pub(crate) dest: Stream,
    /// Writes to `dest` that returned false and still wait for `drain`
    pub(crate) await_drain: usize,
}

pub(crate) struct ReadableState {
    pub(crate) object_mode: bool,
    pub(crate) high_water_mark: usize,
    pub(crate) buffer: BufferList,
    /// `None` until a consumer picks a mode
    pub(crate) flowing: Option<bool>,
    pub(crate) ended: bool,
    pub(crate) end_emitted: bool,
    /// A pull on the source is outstanding
    pub(crate) reading: bool,
    /// Inside a synchronous call to the source
    pub(crate) sync: bool,
    pub(crate) need_readable: bool,
    pub(crate) emitted_readable: bool,
    pub(crate) readable_listening: bool,
    pub(crate) resume_scheduled: bool,
    /// Explicit `pause()`/`resume()` by the consumer
    pub(crate) paused: Option<bool>,
    pub(crate) reading_more: bool,
    pub(crate) destroyed: bool,
    pub(crate) errored: Option<StreamError>,
    pub(crate) error_emitted: bool,
    pub(crate) closed: bool,
    pub(crate) close_emitted: bool,
    pub(crate) emit_close: bool,
    pub(crate) auto_destroy: bool,
    pub(crate) decoder: Option<StringDecoder>,
    pub(crate) encoding: Option<Encoding>,
    pub(crate) pipes: Vec<PipeRegistration>,
}

impl ReadableState {
    pub(crate) fn new(options: &ReadableOptions) -> Self {
        Self {
            object_mode: options.object_mode,
            high_water_mark: options.resolved_high_water_mark(),
            buffer: BufferList::new(options.object_mode),
            flowing: None,
            ended: false,
            end_emitted: false,
            reading: false,
            sync: true,
            need_readable: false,
            emitted_readable: false,
            readable_listening: false,
            resume_scheduled: false,
            paused: None,
            reading_more: false,
            destroyed: false,
            errored: None,
            error_emitted: false,
            closed: false,
            close_emitted: false,
            emit_close: options.emit_close,
            auto_destroy: options.auto_destroy,
            decoder: options.encoding.map(StringDecoder::new),
            encoding: options.encoding,
            pipes: Vec::new(),
        }
    }

    pub(crate) fn length(&self) -> usize {
        self.buffer.length()
    }

    pub(crate) fn reset_await_drain(&mut self) {
        for registration in &mut self.pipes {
            registration.await_drain = 0;
        }
    }

    pub(crate) fn awaiting_drain(&self) -> bool {
        self.pipes.iter().any(|p| p.await_drain > 0)
    }
}

fn compute_new_high_water_mark(n: usize) -> usize {
    if n >= MAX_HIGH_WATER_MARK {
        MAX_HIGH_WATER_MARK
    } else {
        n.next_power_of_two()
    }
}

/// Units to hand out for a `read(n)`; `None` means "whatever is convenient"
fn how_much_to_read(n: Option<usize>, state: &ReadableState) -> usize {
    let length = state.length();
    match n {
        Some(0) => 0,
        _ if length == 0 && state.ended => 0,
        _ if state.object_mode => 1,
        None => {
            if state.flowing == Some(true) && length > 0 {
                state.buffer.first().map(Chunk::len).unwrap_or(0)
            } else {
                length
            }
        }
        Some(n) if n <= length => n,
        Some(_) if state.ended => length,
        Some(_) => 0,
    }
}

fn from_list(n: usize, state: &mut ReadableState) -> Option<Chunk> {
    if state.length() == 0 {
        return None;
    }
    if state.object_mode {
        return state.buffer.shift();
    }
    if n >= state.length() {
        return state.buffer.take_all();
    }
    let has_strings = state.decoder.is_some();
    state.buffer.consume(n, has_strings)
}

/// Pull up to `n` units out of the buffer, refilling from the source
pub(crate) fn read(stream: &Stream, n: Option<usize>) -> Option<Chunk> {
    let Some(mut r) = stream.rstate() else {
        return None;
    };
    if let Some(n) = n {
        if n > r.high_water_mark {
            r.high_water_mark = compute_new_high_water_mark(n);
        }
    }
    if n != Some(0) {
        r.emitted_readable = false;
    }

    // read(0) with enough buffered only re-arms the notification
    if n == Some(0) && r.need_readable {
        let filled = if r.high_water_mark != 0 {
            r.length() >= r.high_water_mark
        } else {
            r.length() > 0
        };
        if filled || r.ended {
            let end = r.length() == 0 && r.ended;
            drop(r);
            if end {
                end_readable(stream);
            } else {
                emit_readable(stream);
            }
            return None;
        }
    }

    let mut take = how_much_to_read(n, &r);
    if take == 0 && r.ended {
        let drained = r.length() == 0;
        drop(r);
        if drained {
            end_readable(stream);
        }
        return None;
    }

    let blocked = r.ended || r.reading || r.destroyed || r.errored.is_some();
    let below_mark = r.length() == 0 || r.length() - take < r.high_water_mark;
    if !blocked && (r.need_readable || below_mark) {
        r.reading = true;
        r.sync = true;
        if r.length() == 0 {
            r.need_readable = true;
        }
        let size = r.high_water_mark;
        drop(r);
        stream.call_read(size);
        r = match stream.rstate() {
            Some(r) => r,
            None => return None,
        };
        r.sync = false;
        // A synchronous push may have changed what is available
        if !r.reading {
            take = how_much_to_read(n, &r);
        }
    }

    let ret = if take > 0 { from_list(take, &mut r) } else { None };
    match ret {
        None => {
            r.need_readable = r.length() <= r.high_water_mark;
            take = 0;
        }
        Some(_) => r.reset_await_drain(),
    }

    let mut end = false;
    if r.length() == 0 {
        if !r.ended {
            r.need_readable = true;
        }
        if n != Some(take) && r.ended {
            end = true;
        }
    }
    drop(r);

    if end {
        end_readable(stream);
    }
    if let Some(chunk) = &ret {
        stream.emit(Event::Data(chunk.clone()));
    }
    ret
}

/// Append a chunk, or end the stream on `None`
pub(crate) fn push(stream: &Stream, chunk: Option<Chunk>) -> bool {
    transform::clear_need_transform(stream);
    readable_add_chunk(stream, chunk, false)
}

/// Put a chunk back at the front of the buffer
pub(crate) fn unshift(stream: &Stream, chunk: Chunk) -> bool {
    readable_add_chunk(stream, Some(chunk), true)
}

fn decode_all(encoding: Encoding, bytes: &[u8]) -> String {
    let mut decoder = StringDecoder::new(encoding);
    let mut text = decoder.write(bytes);
    text.push_str(&decoder.end());
    text
}

/// Bring a pushed chunk into the representation the buffer holds.
/// The flag tells whether it still has to go through the stream's decoder.
fn normalize_chunk(
    state: &ReadableState,
    chunk: Chunk,
    add_to_front: bool,
) -> Result<(Chunk, bool), StreamError> {
    if state.object_mode {
        if chunk.is_null_value() {
            return Err(StreamError::NullValues);
        }
        return Ok((chunk, false));
    }
    let encoding = state.decoder.as_ref().map(StringDecoder::encoding);
    match (chunk, encoding) {
        (Chunk::Object(_), _) => Err(StreamError::InvalidChunk),
        (Chunk::Text(text), None) => Ok((Chunk::Bytes(text.into_bytes().into()), false)),
        (Chunk::Text(text), Some(Encoding::Utf8)) => Ok((Chunk::Text(text), false)),
        (Chunk::Text(text), Some(encoding)) if add_to_front => {
            Ok((Chunk::Text(decode_all(encoding, text.as_bytes())), false))
        }
        (Chunk::Text(text), Some(_)) => Ok((Chunk::Bytes(text.into_bytes().into()), true)),
        (Chunk::Bytes(bytes), Some(encoding)) if add_to_front => {
            Ok((Chunk::Text(decode_all(encoding, &bytes)), false))
        }
        (Chunk::Bytes(bytes), Some(_)) => Ok((Chunk::Bytes(bytes), true)),
        (Chunk::Bytes(bytes), None) => Ok((Chunk::Bytes(bytes), false)),
    }
}

fn push_result(stream: &Stream) -> bool {
    match stream.rstate() {
        Some(r) => !r.ended && (r.length() < r.high_water_mark || r.length() == 0),
        None => false,
    }
}

fn readable_add_chunk(stream: &Stream, chunk: Option<Chunk>, add_to_front: bool) -> bool {
    let Some(mut r) = stream.rstate() else {
        return false;
    };
    let Some(chunk) = chunk else {
        r.reading = false;
        drop(r);
        on_eof_chunk(stream);
        return push_result(stream);
    };

    let (chunk, needs_decode) = match normalize_chunk(&r, chunk, add_to_front) {
        Ok(normalized) => normalized,
        Err(err) => {
            drop(r);
            destroy::error_or_destroy(stream, err, false);
            return push_result(stream);
        }
    };

    if r.object_mode || !chunk.is_empty() {
        if add_to_front {
            let end_emitted = r.end_emitted;
            drop(r);
            if end_emitted {
                destroy::error_or_destroy(stream, StreamError::UnshiftAfterEndEvent, false);
            } else {
                add_chunk(stream, chunk, true);
            }
        } else if r.ended {
            drop(r);
            destroy::error_or_destroy(stream, StreamError::PushAfterEof, false);
        } else if r.destroyed || r.errored.is_some() {
            return false;
        } else {
            r.reading = false;
            if needs_decode {
                let bytes = chunk.to_bytes();
                let text = r
                    .decoder
                    .as_mut()
                    .map(|decoder| decoder.write(&bytes))
                    .unwrap_or_default();
                drop(r);
                if text.is_empty() {
                    maybe_read_more(stream);
                } else {
                    add_chunk(stream, Chunk::Text(text), false);
                }
            } else {
                drop(r);
                add_chunk(stream, chunk, false);
            }
        }
    } else if !add_to_front {
        r.reading = false;
        drop(r);
        maybe_read_more(stream);
    }

    push_result(stream)
}

fn add_chunk(stream: &Stream, chunk: Chunk, add_to_front: bool) {
    let has_data_listeners = stream.listener_count(EventKind::Data) > 0;
    let Some(mut r) = stream.rstate() else {
        return;
    };
    if r.flowing == Some(true) && r.length() == 0 && !r.sync && has_data_listeners {
        r.reset_await_drain();
        drop(r);
        stream.emit(Event::Data(chunk));
    } else {
        if add_to_front {
            r.buffer.unshift(chunk);
        } else {
            r.buffer.push(chunk);
        }
        let need_readable = r.need_readable;
        drop(r);
        if need_readable {
            emit_readable(stream);
        }
    }
    maybe_read_more(stream);
}

fn on_eof_chunk(stream: &Stream) {
    let Some(mut r) = stream.rstate() else {
        return;
    };
    if r.ended {
        return;
    }
    let tail = r.decoder.as_mut().map(|decoder| decoder.end()).unwrap_or_default();
    if !tail.is_empty() {
        r.buffer.push(Chunk::Text(tail));
    }
    r.ended = true;
    log::trace!("readable reached end of data");

    if r.sync {
        drop(r);
        emit_readable(stream);
    } else {
        r.need_readable = false;
        r.emitted_readable = true;
        drop(r);
        emit_readable_nt(stream);
    }
}

/// Schedule a `readable` notification unless one is already pending
pub(crate) fn emit_readable(stream: &Stream) {
    let schedule = match stream.rstate() {
        Some(mut r) => {
            r.need_readable = false;
            if r.emitted_readable {
                false
            } else {
                r.emitted_readable = true;
                true
            }
        }
        None => false,
    };
    if schedule {
        let stream = stream.clone();
        stream.scheduler().clone().next_tick(move || emit_readable_nt(&stream));
    }
}

fn emit_readable_nt(stream: &Stream) {
    let should_emit = match stream.rstate() {
        Some(r) => !r.destroyed && r.errored.is_none() && (r.length() > 0 || r.ended),
        None => return,
    };
    if should_emit {
        stream.emit(Event::Readable);
        if let Some(mut r) = stream.rstate() {
            r.emitted_readable = false;
        }
    }
    if let Some(mut r) = stream.rstate() {
        r.need_readable =
            r.flowing != Some(true) && !r.ended && r.length() <= r.high_water_mark;
    }
    flow(stream);
}

fn is_flowing(stream: &Stream) -> bool {
    stream.rstate().is_some_and(|r| r.flowing == Some(true))
}

/// Drain the buffer as `data` events while flowing
pub(crate) fn flow(stream: &Stream) {
    while is_flowing(stream) && read(stream, None).is_some() {}
}

/// Refill the buffer up to the high-water mark on the next turn
fn maybe_read_more(stream: &Stream) {
    let schedule = match stream.rstate() {
        Some(mut r) if !r.reading_more => {
            r.reading_more = true;
            true
        }
        _ => false,
    };
    if schedule {
        let stream = stream.clone();
        stream.scheduler().clone().next_tick(move || maybe_read_more_nt(&stream));
    }
}

fn maybe_read_more_nt(stream: &Stream) {
    loop {
        let before = match stream.rstate() {
            Some(r) => {
                let wants_more = r.length() < r.high_water_mark
                    || (r.flowing == Some(true) && r.length() == 0);
                if r.reading || r.ended || !wants_more {
                    break;
                }
                r.length()
            }
            None => return,
        };
        read(stream, Some(0));
        let after = stream.rstate().map_or(before, |r| r.length());
        if before == after {
            // Nothing came in synchronously
            break;
        }
    }
    if let Some(mut r) = stream.rstate() {
        r.reading_more = false;
    }
}

/// Schedule the `end` event once the buffer is drained
pub(crate) fn end_readable(stream: &Stream) {
    let schedule = match stream.rstate() {
        Some(mut r) if !r.end_emitted => {
            r.ended = true;
            true
        }
        _ => false,
    };
    if schedule {
        let stream = stream.clone();
        stream.scheduler().clone().next_tick(move || end_readable_nt(&stream));
    }
}

fn end_readable_nt(stream: &Stream) {
    let auto_destroy = {
        let Some(mut r) = stream.rstate() else {
            return;
        };
        if r.error_emitted || r.close_emitted || r.end_emitted || r.length() != 0 {
            return;
        }
        r.end_emitted = true;
        r.auto_destroy
    };
    log::debug!("readable emitting end");
    stream.emit(Event::End);

    let writable_open = stream
        .wstate()
        .is_some_and(|w| !w.ending && !w.destroyed);
    if writable_open && !stream.inner.allow_half_open {
        let stream = stream.clone();
        stream.scheduler().clone().next_tick(move || {
            let open = stream.wstate().is_some_and(|w| !w.ending && !w.destroyed);
            if open {
                writable::end(&stream, None, None);
            }
        });
    } else if auto_destroy {
        let writable_done = match stream.wstate() {
            Some(w) => w.auto_destroy && w.finished,
            None => true,
        };
        if writable_done {
            destroy::destroy(stream, None);
        }
    }
}

/// Switch to flowing mode
pub(crate) fn resume(stream: &Stream) {
    let schedule = {
        let Some(mut r) = stream.rstate() else {
            return;
        };
        let mut schedule = false;
        if r.flowing != Some(true) {
            r.flowing = Some(!r.readable_listening);
            if !r.resume_scheduled {
                r.resume_scheduled = true;
                schedule = true;
            }
        }
        r.paused = Some(false);
        schedule
    };
    if schedule {
        let stream = stream.clone();
        stream.scheduler().clone().next_tick(move || resume_nt(&stream));
    }
}

fn resume_nt(stream: &Stream) {
    let reading = stream.rstate().is_some_and(|r| r.reading);
    if !reading {
        read(stream, Some(0));
    }
    if let Some(mut r) = stream.rstate() {
        r.resume_scheduled = false;
    }
    stream.emit(Event::Resume);
    flow(stream);
    let refill = stream
        .rstate()
        .is_some_and(|r| r.flowing == Some(true) && !r.reading);
    if refill {
        read(stream, Some(0));
    }
}

/// Leave flowing mode
pub(crate) fn pause(stream: &Stream) {
    let emit = {
        let Some(mut r) = stream.rstate() else {
            return;
        };
        let emit = r.flowing != Some(false);
        if emit {
            r.flowing = Some(false);
        }
        r.paused = Some(true);
        emit
    };
    if emit {
        log::trace!("readable paused");
        stream.emit(Event::Pause);
    }
}

pub(crate) fn is_paused(stream: &Stream) -> bool {
    stream
        .rstate()
        .is_some_and(|r| r.paused == Some(true) || r.flowing == Some(false))
}

/// Mode switch on listener registration: `data` resumes, `readable` pauses
pub(crate) fn on_listener_added(stream: &Stream, kind: EventKind) {
    match kind {
        EventKind::Data => {
            let readable_listeners = stream.listener_count(EventKind::Readable);
            let should_resume = match stream.rstate() {
                Some(mut r) => {
                    r.readable_listening = readable_listeners > 0;
                    r.flowing != Some(false)
                }
                None => false,
            };
            if should_resume {
                resume(stream);
            }
        }
        EventKind::Readable => {
            let (notify, pull) = match stream.rstate() {
                Some(mut r) if !r.end_emitted && !r.readable_listening => {
                    r.readable_listening = true;
                    r.need_readable = true;
                    r.flowing = Some(false);
                    r.emitted_readable = false;
                    if r.length() > 0 {
                        (true, false)
                    } else {
                        (false, !r.reading)
                    }
                }
                _ => (false, false),
            };
            if notify {
                emit_readable(stream);
            } else if pull {
                let stream = stream.clone();
                stream.scheduler().clone().next_tick(move || {
                    read(&stream, Some(0));
                });
            }
        }
        _ => {}
    }
}

pub(crate) fn on_readable_listener_removed(stream: &Stream) {
    if stream.has_readable() {
        let stream = stream.clone();
        stream
            .scheduler()
            .clone()
            .next_tick(move || update_readable_listening(&stream));
    }
}

fn update_readable_listening(stream: &Stream) {
    let readable_listeners = stream.listener_count(EventKind::Readable);
    let data_listeners = stream.listener_count(EventKind::Data);
    let should_resume = {
        let Some(mut r) = stream.rstate() else {
            return;
        };
        r.readable_listening = readable_listeners > 0;
        if r.resume_scheduled && r.paused == Some(false) {
            r.flowing = Some(true);
            false
        } else if data_listeners > 0 {
            true
        } else {
            if !r.readable_listening {
                r.flowing = None;
            }
            false
        }
    };
    if should_resume {
        resume(stream);
    }
}

/// Decode buffered and future bytes as text
pub(crate) fn set_encoding(stream: &Stream, encoding: Encoding) {
    let Some(mut r) = stream.rstate() else {
        return;
    };
    let mut decoder = StringDecoder::new(encoding);
    if !r.object_mode {
        let mut content = String::new();
        for chunk in r.buffer.drain() {
            match chunk {
                Chunk::Text(text) => content.push_str(&text),
                other => content.push_str(&decoder.write(&other.to_bytes())),
            }
        }
        if !content.is_empty() {
            r.buffer.push(Chunk::Text(content));
        }
    }
    r.decoder = Some(decoder);
    r.encoding = Some(encoding);
}

/// Consumer-side operations of anything with a readable side
pub trait Readable: AsStream {
    /// Append a chunk. Returns false once the buffer reached the high-water mark.
    fn push(&self, chunk: impl Into<Chunk>) -> bool
    where
        Self: Sized,
    {
        push(self.as_stream(), Some(chunk.into()))
    }

    /// Mark the end of data
    fn push_end(&self) -> bool {
        push(self.as_stream(), None)
    }

    /// Return a chunk to the front of the buffer
    fn unshift(&self, chunk: impl Into<Chunk>) -> bool
    where
        Self: Sized,
    {
        unshift(self.as_stream(), chunk.into())
    }

    /// Read whatever is buffered (one item in object mode)
    fn read(&self) -> Option<Chunk> {
        read(self.as_stream(), None)
    }

    /// Read exactly `n` units, or nothing if fewer are buffered and the
    /// stream has not ended
    fn read_size(&self, n: usize) -> Option<Chunk> {
        read(self.as_stream(), Some(n))
    }

    /// Forward all data to `dest`, ending it when this stream ends
    fn pipe<W>(&self, dest: &W) -> W
    where
        W: Writable + Clone,
        Self: Sized,
    {
        self.pipe_with(dest, PipeOptions::default())
    }

    fn pipe_with<W>(&self, dest: &W, options: PipeOptions) -> W
    where
        W: Writable + Clone,
        Self: Sized,
    {
        pipe::pipe(self.as_stream(), dest.as_stream(), options);
        dest.clone()
    }

    /// Detach one destination
    fn unpipe<W: AsStream>(&self, dest: &W)
    where
        Self: Sized,
    {
        pipe::unpipe(self.as_stream(), Some(dest.as_stream()));
    }

    /// Detach every destination
    fn unpipe_all(&self) {
        pipe::unpipe(self.as_stream(), None);
    }

    fn pause(&self) {
        pause(self.as_stream())
    }

    fn resume(&self) {
        resume(self.as_stream())
    }

    fn is_paused(&self) -> bool {
        is_paused(self.as_stream())
    }

    fn set_encoding(&self, encoding: Encoding) {
        set_encoding(self.as_stream(), encoding)
    }

    /// Consume the stream as an async iterator
    fn iter(&self) -> ReadableIter {
        ReadableIter::new(self.as_stream().clone())
    }

    fn readable_length(&self) -> usize {
        self.as_stream().rstate().map_or(0, |r| r.length())
    }

    fn readable_high_water_mark(&self) -> usize {
        self.as_stream().rstate().map_or(0, |r| r.high_water_mark)
    }

    /// Whether `end` was emitted
    fn readable_ended(&self) -> bool {
        self.as_stream().rstate().is_some_and(|r| r.end_emitted)
    }

    fn readable_flowing(&self) -> Option<bool> {
        self.as_stream().rstate().and_then(|r| r.flowing)
    }

    fn readable_object_mode(&self) -> bool {
        self.as_stream().rstate().is_some_and(|r| r.object_mode)
    }

    fn readable_encoding(&self) -> Option<Encoding> {
        self.as_stream().rstate().and_then(|r| r.encoding)
    }
}

impl Readable for Stream {}

/// A stream with only a readable side
#[derive(Clone, Debug)]
pub struct ReadableStream {
    stream: Stream,
}

impl AsStream for ReadableStream {
    fn as_stream(&self) -> &Stream {
        &self.stream
    }
}

impl Readable for ReadableStream {}

impl ReadableStream {
    pub fn new(scheduler: &Scheduler, options: ReadableOptions, source: impl Source) -> Self {
        Self::with_hooks(scheduler, &options, Some(Rc::new(source)))
    }

    /// A readable fed only by explicit `push` calls
    pub fn pushable(scheduler: &Scheduler, options: ReadableOptions) -> Self {
        Self::new(scheduler, options, source_fn(|_, _| {}))
    }

    /// A readable whose read hook was never provided; pulling from it fails
    /// with `MethodNotImplemented`
    pub fn without_source(scheduler: &Scheduler, options: ReadableOptions) -> Self {
        Self::with_hooks(scheduler, &options, None)
    }

    /// An object-mode readable yielding the items of `items`, one per pull
    pub fn from_iter<I>(scheduler: &Scheduler, items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Chunk> + 'static,
        I::IntoIter: 'static,
    {
        let source = IterSource::new(items.into_iter().map(Into::into));
        Self::new(scheduler, ReadableOptions::object(), source)
    }

    fn with_hooks(
        scheduler: &Scheduler,
        options: &ReadableOptions,
        source: Option<Rc<dyn Source>>,
    ) -> Self {
        let state = ReadableState::new(options);
        Self {
            stream: Stream::new(scheduler, Some(state), None, Hooks::Readable(source), true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::{Cell, RefCell};

    fn collect_data(stream: &impl AsStream) -> Rc<RefCell<Vec<Chunk>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        stream.as_stream().on(EventKind::Data, move |event| {
            if let Some(chunk) = event.as_data() {
                sink.borrow_mut().push(chunk.clone());
            }
        });
        seen
    }

    fn count_events(stream: &impl AsStream, kind: EventKind) -> Rc<Cell<usize>> {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        stream.as_stream().on(kind, move |_| c.set(c.get() + 1));
        count
    }

    #[test]
    fn test_paused_read_concatenates() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        readable.push("hello ");
        readable.push("world");
        assert_eq!(readable.readable_length(), 11);

        let chunk = readable.read().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), b"hello world");
        assert_eq!(readable.readable_length(), 0);
    }

    #[test]
    fn test_read_size_waits_for_enough_data() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        readable.push("abc");
        assert!(readable.read_size(5).is_none());
        readable.push("def");
        assert_eq!(readable.read_size(5).unwrap().as_bytes().unwrap(), b"abcde");
        readable.push_end();
        // After the end, a short read returns the rest
        assert_eq!(readable.read_size(5).unwrap().as_bytes().unwrap(), b"f");
    }

    #[test]
    fn test_flowing_mode_and_single_end() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let data = collect_data(&readable);
        let ends = count_events(&readable, EventKind::End);

        readable.push("a");
        readable.push("b");
        readable.push_end();
        scheduler.run_until_idle().unwrap();

        let joined: Vec<u8> = data.borrow().iter().flat_map(|c| c.to_bytes()).collect();
        assert_eq!(joined, b"ab");
        assert_eq!(ends.get(), 1);
        assert!(readable.readable_ended());
        assert!(readable.is_destroyed());
    }

    #[test]
    fn test_end_waits_for_buffer_to_drain() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let ends = count_events(&readable, EventKind::End);
        readable.push("data");
        readable.push_end();
        scheduler.run_until_idle().unwrap();
        assert_eq!(ends.get(), 0);

        assert!(readable.read().is_some());
        assert!(readable.read().is_none());
        scheduler.run_until_idle().unwrap();
        assert_eq!(ends.get(), 1);
    }

    #[test]
    fn test_readable_notification_is_coalesced() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let notifications = count_events(&readable, EventKind::Readable);
        scheduler.run_until_idle().unwrap();

        readable.push("a");
        readable.push("b");
        readable.push("c");
        scheduler.run_until_idle().unwrap();
        assert_eq!(notifications.get(), 1);
        assert!(readable.is_paused());
    }

    #[test]
    fn test_source_is_pulled_up_to_high_water_mark() {
        let scheduler = Scheduler::new();
        let pulls = Rc::new(Cell::new(0));
        let p = pulls.clone();
        let options = ReadableOptions {
            high_water_mark: Some(4),
            ..Default::default()
        };
        let readable = ReadableStream::new(
            &scheduler,
            options,
            source_fn(move |ctl, _size| {
                p.set(p.get() + 1);
                ctl.push("xx");
            }),
        );
        readable.on(EventKind::Readable, |_| {});
        scheduler.run_until_idle().unwrap();
        // Pulled until the buffer reached the mark
        assert_eq!(readable.readable_length(), 4);
        assert_eq!(pulls.get(), 2);
    }

    #[test]
    fn test_push_after_eof_errors() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let error = Rc::new(RefCell::new(None));
        let e = error.clone();
        readable.on(EventKind::Error, move |event| {
            *e.borrow_mut() = event.as_error().cloned();
        });
        readable.push_end();
        assert!(!readable.push("late"));
        scheduler.run_until_idle().unwrap();
        assert!(matches!(*error.borrow(), Some(StreamError::PushAfterEof)));
        assert!(readable.is_destroyed());
    }

    #[test]
    fn test_object_chunk_rejected_in_byte_mode() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        readable.on(EventKind::Error, |_| {});
        readable.push(json!({"a": 1}));
        assert!(matches!(readable.errored(), Some(StreamError::InvalidChunk)));
    }

    #[test]
    fn test_unshift_puts_data_in_front() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        readable.push("world");
        readable.unshift("hello ");
        assert_eq!(readable.read().unwrap().as_bytes().unwrap(), b"hello world");
    }

    #[test]
    fn test_unshift_after_end_event() {
        let scheduler = Scheduler::new();
        let options = ReadableOptions {
            auto_destroy: false,
            ..Default::default()
        };
        let readable = ReadableStream::pushable(&scheduler, options);
        let error = Rc::new(RefCell::new(None));
        let e = error.clone();
        readable.on(EventKind::Error, move |event| {
            *e.borrow_mut() = event.as_error().cloned();
        });
        readable.on(EventKind::Data, |_| {});
        readable.push_end();
        scheduler.run_until_idle().unwrap();
        assert!(readable.readable_ended());

        readable.unshift("again");
        scheduler.run_until_idle().unwrap();
        assert!(matches!(*error.borrow(), Some(StreamError::UnshiftAfterEndEvent)));
    }

    #[test]
    fn test_set_encoding_decodes_split_characters() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let euro = "€".as_bytes();
        readable.push(&euro[..1]);
        readable.set_encoding(Encoding::Utf8);
        readable.push(&euro[1..]);
        readable.push_end();
        assert_eq!(readable.read().unwrap(), Chunk::from("€"));
        assert_eq!(readable.readable_encoding(), Some(Encoding::Utf8));
    }

    #[test]
    fn test_set_encoding_hex() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        readable.set_encoding(Encoding::Hex);
        readable.push(&[0xde, 0xad][..]);
        assert_eq!(readable.read().unwrap(), Chunk::from("dead"));
    }

    #[test]
    fn test_read_raises_high_water_mark() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        readable.read_size(20_000);
        assert_eq!(readable.readable_high_water_mark(), 32 * 1024);
        readable.read_size(MAX_HIGH_WATER_MARK + 1);
        assert_eq!(readable.readable_high_water_mark(), MAX_HIGH_WATER_MARK);
    }

    #[test]
    fn test_pause_and_resume_events() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let pauses = count_events(&readable, EventKind::Pause);
        let resumes = count_events(&readable, EventKind::Resume);
        let data = collect_data(&readable);
        scheduler.run_until_idle().unwrap();
        assert_eq!(resumes.get(), 1);

        readable.pause();
        readable.pause();
        assert!(readable.is_paused());
        assert_eq!(pauses.get(), 1);

        readable.push("buffered");
        scheduler.run_until_idle().unwrap();
        assert!(data.borrow().is_empty());

        readable.resume();
        scheduler.run_until_idle().unwrap();
        assert_eq!(data.borrow().len(), 1);
        assert_eq!(resumes.get(), 2);
        assert_eq!(readable.readable_flowing(), Some(true));
    }

    #[test]
    fn test_from_iter_object_mode() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::from_iter(&scheduler, vec![json!(1), json!("two")]);
        let data = collect_data(&readable);
        scheduler.run_until_idle().unwrap();
        assert_eq!(*data.borrow(), vec![Chunk::from(json!(1)), Chunk::from(json!("two"))]);
        assert!(readable.readable_object_mode());
        assert!(readable.readable_ended());
    }

    #[test]
    fn test_missing_read_hook() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::without_source(&scheduler, ReadableOptions::default());
        readable.read();
        assert!(matches!(
            scheduler.run_until_idle(),
            Err(StreamError::MethodNotImplemented("read"))
        ));
    }
}
