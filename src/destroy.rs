//! Idempotent teardown shared by every stream role
//!
//! The first `destroy` marks both sides destroyed and runs the destroy hook.
//! When the hook completes, the error (if any) and then `close` are emitted
//! on the next turn. Later calls are no-ops and keep the original error.

use crate::{error::StreamError, events::Event, hooks::Completion, stream::Stream, writable};

pub(crate) fn destroy(stream: &Stream, err: Option<StreamError>) {
    if stream.is_destroyed() {
        return;
    }

    let flush_writes = stream.wstate().is_some_and(|w| w.has_pending_callbacks());
    if let Some(mut w) = stream.wstate() {
        if w.errored.is_none() {
            w.errored = err.clone();
        }
        w.destroyed = true;
    }
    if let Some(mut r) = stream.rstate() {
        if r.errored.is_none() {
            r.errored = err.clone();
        }
        r.destroyed = true;
        r.buffer.clear();
    }
    if flush_writes {
        let stream = stream.clone();
        stream
            .scheduler()
            .clone()
            .next_tick(move || writable::error_buffer(&stream));
    }

    match &err {
        Some(err) => log::debug!("destroying stream: {}", err),
        None => log::debug!("destroying stream"),
    }
    let target = stream.clone();
    let done = Completion::new(stream, move |result| on_destroyed(&target, result.err()));
    stream.call_destroy(err, done);
}

fn on_destroyed(stream: &Stream, err: Option<StreamError>) {
    if let Some(mut w) = stream.wstate() {
        if w.errored.is_none() {
            w.errored = err.clone();
        }
        w.closed = true;
    }
    if let Some(mut r) = stream.rstate() {
        if r.errored.is_none() {
            r.errored = err.clone();
        }
        r.closed = true;
    }

    let stream = stream.clone();
    stream.scheduler().clone().next_tick(move || {
        if let Some(err) = err {
            emit_error_nt(&stream, err);
        }
        emit_close_nt(&stream);
    });
}

fn emit_error_nt(stream: &Stream, err: StreamError) {
    let already = stream.wstate().is_some_and(|w| w.error_emitted)
        || stream.rstate().is_some_and(|r| r.error_emitted);
    if already {
        return;
    }
    if let Some(mut w) = stream.wstate() {
        w.error_emitted = true;
    }
    if let Some(mut r) = stream.rstate() {
        r.error_emitted = true;
    }
    stream.emit(Event::Error(err));
}

fn emit_close_nt(stream: &Stream) {
    let mut emit_close = false;
    if let Some(mut w) = stream.wstate() {
        w.close_emitted = true;
        emit_close |= w.emit_close;
    }
    if let Some(mut r) = stream.rstate() {
        r.close_emitted = true;
        emit_close |= r.emit_close;
    }
    if emit_close {
        stream.emit(Event::Close);
    }
}

/// Route an error to `destroy` when auto-destroy is on, otherwise record it
/// and emit `error` (deferred one turn when `sync`)
pub(crate) fn error_or_destroy(stream: &Stream, err: StreamError, sync: bool) {
    if stream.is_destroyed() {
        return;
    }
    let auto_destroy = stream.rstate().is_some_and(|r| r.auto_destroy)
        || stream.wstate().is_some_and(|w| w.auto_destroy);
    if auto_destroy {
        destroy(stream, Some(err));
        return;
    }

    if let Some(mut w) = stream.wstate() {
        if w.errored.is_none() {
            w.errored = Some(err.clone());
        }
    }
    if let Some(mut r) = stream.rstate() {
        if r.errored.is_none() {
            r.errored = Some(err.clone());
        }
    }
    if sync {
        let stream = stream.clone();
        stream
            .scheduler()
            .clone()
            .next_tick(move || emit_error_nt(&stream, err));
    } else {
        emit_error_nt(stream, err);
    }
}
