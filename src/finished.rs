//! End-of-stream detection
//!
//! [`finished`] reports exactly once whether a stream completed normally
//! (`end` and/or `finish`), failed (`error`), or closed before completing
//! (`PrematureClose`). Premature close is only ever surfaced here and through
//! `pipeline`, never as an `error` event.

use crate::{
    config::FinishedOptions,
    error::{StreamError, StreamResult},
    events::{EventKind, ListenerId},
    stream::{AsStream, Stream, WeakStream},
};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

type Callback = Box<dyn FnOnce(StreamResult<()>)>;

struct Watch {
    readable: Cell<bool>,
    writable: Cell<bool>,
    readable_ended: Cell<bool>,
    writable_finished: Cell<bool>,
    will_emit_close: bool,
    callback: RefCell<Option<Callback>>,
}

impl Watch {
    fn call(&self, result: StreamResult<()>) {
        let callback = self.callback.borrow_mut().take();
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

/// Listeners registered by [`finished`]
#[derive(Debug)]
pub struct Subscription {
    stream: WeakStream,
    ids: Vec<ListenerId>,
}

impl Subscription {
    /// Remove the listeners; the callback will not run afterwards
    pub fn cancel(self) {
        if let Some(stream) = self.stream.upgrade() {
            for id in self.ids {
                stream.off(id);
            }
        }
    }
}

fn still_readable(stream: &Stream) -> bool {
    stream
        .rstate()
        .is_some_and(|r| !r.destroyed && !r.end_emitted)
}

fn still_writable(stream: &Stream) -> bool {
    stream.wstate().is_some_and(|w| !w.destroyed && !w.ending)
}

/// Run `callback` once the stream is done with the requested sides
pub fn finished<S, F>(stream: &S, options: FinishedOptions, callback: F) -> Subscription
where
    S: AsStream + ?Sized,
    F: FnOnce(StreamResult<()>) + 'static,
{
    let stream = stream.as_stream();
    let readable = options.readable.unwrap_or(stream.has_readable());
    let writable = options.writable.unwrap_or(stream.has_writable());

    let (auto_destroy, emit_close, closed) = match (stream.wstate(), stream.rstate()) {
        (Some(w), _) => (w.auto_destroy, w.emit_close, w.closed),
        (None, Some(r)) => (r.auto_destroy, r.emit_close, r.closed),
        (None, None) => (false, false, false),
    };
    let will_emit_close = auto_destroy
        && emit_close
        && !closed
        && still_readable(stream) == readable
        && still_writable(stream) == writable;

    let readable_ended = stream.rstate().is_some_and(|r| r.end_emitted);
    let writable_finished = stream.wstate().is_some_and(|w| w.finished);
    let watch = Rc::new(Watch {
        readable: Cell::new(readable),
        writable: Cell::new(writable),
        readable_ended: Cell::new(readable_ended),
        writable_finished: Cell::new(writable_finished),
        will_emit_close,
        callback: RefCell::new(Some(Box::new(callback))),
    });

    let mut ids = Vec::with_capacity(4);
    let handle = stream.downgrade();

    let (w, h) = (watch.clone(), handle.clone());
    ids.push(stream.on(EventKind::Finish, move |_| {
        w.writable.set(false);
        w.writable_finished.set(true);
        let readable_open = h.upgrade().is_some_and(|s| still_readable(&s));
        if w.will_emit_close && (!readable_open || w.readable.get()) {
            return;
        }
        if !w.readable.get() || w.readable_ended.get() {
            w.call(Ok(()));
        }
    }));

    let (w, h) = (watch.clone(), handle.clone());
    ids.push(stream.on(EventKind::End, move |_| {
        w.readable.set(false);
        w.readable_ended.set(true);
        let writable_open = h.upgrade().is_some_and(|s| still_writable(&s));
        if w.will_emit_close && (!writable_open || w.writable.get()) {
            return;
        }
        if !w.writable.get() || w.writable_finished.get() {
            w.call(Ok(()));
        }
    }));

    let w = watch.clone();
    ids.push(stream.on(EventKind::Error, move |event| {
        if let Some(err) = event.as_error() {
            w.call(Err(err.clone()));
        }
    }));

    let on_close = {
        let (w, h) = (watch.clone(), handle.clone());
        move || settle_on_close(&w, &h)
    };
    let close_listener = on_close.clone();
    ids.push(stream.on(EventKind::Close, move |_| close_listener()));

    let error_emitted = stream.wstate().is_some_and(|w| w.error_emitted)
        || stream.rstate().is_some_and(|r| r.error_emitted);
    if closed || error_emitted {
        stream.scheduler().next_tick(on_close);
    } else if !will_emit_close
        && (!readable || readable_ended)
        && (!writable || writable_finished)
    {
        // Already complete and no close is coming
        let w = watch.clone();
        stream.scheduler().next_tick(move || w.call(Ok(())));
    }

    Subscription {
        stream: handle,
        ids,
    }
}

fn settle_on_close(watch: &Watch, handle: &WeakStream) {
    let Some(stream) = handle.upgrade() else {
        watch.call(Err(StreamError::PrematureClose));
        return;
    };
    if let Some(err) = stream.errored() {
        watch.call(Err(err));
        return;
    }
    if watch.readable.get()
        && !watch.readable_ended.get()
        && !stream.rstate().is_some_and(|r| r.end_emitted)
    {
        watch.call(Err(StreamError::PrematureClose));
        return;
    }
    if watch.writable.get()
        && !watch.writable_finished.get()
        && !stream.wstate().is_some_and(|w| w.finished)
    {
        watch.call(Err(StreamError::PrematureClose));
        return;
    }
    watch.call(Ok(()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ReadableOptions, WritableOptions},
        hooks::sink_fn,
        readable::{Readable, ReadableStream},
        scheduler::Scheduler,
        writable::{Writable, WritableStream},
    };

    fn outcome() -> (Rc<RefCell<Vec<StreamResult<()>>>>, impl FnOnce(StreamResult<()>) + 'static) {
        let results = Rc::new(RefCell::new(Vec::new()));
        let r = results.clone();
        (results, move |result| r.borrow_mut().push(result))
    }

    #[test]
    fn test_readable_end() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let (results, callback) = outcome();
        finished(&readable, FinishedOptions::default(), callback);
        readable.on(EventKind::Data, |_| {});
        readable.push("x");
        readable.push_end();
        scheduler.run_until_idle().unwrap();
        let results = results.borrow();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn test_writable_finish() {
        let scheduler = Scheduler::new();
        let writable = WritableStream::new(
            &scheduler,
            WritableOptions::default(),
            sink_fn(|_chunk, _encoding, done| done.ok()),
        );
        let (results, callback) = outcome();
        finished(&writable, FinishedOptions::default(), callback);
        writable.write("x");
        writable.end();
        scheduler.run_until_idle().unwrap();
        assert!(matches!(results.borrow().as_slice(), [Ok(())]));
    }

    #[test]
    fn test_premature_close() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let (results, callback) = outcome();
        finished(&readable, FinishedOptions::default(), callback);
        readable.destroy(None);
        scheduler.run_until_idle().unwrap();
        assert!(matches!(
            results.borrow().as_slice(),
            [Err(StreamError::PrematureClose)]
        ));
    }

    #[test]
    fn test_error_reported_once() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let (results, callback) = outcome();
        finished(&readable, FinishedOptions::default(), callback);
        readable.destroy(Some(StreamError::other("broken")));
        scheduler.run_until_idle().unwrap();
        let results = results.borrow();
        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0], Err(StreamError::Other(m)) if m == "broken"));
    }

    #[test]
    fn test_already_closed_stream() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        readable.destroy(None);
        scheduler.run_until_idle().unwrap();

        let (results, callback) = outcome();
        finished(&readable, FinishedOptions::default(), callback);
        assert!(results.borrow().is_empty());
        scheduler.run_until_idle().unwrap();
        assert!(matches!(
            results.borrow().as_slice(),
            [Err(StreamError::PrematureClose)]
        ));
    }

    #[test]
    fn test_cancel() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let (results, callback) = outcome();
        finished(&readable, FinishedOptions::default(), callback).cancel();
        readable.destroy(None);
        scheduler.run_until_idle().unwrap();
        assert!(results.borrow().is_empty());
    }
}
