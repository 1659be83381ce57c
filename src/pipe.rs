//! Pipe controller
//!
//! Forwards a readable's `data` into one or more writables. When a
//! destination's `write` returns false the source is paused and that
//! destination's `await_drain` counter is raised; the source flows again
//! once every destination drained. An error or close on either side
//! detaches the pipe before anything else sees it.

use crate::{
    config::PipeOptions,
    events::{Event, EventKind, ListenerId},
    readable::{self, PipeRegistration},
    stream::{Stream, WeakStream},
    writable,
};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

/// Listener bookkeeping for one source/destination pair
struct PipeLink {
    src: WeakStream,
    dest: WeakStream,
    cleaned_up: Cell<bool>,
    src_listeners: RefCell<Vec<ListenerId>>,
    dest_listeners: RefCell<Vec<ListenerId>>,
    on_drain: Cell<Option<ListenerId>>,
}

impl PipeLink {
    fn streams(&self) -> Option<(Stream, Stream)> {
        Some((self.src.upgrade()?, self.dest.upgrade()?))
    }

    fn unpipe(&self) {
        if let Some((src, dest)) = self.streams() {
            unpipe(&src, Some(&dest));
        }
    }

    fn on_data(self: &Rc<Self>, event: &Event) {
        let (Some(chunk), Some(dest)) = (event.as_data(), self.dest.upgrade()) else {
            return;
        };
        if !writable::write(&dest, chunk.clone(), None, None) {
            self.pause();
        }
    }

    /// Back off until the destination drains
    fn pause(self: &Rc<Self>) {
        let Some((src, dest)) = self.streams() else {
            return;
        };
        if !self.cleaned_up.get() {
            if let Some(mut r) = src.rstate() {
                if let Some(registration) = r.pipes.iter_mut().find(|p| p.dest.ptr_eq(&dest)) {
                    registration.await_drain += 1;
                }
            }
            readable::pause(&src);
        }
        if self.on_drain.get().is_none() {
            let link = self.clone();
            let id = dest.on(EventKind::Drain, move |_| link.on_drain());
            self.on_drain.set(Some(id));
        }
    }

    fn on_drain(&self) {
        let Some((src, dest)) = self.streams() else {
            return;
        };
        let clear = match src.rstate() {
            Some(mut r) => {
                if let Some(registration) = r.pipes.iter_mut().find(|p| p.dest.ptr_eq(&dest)) {
                    registration.await_drain = 0;
                }
                !r.awaiting_drain()
            }
            None => return,
        };
        if clear && src.listener_count(EventKind::Data) > 0 {
            if let Some(mut r) = src.rstate() {
                r.flowing = Some(true);
            }
            readable::flow(&src);
        }
    }

    fn on_dest_error(&self, err: &crate::error::StreamError) {
        self.unpipe();
        if let Some(dest) = self.dest.upgrade() {
            if dest.listener_count(EventKind::Error) == 0 {
                dest.scheduler().report_uncaught(err.clone());
            }
        }
    }

    fn on_src_error(&self, err: &crate::error::StreamError) {
        self.unpipe();
        if let Some(src) = self.src.upgrade() {
            if src.listener_count(EventKind::Error) == 0 {
                src.scheduler().report_uncaught(err.clone());
            }
        }
    }

    /// Remove every listener this pipe registered
    fn cleanup(&self) {
        self.cleaned_up.set(true);
        log::debug!("pipe cleaned up");
        let src = self.src.upgrade();
        let dest = self.dest.upgrade();
        if let Some(dest) = &dest {
            for id in self.dest_listeners.borrow_mut().drain(..) {
                dest.off(id);
            }
        }
        if let Some(src) = &src {
            for id in self.src_listeners.borrow_mut().drain(..) {
                src.off(id);
            }
        }
        if let (Some(id), Some(dest)) = (self.on_drain.take(), &dest) {
            dest.off(id);
            let dest_needs_drain = dest.wstate().is_none_or(|w| w.need_drain);
            if dest_needs_drain {
                self.on_drain();
            }
        }
    }
}

/// Attach `dest` to `src`
pub(crate) fn pipe(src: &Stream, dest: &Stream, options: PipeOptions) {
    let end_emitted = {
        let Some(mut r) = src.rstate() else {
            return;
        };
        r.pipes.push(PipeRegistration {
            dest: dest.clone(),
            await_drain: 0,
        });
        r.end_emitted
    };
    log::debug!("piping to destination (end: {})", options.end);

    let link = Rc::new(PipeLink {
        src: src.downgrade(),
        dest: dest.downgrade(),
        cleaned_up: Cell::new(false),
        src_listeners: RefCell::new(Vec::new()),
        dest_listeners: RefCell::new(Vec::new()),
        on_drain: Cell::new(None),
    });

    let do_end = options.end;
    let on_end = {
        let link = link.clone();
        move || {
            if do_end {
                if let Some(dest) = link.dest.upgrade() {
                    writable::end(&dest, None, None);
                }
            } else {
                link.unpipe();
            }
        }
    };
    if end_emitted {
        src.scheduler().next_tick(on_end);
    } else {
        let on_end = RefCell::new(Some(on_end));
        let id = src.once(EventKind::End, move |_| {
            if let Some(on_end) = on_end.borrow_mut().take() {
                on_end();
            }
        });
        link.src_listeners.borrow_mut().push(id);
    }

    let src_handle = src.downgrade();
    let l = link.clone();
    let id = dest.on(EventKind::Unpipe, move |event| {
        let from_src = match (event, src_handle.upgrade()) {
            (Event::Unpipe(from), Some(src)) => from.ptr_eq(&src),
            _ => false,
        };
        if from_src && !l.cleaned_up.get() {
            l.cleanup();
        }
    });
    link.dest_listeners.borrow_mut().push(id);

    let l = link.clone();
    let id = dest.prepend(EventKind::Error, move |event| {
        if let Some(err) = event.as_error() {
            l.on_dest_error(err);
        }
    });
    link.dest_listeners.borrow_mut().push(id);

    let l = link.clone();
    let id = src.prepend(EventKind::Error, move |event| {
        if let Some(err) = event.as_error() {
            l.on_src_error(err);
        }
    });
    link.src_listeners.borrow_mut().push(id);

    let l = link.clone();
    let id = dest.once(EventKind::Close, move |_| l.unpipe());
    link.dest_listeners.borrow_mut().push(id);
    let l = link.clone();
    let id = dest.once(EventKind::Finish, move |_| l.unpipe());
    link.dest_listeners.borrow_mut().push(id);

    // Subscribing to data switches the source to flowing mode
    let l = link.clone();
    let id = src.on(EventKind::Data, move |event| l.on_data(event));
    link.src_listeners.borrow_mut().push(id);

    dest.emit(Event::Pipe(src.clone()));

    let dest_needs_drain = dest.wstate().is_some_and(|w| w.need_drain);
    let flowing = src.rstate().is_some_and(|r| r.flowing == Some(true));
    if dest_needs_drain {
        if flowing {
            link.pause();
        }
    } else if !flowing {
        readable::resume(src);
    }
}

/// Detach `dest`, or every destination when `None`
pub(crate) fn unpipe(src: &Stream, dest: Option<&Stream>) {
    let Some(mut r) = src.rstate() else {
        return;
    };
    if r.pipes.is_empty() {
        return;
    }
    match dest {
        None => {
            let dests: Vec<Stream> = r.pipes.drain(..).map(|p| p.dest).collect();
            drop(r);
            log::debug!("unpiping {} destinations", dests.len());
            readable::pause(src);
            for dest in dests {
                dest.emit(Event::Unpipe(src.clone()));
            }
        }
        Some(dest) => {
            let Some(index) = r.pipes.iter().position(|p| p.dest.ptr_eq(dest)) else {
                return;
            };
            r.pipes.remove(index);
            let now_empty = r.pipes.is_empty();
            drop(r);
            log::debug!("unpiping destination");
            if now_empty {
                readable::pause(src);
            }
            dest.emit(Event::Unpipe(src.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::Chunk,
        config::{ReadableOptions, WritableOptions},
        error::StreamError,
        hooks::{Completion, sink_fn},
        readable::{Readable, ReadableStream},
        scheduler::Scheduler,
        stream::AsStream,
        writable::{Writable, WritableStream},
    };

    type Pending = Rc<RefCell<Vec<Completion>>>;

    fn recording_dest(
        scheduler: &Scheduler,
        high_water_mark: usize,
        asynchronous: bool,
    ) -> (WritableStream, Rc<RefCell<Vec<Chunk>>>, Pending) {
        let written = Rc::new(RefCell::new(Vec::new()));
        let pending: Pending = Rc::default();
        let (w, p) = (written.clone(), pending.clone());
        let sink = sink_fn(move |chunk, _encoding, done| {
            w.borrow_mut().push(chunk);
            if asynchronous {
                p.borrow_mut().push(done);
            } else {
                done.ok();
            }
        });
        let options = WritableOptions {
            high_water_mark: Some(high_water_mark),
            ..Default::default()
        };
        (WritableStream::new(scheduler, options, sink), written, pending)
    }

    fn release(pending: &Pending) {
        let done = pending.borrow_mut().remove(0);
        done.ok();
    }

    #[test]
    fn test_pipe_forwards_and_ends() {
        let scheduler = Scheduler::new();
        let src = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let (dest, written, _) = recording_dest(&scheduler, 1024, false);
        src.pipe(&dest);
        src.push("one");
        src.push("two");
        src.push_end();
        scheduler.run_until_idle().unwrap();

        let joined: Vec<u8> = written.borrow().iter().flat_map(|c| c.to_bytes()).collect();
        assert_eq!(joined, b"onetwo");
        assert!(dest.writable_finished());
    }

    #[test]
    fn test_pipe_without_end() {
        let scheduler = Scheduler::new();
        let src = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let (dest, _, _) = recording_dest(&scheduler, 1024, false);
        src.pipe_with(&dest, PipeOptions { end: false });
        src.push_end();
        scheduler.run_until_idle().unwrap();
        assert!(!dest.writable_ended());
    }

    #[test]
    fn test_backpressure_waits_for_every_destination() {
        let scheduler = Scheduler::new();
        let src = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let (a, a_written, a_pending) = recording_dest(&scheduler, 1, true);
        let (b, b_written, b_pending) = recording_dest(&scheduler, 1, true);
        src.pipe(&a);
        src.pipe(&b);
        src.push("x");
        src.push("y");
        scheduler.run_until_idle().unwrap();
        assert_eq!(a_written.borrow().len(), 1);
        assert_eq!(b_written.borrow().len(), 1);
        assert!(src.is_paused());

        release(&a_pending);
        scheduler.run_until_idle().unwrap();
        assert_eq!(a_written.borrow().len(), 1);

        release(&b_pending);
        scheduler.run_until_idle().unwrap();
        assert_eq!(a_written.borrow().len(), 2);
        assert_eq!(b_written.borrow().len(), 2);
    }

    #[test]
    fn test_unpipe_detaches() {
        let scheduler = Scheduler::new();
        let src = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let (dest, written, _) = recording_dest(&scheduler, 1024, false);
        let unpiped = Rc::new(Cell::new(0));
        let u = unpiped.clone();
        dest.on(EventKind::Unpipe, move |_| u.set(u.get() + 1));

        src.pipe(&dest);
        src.unpipe(&dest);
        assert_eq!(unpiped.get(), 1);
        assert_eq!(src.listener_count(EventKind::Data), 0);
        assert!(src.is_paused());

        src.push("ignored");
        scheduler.run_until_idle().unwrap();
        assert!(written.borrow().is_empty());
    }

    #[test]
    fn test_destination_error_unpipes() {
        let scheduler = Scheduler::new();
        let src = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let dest = WritableStream::new(
            &scheduler,
            WritableOptions::default(),
            sink_fn(|_chunk, _encoding, done| done.error(StreamError::other("refused"))),
        );
        dest.on(EventKind::Error, |_| {});
        src.pipe(&dest);
        src.push("a");
        scheduler.run_until_idle().unwrap();
        assert!(dest.is_destroyed());
        assert_eq!(src.listener_count(EventKind::Data), 0);
        assert_eq!(dest.listener_count(EventKind::Error), 1);
    }

    #[test]
    fn test_unhandled_destination_error_is_uncaught() {
        let scheduler = Scheduler::new();
        let src = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let dest = WritableStream::new(
            &scheduler,
            WritableOptions::default(),
            sink_fn(|_chunk, _encoding, done| done.error(StreamError::other("refused"))),
        );
        src.pipe(&dest);
        src.push("a");
        let err = scheduler.run_until_idle().unwrap_err();
        assert_eq!(err.to_string(), "refused");
    }
}
