//! Behavioural properties that cut across stream roles

use futures_util::StreamExt;
use nodestream::prelude::*;
use nodestream::{
    Chunk, Completion, DuplexOptions, Encoding, EventKind, ReadController, ReadableOptions,
    ReadableStream, Scheduler, Sink, Source, StreamError, StreamResult, TransformStream,
    WritableOptions, WritableStream, pipeline, sink_fn, source_fn, transform_fn,
};
use serde_json::json;
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

type Calls = Rc<RefCell<Vec<Vec<String>>>>;

/// Records every write and writev call as the list of chunks it carried
struct RecordingSink {
    calls: Calls,
    batching: bool,
}

impl RecordingSink {
    fn text(chunk: &Chunk) -> String {
        String::from_utf8_lossy(&chunk.to_bytes()).into_owned()
    }
}

impl Sink for RecordingSink {
    fn write(&self, chunk: Chunk, _encoding: Encoding, done: Completion) {
        self.calls.borrow_mut().push(vec![Self::text(&chunk)]);
        done.ok();
    }

    fn supports_writev(&self) -> bool {
        self.batching
    }

    fn writev(&self, chunks: Vec<(Chunk, Encoding)>, done: Completion) {
        let batch = chunks.iter().map(|(chunk, _)| Self::text(chunk)).collect();
        self.calls.borrow_mut().push(batch);
        done.ok();
    }
}

struct CountingDestroy {
    destroys: Rc<Cell<usize>>,
}

impl Source for CountingDestroy {
    fn read(&self, _ctl: &ReadController, _size: usize) {}

    fn destroy(&self, err: Option<StreamError>, done: Completion) {
        self.destroys.set(self.destroys.get() + 1);
        done.complete(err.map_or(Ok(()), Err));
    }
}

impl Sink for CountingDestroy {
    fn write(&self, _chunk: Chunk, _encoding: Encoding, done: Completion) {
        done.ok();
    }

    fn destroy(&self, err: Option<StreamError>, done: Completion) {
        self.destroys.set(self.destroys.get() + 1);
        done.complete(err.map_or(Ok(()), Err));
    }
}

fn count_events(stream: &impl AsStream, kind: EventKind) -> Rc<Cell<usize>> {
    let count = Rc::new(Cell::new(0));
    let c = count.clone();
    stream.on(kind, move |_| c.set(c.get() + 1));
    count
}

#[test]
fn end_fires_once_after_buffer_is_read() {
    let scheduler = Scheduler::new();
    let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
    let ends = count_events(&readable, EventKind::End);

    readable.push("a");
    readable.push("b");
    readable.push("c");
    readable.push_end();
    scheduler.run_until_idle().unwrap();
    assert_eq!(ends.get(), 0);
    assert_eq!(readable.readable_length(), 3);

    let data = readable.read().unwrap();
    assert_eq!(data.as_bytes().unwrap(), b"abc");
    scheduler.run_until_idle().unwrap();
    assert_eq!(ends.get(), 1);

    assert!(readable.read().is_none());
    scheduler.run_until_idle().unwrap();
    assert_eq!(ends.get(), 1);
}

#[test]
fn push_after_end_is_rejected() {
    let scheduler = Scheduler::new();
    let readable = ReadableStream::pushable(&scheduler, ReadableOptions::default());
    let error = Rc::new(RefCell::new(None));
    let e = error.clone();
    readable.on(EventKind::Error, move |event| *e.borrow_mut() = event.as_error().cloned());

    readable.push_end();
    assert!(!readable.push("late"));
    scheduler.run_until_idle().unwrap();
    assert!(matches!(&*error.borrow(), Some(StreamError::PushAfterEof)));
}

#[test]
fn write_after_end_fails_and_is_not_delivered() {
    let scheduler = Scheduler::new();
    let calls: Calls = Rc::default();
    let writable = WritableStream::new(
        &scheduler,
        WritableOptions::default(),
        RecordingSink {
            calls: calls.clone(),
            batching: false,
        },
    );
    writable.on(EventKind::Error, |_| {});
    writable.write("first");
    writable.end();

    let result: Rc<RefCell<Option<StreamResult<()>>>> = Rc::default();
    let r = result.clone();
    assert!(!writable.write_with("late", None, move |res| *r.borrow_mut() = Some(res)));
    scheduler.run_until_idle().unwrap();

    assert!(matches!(&*result.borrow(), Some(Err(StreamError::WriteAfterEnd))));
    assert_eq!(*calls.borrow(), vec![vec!["first".to_string()]]);
}

#[test]
fn uncork_flushes_one_batch_when_supported() {
    let scheduler = Scheduler::new();
    let calls: Calls = Rc::default();
    let writable = WritableStream::new(
        &scheduler,
        WritableOptions::default(),
        RecordingSink {
            calls: calls.clone(),
            batching: true,
        },
    );
    writable.cork();
    for chunk in ["1", "2", "3", "4"] {
        writable.write(chunk);
    }
    assert!(calls.borrow().is_empty());
    writable.uncork();
    scheduler.run_until_idle().unwrap();
    assert_eq!(*calls.borrow(), vec![vec!["1", "2", "3", "4"]]);
}

#[test]
fn uncork_flushes_sequentially_without_batching() {
    let scheduler = Scheduler::new();
    let calls: Calls = Rc::default();
    let writable = WritableStream::new(
        &scheduler,
        WritableOptions::default(),
        RecordingSink {
            calls: calls.clone(),
            batching: false,
        },
    );
    writable.cork();
    for chunk in ["1", "2", "3"] {
        writable.write(chunk);
    }
    writable.uncork();
    scheduler.run_until_idle().unwrap();
    assert_eq!(*calls.borrow(), vec![vec!["1"], vec!["2"], vec!["3"]]);
}

#[test]
fn destroy_twice_runs_hook_once() {
    let scheduler = Scheduler::new();
    let destroys = Rc::new(Cell::new(0));
    let writable = WritableStream::new(
        &scheduler,
        WritableOptions::default(),
        CountingDestroy {
            destroys: destroys.clone(),
        },
    );
    let errors = count_events(&writable, EventKind::Error);
    let closes = count_events(&writable, EventKind::Close);

    writable.destroy(Some(StreamError::other("first")));
    writable.destroy(Some(StreamError::other("second")));
    scheduler.run_until_idle().unwrap();

    assert_eq!(destroys.get(), 1);
    assert_eq!(errors.get(), 1);
    assert_eq!(closes.get(), 1);
    assert!(matches!(writable.errored(), Some(StreamError::Other(m)) if m == "first"));
}

#[test]
fn source_error_detaches_pipe() {
    let scheduler = Scheduler::new();
    let src = ReadableStream::pushable(&scheduler, ReadableOptions::default());
    let calls: Calls = Rc::default();
    let dest = WritableStream::new(
        &scheduler,
        WritableOptions::default(),
        RecordingSink {
            calls: calls.clone(),
            batching: false,
        },
    );
    src.on(EventKind::Error, |_| {});
    src.pipe(&dest);
    src.push("before");
    scheduler.run_until_idle().unwrap();
    assert_eq!(calls.borrow().len(), 1);

    src.destroy(Some(StreamError::other("source failed")));
    src.push("after");
    scheduler.run_until_idle().unwrap();

    assert_eq!(calls.borrow().len(), 1);
    assert_eq!(src.listener_count(EventKind::Data), 0);
    assert!(!dest.writable_ended());
}

#[test]
fn pipeline_failure_destroys_every_stage() {
    let scheduler = Scheduler::new();
    let (a_destroys, c_destroys) = (Rc::new(Cell::new(0)), Rc::new(Cell::new(0)));
    let a = ReadableStream::new(
        &scheduler,
        ReadableOptions::default(),
        CountingDestroy {
            destroys: a_destroys.clone(),
        },
    );
    let b = TransformStream::new(
        &scheduler,
        DuplexOptions::default(),
        transform_fn(|_ctl, _chunk, _encoding, done| {
            done.complete(Err(StreamError::other("transform failed")));
        }),
    );
    let c = WritableStream::new(
        &scheduler,
        WritableOptions::default(),
        CountingDestroy {
            destroys: c_destroys.clone(),
        },
    );

    let results: Rc<RefCell<Vec<StreamResult<()>>>> = Rc::default();
    let r = results.clone();
    pipeline([a.handle(), b.handle(), c.handle()], move |res| {
        r.borrow_mut().push(res)
    })
    .unwrap();
    a.push("payload");
    scheduler.run_until_idle().unwrap();

    let results = results.borrow();
    assert_eq!(results.len(), 1);
    assert!(matches!(&results[0], Err(StreamError::Other(m)) if m == "transform failed"));
    assert!(a.is_destroyed() && b.is_destroyed() && c.is_destroyed());
    assert_eq!(a_destroys.get(), 1);
    assert_eq!(c_destroys.get(), 1);
}

#[test]
fn slow_sink_backpressure_reaches_the_source() {
    let scheduler = Scheduler::new();
    let produced = Rc::new(Cell::new(0));
    let p = produced.clone();
    let src = ReadableStream::new(
        &scheduler,
        ReadableOptions {
            high_water_mark: Some(2),
            ..ReadableOptions::object()
        },
        source_fn(move |ctl, _size| {
            let n = p.get();
            if n == 20 {
                ctl.push_end();
            } else {
                p.set(n + 1);
                ctl.push(json!(n));
            }
        }),
    );
    let t = TransformStream::pass_through(&scheduler, DuplexOptions::object().with_high_water_mark(2));

    let pending: Rc<RefCell<VecDeque<Completion>>> = Rc::default();
    let received: Rc<RefCell<Vec<Chunk>>> = Rc::default();
    let (q, r) = (pending.clone(), received.clone());
    let sink = WritableStream::new(
        &scheduler,
        WritableOptions {
            high_water_mark: Some(2),
            ..WritableOptions::object()
        },
        sink_fn(move |chunk, _encoding, done| {
            r.borrow_mut().push(chunk);
            q.borrow_mut().push_back(done);
        }),
    );

    let results: Rc<RefCell<Vec<StreamResult<()>>>> = Rc::default();
    let out = results.clone();
    pipeline([src.handle(), t.handle(), sink.handle()], move |res| {
        out.borrow_mut().push(res)
    })
    .unwrap();
    scheduler.run_until_idle().unwrap();

    // Nothing completes in the sink, so every stage stops at its mark
    assert!(produced.get() < 20);
    assert!(t.readable_length() <= 3);
    assert!(src.is_paused());
    assert!(results.borrow().is_empty());

    let mut max_buffered = t.readable_length();
    loop {
        let next = pending.borrow_mut().pop_front();
        let Some(done) = next else {
            break;
        };
        done.ok();
        scheduler.run_until_idle().unwrap();
        max_buffered = max_buffered.max(t.readable_length());
    }

    assert!(max_buffered <= 3);
    let expected: Vec<Chunk> = (0..20).map(|n| Chunk::from(json!(n))).collect();
    assert_eq!(*received.borrow(), expected);
    assert!(matches!(results.borrow().as_slice(), [Ok(())]));
}

#[test]
fn drain_fires_once_when_buffer_empties() {
    let scheduler = Scheduler::new();
    let pending: Rc<RefCell<Vec<Completion>>> = Rc::default();
    let p = pending.clone();
    let writable = WritableStream::new(
        &scheduler,
        WritableOptions {
            high_water_mark: Some(3),
            ..Default::default()
        },
        sink_fn(move |_chunk, _encoding, done| p.borrow_mut().push(done)),
    );
    let drains = count_events(&writable, EventKind::Drain);

    assert!(writable.write("ab"));
    assert!(!writable.write("cd"));
    assert!(writable.writable_need_drain());

    let first = pending.borrow_mut().remove(0);
    first.ok();
    scheduler.run_until_idle().unwrap();
    assert_eq!(drains.get(), 0);

    let second = pending.borrow_mut().remove(0);
    second.ok();
    scheduler.run_until_idle().unwrap();
    assert_eq!(drains.get(), 1);
    assert_eq!(writable.writable_length(), 0);
}

#[tokio::test]
async fn async_iteration_yields_items_in_order() {
    let scheduler = Scheduler::new();
    let readable = ReadableStream::from_iter(&scheduler, [json!(1), json!(2), json!(3)]);
    let items: Vec<Chunk> = readable
        .iter()
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(
        items,
        vec![Chunk::from(json!(1)), Chunk::from(json!(2)), Chunk::from(json!(3))]
    );
}

#[tokio::test]
async fn early_iterator_exit_destroys_stream() {
    let scheduler = Scheduler::new();
    let readable = ReadableStream::pushable(&scheduler, ReadableOptions::object());
    readable.push(json!(1));
    readable.push(json!(2));
    let closes = count_events(&readable, EventKind::Close);

    let mut iter = readable.iter();
    assert!(iter.next().await.is_some());
    drop(iter);

    assert!(readable.is_destroyed());
    scheduler.run_until_idle().unwrap();
    assert_eq!(closes.get(), 1);
}
