//! Async iteration over a readable
//!
//! [`ReadableIter`] consumes a readable in paused mode and implements
//! [`futures_util::Stream`]. Polling drives the stream's scheduler, so
//! iterating needs no separate event loop. Dropping the iterator before the
//! stream ended destroys the stream.

use crate::{
    chunk::Chunk,
    config::FinishedOptions,
    error::StreamResult,
    events::{EventKind, ListenerId},
    finished::{Subscription, finished},
    readable,
    stream::Stream,
};
use std::{
    cell::{Cell, RefCell},
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

#[derive(Default)]
struct Signal {
    notified: Cell<bool>,
    /// `None` until the stream settled
    outcome: RefCell<Option<StreamResult<()>>>,
    waker: RefCell<Option<Waker>>,
}

impl Signal {
    fn notify(&self) {
        self.notified.set(true);
        let waker = self.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Async iterator over the chunks of a readable
///
/// Yields `Ok(chunk)` for every chunk, `Err` once if the stream failed or
/// closed before `end`, then `None`.
pub struct ReadableIter {
    stream: Stream,
    signal: Rc<Signal>,
    readable_listener: Option<ListenerId>,
    subscription: Option<Subscription>,
    done: bool,
}

impl ReadableIter {
    pub(crate) fn new(stream: Stream) -> Self {
        let signal = Rc::new(Signal::default());

        let s = signal.clone();
        let readable_listener = stream.on(EventKind::Readable, move |_| s.notify());

        let s = signal.clone();
        let options = FinishedOptions {
            readable: None,
            writable: Some(false),
        };
        let subscription = finished(&stream, options, move |result| {
            *s.outcome.borrow_mut() = Some(result);
            s.notify();
        });

        Self {
            stream,
            signal,
            readable_listener: Some(readable_listener),
            subscription: Some(subscription),
            done: false,
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    fn next_chunk(&self) -> Option<Chunk> {
        if self.stream.is_destroyed() {
            None
        } else {
            readable::read(&self.stream, None)
        }
    }
}

impl futures_util::Stream for ReadableIter {
    type Item = StreamResult<Chunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            if let Some(chunk) = this.next_chunk() {
                return Poll::Ready(Some(Ok(chunk)));
            }

            let outcome = this.signal.outcome.borrow().clone();
            match outcome {
                Some(Ok(())) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Some(Err(err)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                None => {}
            }

            if this.signal.notified.replace(false) {
                continue;
            }
            if this.stream.scheduler().tick() {
                continue;
            }

            *this.signal.waker.borrow_mut() = Some(cx.waker().clone());
            this.stream.scheduler().wake_on_schedule(cx.waker());
            return Poll::Pending;
        }
    }
}

impl Drop for ReadableIter {
    fn drop(&mut self) {
        if let Some(id) = self.readable_listener.take() {
            self.stream.off(id);
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        let settled = self.signal.outcome.borrow().is_some();
        let auto_destroy = self.stream.rstate().is_some_and(|r| r.auto_destroy);
        if !settled || auto_destroy {
            log::trace!("async iterator dropped, destroying stream");
            self.stream.destroy(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::ReadableOptions,
        error::StreamError,
        readable::{Readable, ReadableStream},
        scheduler::Scheduler,
        stream::AsStream,
    };
    use futures_util::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_iterates_all_items() {
        let scheduler = Scheduler::new();
        let stream = ReadableStream::from_iter(&scheduler, [json!(1), json!(2), json!(3)]);
        let mut iter = stream.iter();
        let mut seen = Vec::new();
        while let Some(item) = iter.next().await {
            seen.push(item.unwrap().as_object().cloned().unwrap());
        }
        assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn test_early_drop_destroys() {
        let scheduler = Scheduler::new();
        let stream = ReadableStream::from_iter(&scheduler, [json!(1), json!(2), json!(3)]);
        {
            let mut iter = stream.iter();
            let first = iter.next().await.unwrap().unwrap();
            assert_eq!(first.as_object(), Some(&json!(1)));
        }
        assert!(stream.is_destroyed());
        scheduler.run_until_idle().unwrap();
    }

    #[tokio::test]
    async fn test_error_is_yielded_once() {
        let scheduler = Scheduler::new();
        let stream = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        stream.push("lost");
        stream.destroy(Some(StreamError::other("gone")));

        let mut iter = stream.iter();
        let first = iter.next().await;
        assert!(matches!(first, Some(Err(StreamError::Other(m))) if m == "gone"));
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn test_destroy_without_error_is_premature_close() {
        let scheduler = Scheduler::new();
        let stream = ReadableStream::pushable(&scheduler, ReadableOptions::default());
        let mut iter = stream.iter();
        stream.destroy(None);
        assert!(matches!(
            iter.next().await,
            Some(Err(StreamError::PrematureClose))
        ));
    }

    #[tokio::test]
    async fn test_producer_on_another_future() {
        let scheduler = Scheduler::new();
        let stream = ReadableStream::pushable(&scheduler, ReadableOptions::object());
        let producer = {
            let stream = stream.clone();
            async move {
                for n in 0..3 {
                    tokio::task::yield_now().await;
                    stream.push(json!(n));
                }
                stream.push_end();
            }
        };
        let consumer = async {
            let mut iter = stream.iter();
            let mut seen = Vec::new();
            while let Some(item) = iter.next().await {
                seen.push(item.unwrap());
            }
            seen.len()
        };
        let ((), count) = futures_util::join!(producer, consumer);
        assert_eq!(count, 3);
    }
}
