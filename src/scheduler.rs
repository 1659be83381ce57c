//! Cooperative next-turn scheduler for the stream engine
//!
//! Streams never call back into listener code re-entrantly when ordering
//! matters; they defer the continuation to the next turn instead. This module
//! provides that primitive as an explicit object handed to every stream at
//! construction, so there is no global tick queue:
//! - FIFO ordering among callbacks scheduled in the same turn
//! - Run-to-idle draining with uncaught `error` event capture
//! - Single-step driving for async iteration

use crate::error::{StreamError, StreamResult};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    rc::Rc,
    task::Waker,
};

/// A deferred continuation
type Task = Box<dyn FnOnce()>;

struct SchedulerInner {
    /// Queue of next-turn callbacks, processed strictly in order
    ticks: RefCell<VecDeque<Task>>,
    /// Errors emitted on streams that had no `error` listener
    uncaught: RefCell<VecDeque<StreamError>>,
    /// Number of tasks executed so far
    turns: Cell<u64>,
    /// Async consumer parked until the next task is queued
    waker: RefCell<Option<Waker>>,
}

/// Handle to a single-threaded next-turn queue
///
/// Cloning the handle shares the queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.inner.ticks.borrow().len())
            .field("turns", &self.inner.turns.get())
            .finish()
    }
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                ticks: RefCell::new(VecDeque::with_capacity(64)),
                uncaught: RefCell::new(VecDeque::new()),
                turns: Cell::new(0),
                waker: RefCell::new(None),
            }),
        }
    }

    /// Defer `task` to the next turn
    pub fn next_tick(&self, task: impl FnOnce() + 'static) {
        self.inner.ticks.borrow_mut().push_back(Box::new(task));
        let waker = self.inner.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wake `waker` the next time a task is queued
    pub(crate) fn wake_on_schedule(&self, waker: &Waker) {
        let mut slot = self.inner.waker.borrow_mut();
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// Check if there's any pending work
    pub fn has_pending_work(&self) -> bool {
        !self.inner.ticks.borrow().is_empty()
    }

    /// Number of tasks executed since creation
    pub fn turns(&self) -> u64 {
        self.inner.turns.get()
    }

    /// Run the oldest pending task. Returns false if the queue was empty.
    pub fn tick(&self) -> bool {
        // The borrow must end before the task runs: tasks schedule more tasks.
        let task = self.inner.ticks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                let turn = self.inner.turns.get() + 1;
                self.inner.turns.set(turn);
                log::trace!("scheduler turn {}", turn);
                task();
                true
            }
            None => false,
        }
    }

    /// Drain the queue, including tasks scheduled while draining
    ///
    /// Stops at the first uncaught stream error and returns it; the remaining
    /// tasks stay queued.
    pub fn run_until_idle(&self) -> StreamResult<()> {
        loop {
            if let Some(err) = self.take_uncaught() {
                return Err(err);
            }
            if !self.tick() {
                return Ok(());
            }
        }
    }

    /// Record an `error` event that no listener handled
    pub(crate) fn report_uncaught(&self, err: StreamError) {
        log::error!("unhandled stream error: {}", err);
        self.inner.uncaught.borrow_mut().push_back(err);
    }

    /// Take the oldest unhandled stream error, if any
    pub fn take_uncaught(&self) -> Option<StreamError> {
        self.inner.uncaught.borrow_mut().pop_front()
    }
}
