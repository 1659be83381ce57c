//! Chain streams with error propagation
//!
//! `pipeline` pipes each stage into the next and watches every stage with
//! [`finished`]. The first failure destroys every stage that has not
//! completed; the callback runs once, on the turn after the last stage
//! settled, with the first error (a premature close only wins if nothing
//! better was seen).

use crate::{
    config::{FinishedOptions, PipeOptions},
    error::{StreamError, StreamResult},
    events::EventKind,
    finished::finished,
    pipe,
    stream::Stream,
};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

type Callback = Box<dyn FnOnce(StreamResult<()>)>;

struct Run {
    stages: RefCell<VecDeque<Rc<Stage>>>,
    remaining: Cell<usize>,
    error: RefCell<Option<StreamError>>,
    callback: RefCell<Option<Callback>>,
    last: Stream,
}

impl Run {
    fn finish(&self, err: Option<StreamError>) {
        let remaining = self.remaining.get().saturating_sub(1);
        self.remaining.set(remaining);
        self.settle(err, remaining == 0);
    }

    fn settle(&self, err: Option<StreamError>, last: bool) {
        if let Some(err) = err {
            let mut error = self.error.borrow_mut();
            if error.as_ref().is_none_or(StreamError::is_premature_close) {
                *error = Some(err);
            }
        }
        let error = self.error.borrow().clone();
        if error.is_none() && !last {
            return;
        }

        // Stages may settle reentrantly while being destroyed
        loop {
            let stage = self.stages.borrow_mut().pop_front();
            match stage {
                Some(stage) => stage.destroy(error.clone()),
                None => break,
            }
        }

        if last {
            let Some(callback) = self.callback.borrow_mut().take() else {
                return;
            };
            match &error {
                Some(err) => log::debug!("pipeline failed: {}", err),
                None => log::debug!("pipeline completed"),
            }
            let result = error.map_or(Ok(()), Err);
            self.last
                .scheduler()
                .next_tick(move || callback(result));
        }
    }
}

struct Stage {
    stream: Stream,
    finished: Cell<bool>,
    reported: Cell<bool>,
    run: Rc<Run>,
}

impl Stage {
    fn report(&self, err: Option<StreamError>) {
        if self.reported.replace(true) {
            return;
        }
        self.run.finish(err);
    }

    fn destroy(&self, err: Option<StreamError>) {
        if self.finished.replace(true) {
            return;
        }
        self.stream.destroy(err.clone());
        self.report(Some(err.unwrap_or(StreamError::Destroyed("pipe"))));
    }

    fn watch(self: &Rc<Self>, reading: bool, writing: bool) {
        let weak = Rc::downgrade(self);
        self.stream.on(EventKind::Close, move |_| {
            if let Some(stage) = weak.upgrade() {
                stage.finished.set(true);
            }
        });

        let weak = Rc::downgrade(self);
        let options = FinishedOptions {
            readable: Some(reading),
            writable: Some(writing),
        };
        finished(&self.stream, options, move |result| {
            if let Some(stage) = weak.upgrade() {
                stage.on_finished(reading, result);
            }
        });
    }

    fn on_finished(self: &Rc<Self>, reading: bool, result: StreamResult<()>) {
        self.finished.set(result.is_ok());
        let err = match result {
            Ok(()) => {
                self.report(None);
                return;
            }
            Err(err) => err,
        };
        let end_pending = self
            .stream
            .rstate()
            .is_some_and(|r| r.ended && !r.error_emitted && !r.end_emitted);
        if err.is_premature_close() && reading && end_pending {
            // The readable side still drains what it buffered
            log::trace!("pipeline stage closed early, waiting for end");
            let weak = Rc::downgrade(self);
            self.stream.once(EventKind::End, move |_| {
                if let Some(stage) = weak.upgrade() {
                    stage.report(None);
                }
            });
            let weak = Rc::downgrade(self);
            self.stream.once(EventKind::Error, move |event| {
                if let Some(stage) = weak.upgrade() {
                    stage.report(event.as_error().cloned());
                }
            });
            return;
        }
        self.report(Some(err));
    }
}

fn check_stage(stream: &Stream, index: usize, count: usize) -> StreamResult<()> {
    let (needs_readable, needs_writable) = (index + 1 < count, index > 0);
    let expected = match (needs_readable, needs_writable) {
        (true, true) => "a duplex stream",
        (true, false) => "readable",
        (false, _) => "writable",
    };
    let ok = (!needs_readable || stream.has_readable()) && (!needs_writable || stream.has_writable());
    if ok {
        Ok(())
    } else {
        Err(StreamError::InvalidPipelineStage { index, expected })
    }
}

/// Pipe `streams` into each other, in order
///
/// The first stream must be readable, the last writable, and every stream in
/// between both. `callback` runs exactly once when all stages completed or
/// the pipeline failed; on failure every unfinished stage is destroyed.
/// Returns the last stream.
pub fn pipeline<I, F>(streams: I, callback: F) -> StreamResult<Stream>
where
    I: IntoIterator<Item = Stream>,
    F: FnOnce(StreamResult<()>) + 'static,
{
    let streams: Vec<Stream> = streams.into_iter().collect();
    if streams.len() < 2 {
        return Err(StreamError::MissingPipelineStreams);
    }
    for (index, stream) in streams.iter().enumerate() {
        check_stage(stream, index, streams.len())?;
    }
    let Some(last) = streams.last().cloned() else {
        return Err(StreamError::MissingPipelineStreams);
    };
    log::debug!("building pipeline of {} streams", streams.len());

    let run = Rc::new(Run {
        stages: RefCell::new(VecDeque::with_capacity(streams.len())),
        remaining: Cell::new(streams.len()),
        error: RefCell::new(None),
        callback: RefCell::new(Some(Box::new(callback))),
        last: last.clone(),
    });

    let count = streams.len();
    for (index, stream) in streams.iter().enumerate() {
        let stage = Rc::new(Stage {
            stream: stream.clone(),
            finished: Cell::new(false),
            reported: Cell::new(false),
            run: run.clone(),
        });
        run.stages.borrow_mut().push_back(stage.clone());
        stage.watch(index + 1 < count, index > 0);
    }

    for pair in streams.windows(2) {
        pipe::pipe(&pair[0], &pair[1], PipeOptions::default());
    }
    Ok(last)
}
