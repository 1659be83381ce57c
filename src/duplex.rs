//! Streams with independent readable and writable sides

use crate::{
    config::DuplexOptions,
    hooks::{Sink, Source},
    readable::{Readable, ReadableState},
    scheduler::Scheduler,
    stream::{AsStream, Hooks, Stream},
    writable::{Writable, WritableState},
};
use std::rc::Rc;

/// One readable and one writable side on a single stream entity
///
/// With `allow_half_open` disabled, the writable side is ended as soon as
/// the readable side emitted `end`.
#[derive(Clone, Debug)]
pub struct DuplexStream {
    stream: Stream,
}

impl AsStream for DuplexStream {
    fn as_stream(&self) -> &Stream {
        &self.stream
    }
}

impl Readable for DuplexStream {}
impl Writable for DuplexStream {}

impl DuplexStream {
    pub fn new(
        scheduler: &Scheduler,
        options: DuplexOptions,
        source: impl Source,
        sink: impl Sink,
    ) -> Self {
        let hooks = Hooks::Duplex {
            source: Rc::new(source),
            sink: Rc::new(sink),
        };
        Self {
            stream: Stream::new(
                scheduler,
                Some(ReadableState::new(&options.readable)),
                Some(WritableState::new(&options.writable)),
                hooks,
                options.allow_half_open,
            ),
        }
    }

    pub fn allow_half_open(&self) -> bool {
        self.stream.inner.allow_half_open
    }
}
