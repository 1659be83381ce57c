//! Adapters between `std::io` and stream hooks

use crate::{
    chunk::Chunk,
    encoding::Encoding,
    error::StreamError,
    hooks::{Completion, ReadController, Sink, Source},
};
use std::{
    cell::RefCell,
    io::{ErrorKind, Read, Write},
};

/// Default read size for [`ReaderSource`]
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Readable source pulling from any [`Read`]
pub struct ReaderSource<R> {
    reader: RefCell<R>,
    chunk_size: usize,
}

impl<R: Read + 'static> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader: RefCell::new(reader),
            chunk_size: chunk_size.max(1),
        }
    }
}

impl<R: Read + 'static> Source for ReaderSource<R> {
    fn read(&self, ctl: &ReadController, size: usize) {
        let mut buf = vec![0u8; size.clamp(1, self.chunk_size)];
        let result = loop {
            match self.reader.borrow_mut().read(&mut buf) {
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match result {
            Ok(0) => {
                ctl.push_end();
            }
            Ok(n) => {
                buf.truncate(n);
                ctl.push(buf);
            }
            Err(err) => {
                log::debug!("read failed: {}", err);
                ctl.destroy(Some(err.into()));
            }
        }
    }
}

/// Writable sink writing into any [`Write`]
pub struct WriterSink<W> {
    writer: RefCell<W>,
}

impl<W: Write + 'static> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: RefCell::new(writer),
        }
    }
}

impl<W: Write + 'static> Sink for WriterSink<W> {
    fn write(&self, chunk: Chunk, _encoding: Encoding, done: Completion) {
        let result = self.writer.borrow_mut().write_all(&chunk.to_bytes());
        done.complete(result.map_err(StreamError::from));
    }

    fn supports_writev(&self) -> bool {
        true
    }

    fn writev(&self, chunks: Vec<(Chunk, Encoding)>, done: Completion) {
        let mut writer = self.writer.borrow_mut();
        for (chunk, _) in &chunks {
            if let Err(err) = writer.write_all(&chunk.to_bytes()) {
                drop(writer);
                done.error(err.into());
                return;
            }
        }
        drop(writer);
        done.ok();
    }

    fn finalize(&self, done: Completion) {
        let result = self.writer.borrow_mut().flush();
        done.complete(result.map_err(StreamError::from));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ReadableOptions, WritableOptions},
        events::EventKind,
        readable::{Readable, ReadableStream},
        scheduler::Scheduler,
        stream::AsStream,
        writable::{Writable, WritableStream},
    };
    use std::{io::Cursor, rc::Rc};

    /// `Write` into a shared buffer the test can inspect
    #[derive(Clone, Default)]
    struct Shared(Rc<RefCell<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk on fire"))
        }
    }

    #[test]
    fn test_reader_to_writer() {
        let scheduler = Scheduler::new();
        let input: Vec<u8> = (0..200u8).collect();
        let source = ReaderSource::with_chunk_size(Cursor::new(input.clone()), 64);
        let readable = ReadableStream::new(&scheduler, ReadableOptions::default(), source);
        let out = Shared::default();
        let writable = WritableStream::new(
            &scheduler,
            WritableOptions::default(),
            WriterSink::new(out.clone()),
        );
        readable.pipe(&writable);
        scheduler.run_until_idle().unwrap();

        assert_eq!(*out.0.borrow(), input);
        assert!(writable.writable_finished());
    }

    #[test]
    fn test_read_error_destroys() {
        let scheduler = Scheduler::new();
        let readable = ReadableStream::new(
            &scheduler,
            ReadableOptions::default(),
            ReaderSource::new(Broken),
        );
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        readable.on(EventKind::Error, move |event| {
            *s.borrow_mut() = event.as_error().map(|err| err.code());
        });
        readable.on(EventKind::Data, |_| {});
        scheduler.run_until_idle().unwrap();
        assert_eq!(*seen.borrow(), Some("ERR_IO"));
        assert!(readable.is_destroyed());
    }

    #[test]
    fn test_corked_writes_use_writev() {
        let scheduler = Scheduler::new();
        let out = Shared::default();
        let writable = WritableStream::new(
            &scheduler,
            WritableOptions::default(),
            WriterSink::new(out.clone()),
        );
        writable.cork();
        writable.write("a");
        writable.write("b");
        assert!(out.0.borrow().is_empty());
        writable.uncork();
        assert_eq!(*out.0.borrow(), b"ab");
        scheduler.run_until_idle().unwrap();
    }
}
