//! nodestream - stream files through the engine
//!
//! Every command builds a pipeline from a file (or stdin) source, an optional
//! transform and a sink, then drives the scheduler until the pipeline settled.

use clap::{Parser, Subcommand};
use colored::Colorize;
use miette::{IntoDiagnostic, Result, miette};
use std::{
    cell::{Cell, RefCell},
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    rc::Rc,
};

use nodestream::{
    Chunk, Completion, DuplexOptions, Encoding, ReadController, ReadableOptions, ReadableStream,
    ReaderSource, Scheduler, Stream, StreamResult, TransformStream, Transformer, WritableOptions,
    WritableStream, WriterSink, pipeline, prelude::*, sink_fn, transform_fn,
};

#[derive(Parser)]
#[command(name = "nodestream")]
#[command(author, version, about = "Stream files through a Node.js compatible stream engine")]
struct Cli {
    /// Buffer threshold, in bytes, for every stream in the pipeline
    #[arg(long, global = true)]
    high_water_mark: Option<usize>,

    /// Decode the input into text with this encoding (utf8, hex, base64, ...)
    #[arg(short, long, global = true)]
    encoding: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a file to stdout
    Cat {
        /// Input file, `-` for stdin
        file: PathBuf,
    },
    /// Copy a file to stdout in upper case
    Upper {
        /// Input file, `-` for stdin
        file: PathBuf,
    },
    /// Print a file with line numbers
    Lines {
        /// Input file, `-` for stdin
        file: PathBuf,
    },
    /// Count bytes, lines and chunks
    Count {
        /// Input file, `-` for stdin
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let encoding = cli
        .encoding
        .as_deref()
        .map(str::parse::<Encoding>)
        .transpose()
        .into_diagnostic()?;
    let settings = Settings {
        high_water_mark: cli.high_water_mark,
        encoding,
    };

    match cli.command {
        Commands::Cat { file } => copy(&file, &settings, None),
        Commands::Upper { file } => {
            let scheduler = Scheduler::new();
            let upper = TransformStream::new(
                &scheduler,
                settings.duplex_options(),
                transform_fn(|_ctl, chunk, _encoding, done| {
                    let upper = match chunk {
                        Chunk::Text(text) => Chunk::from(text.to_uppercase()),
                        other => Chunk::from(other.to_bytes().to_ascii_uppercase()),
                    };
                    done.complete(Ok(Some(upper)));
                }),
            );
            copy_with(&scheduler, &file, &settings, Some(upper))
        }
        Commands::Lines { file } => {
            let scheduler = Scheduler::new();
            let numbered = TransformStream::new(
                &scheduler,
                settings.duplex_options(),
                LineNumbers::default(),
            );
            copy_with(&scheduler, &file, &settings, Some(numbered))
        }
        Commands::Count { file } => count(&file, &settings),
    }
}

struct Settings {
    high_water_mark: Option<usize>,
    encoding: Option<Encoding>,
}

impl Settings {
    fn readable_options(&self) -> ReadableOptions {
        ReadableOptions {
            high_water_mark: self.high_water_mark,
            ..Default::default()
        }
    }

    fn writable_options(&self) -> WritableOptions {
        WritableOptions {
            high_water_mark: self.high_water_mark,
            ..Default::default()
        }
    }

    fn duplex_options(&self) -> DuplexOptions {
        match self.high_water_mark {
            Some(hwm) => DuplexOptions::default().with_high_water_mark(hwm),
            None => DuplexOptions::default(),
        }
    }
}

fn open(path: &Path) -> Result<Box<dyn Read>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(io::stdin()));
    }
    let file = File::open(path)
        .map_err(|e| miette!("Cannot open {}: {}", path.display(), e))?;
    Ok(Box::new(file))
}

fn source(scheduler: &Scheduler, path: &Path, settings: &Settings) -> Result<ReadableStream> {
    let reader = open(path)?;
    let source = ReadableStream::new(scheduler, settings.readable_options(), ReaderSource::new(reader));
    if let Some(encoding) = settings.encoding {
        source.set_encoding(encoding);
    }
    Ok(source)
}

fn copy(path: &Path, settings: &Settings, transform: Option<TransformStream>) -> Result<()> {
    let scheduler = Scheduler::new();
    copy_with(&scheduler, path, settings, transform)
}

fn copy_with(
    scheduler: &Scheduler,
    path: &Path,
    settings: &Settings,
    transform: Option<TransformStream>,
) -> Result<()> {
    let input = source(scheduler, path, settings)?;
    let output = WritableStream::new(scheduler, settings.writable_options(), WriterSink::new(io::stdout()));

    let mut stages: Vec<Stream> = vec![input.handle()];
    stages.extend(transform.map(|t| t.handle()));
    stages.push(output.handle());
    run(scheduler, stages)
}

fn count(path: &Path, settings: &Settings) -> Result<()> {
    let scheduler = Scheduler::new();
    let input = source(&scheduler, path, settings)?;

    let totals = Rc::new(Totals::default());
    let t = totals.clone();
    let counter = WritableStream::new(
        &scheduler,
        settings.writable_options(),
        sink_fn(move |chunk: Chunk, _encoding, done: Completion| {
            let bytes = chunk.to_bytes();
            t.bytes.set(t.bytes.get() + bytes.len());
            t.lines.set(t.lines.get() + bytes.iter().filter(|&&b| b == b'\n').count());
            t.chunks.set(t.chunks.get() + 1);
            done.ok();
        }),
    );

    run(&scheduler, vec![input.handle(), counter.handle()])?;
    println!("{:>10} {}", totals.bytes.get().to_string().green(), "bytes".dimmed());
    println!("{:>10} {}", totals.lines.get().to_string().green(), "lines".dimmed());
    println!("{:>10} {}", totals.chunks.get().to_string().green(), "chunks".dimmed());
    Ok(())
}

#[derive(Default)]
struct Totals {
    bytes: Cell<usize>,
    lines: Cell<usize>,
    chunks: Cell<usize>,
}

/// Run a pipeline to completion and surface its result
fn run(scheduler: &Scheduler, stages: Vec<Stream>) -> Result<()> {
    let outcome: Rc<RefCell<Option<StreamResult<()>>>> = Rc::default();
    let o = outcome.clone();
    pipeline(stages, move |result| *o.borrow_mut() = Some(result)).into_diagnostic()?;

    scheduler.run_until_idle().into_diagnostic()?;

    match outcome.borrow_mut().take() {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => {
            eprintln!("{}: {} ({})", "Error".red(), e, e.code());
            Err(e).into_diagnostic()
        }
        None => Err(miette!("pipeline did not settle")),
    }
}

/// Prefixes every line with its number
#[derive(Default)]
struct LineNumbers {
    partial: RefCell<String>,
    next: Cell<usize>,
}

impl LineNumbers {
    fn numbered(&self, line: &str) -> String {
        let n = self.next.get() + 1;
        self.next.set(n);
        format!("{:>6}  {}\n", n, line)
    }
}

impl Transformer for LineNumbers {
    fn transform(
        &self,
        ctl: &ReadController,
        chunk: Chunk,
        _encoding: Encoding,
        done: Completion<Option<Chunk>>,
    ) {
        let text = match chunk {
            Chunk::Text(text) => text,
            other => String::from_utf8_lossy(&other.to_bytes()).into_owned(),
        };
        let mut partial = self.partial.borrow_mut();
        partial.push_str(&text);
        while let Some(pos) = partial.find('\n') {
            let line: String = partial.drain(..=pos).collect();
            ctl.push(self.numbered(line.trim_end_matches(['\n', '\r'])));
        }
        drop(partial);
        done.complete(Ok(None));
    }

    fn flush(&self, _ctl: &ReadController, done: Completion<Option<Chunk>>) {
        let rest = std::mem::take(&mut *self.partial.borrow_mut());
        if rest.is_empty() {
            done.complete(Ok(None));
        } else {
            done.complete(Ok(Some(Chunk::from(self.numbered(&rest)))));
        }
    }
}
