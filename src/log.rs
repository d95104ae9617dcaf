//! Debug side channels for shard URLs and sample keys.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Where a debug log goes.
#[derive(Clone, Default)]
pub enum LogDest {
    #[default]
    Disabled,
    Stderr,
    /// Created (truncated) on first write.
    Path(PathBuf),
    /// A writer owned by the caller; flushed but never closed here.
    Writer(SharedWriter),
}

impl LogDest {
    pub fn writer<W: Write + Send + 'static>(w: W) -> Self {
        Self::Writer(Arc::new(Mutex::new(w)))
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl fmt::Debug for LogDest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Stderr => f.write_str("Stderr"),
            Self::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Self::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// `"-"` is standard error, anything else a path.
impl From<&str> for LogDest {
    fn from(value: &str) -> Self {
        if value == "-" {
            Self::Stderr
        } else {
            Self::Path(PathBuf::from(value))
        }
    }
}

impl From<PathBuf> for LogDest {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

enum Sink {
    Stderr,
    File(BufWriter<File>),
    Shared(SharedWriter),
}

impl Sink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self {
            Self::Stderr => writeln!(io::stderr().lock(), "{line}"),
            Self::File(f) => writeln!(f, "{line}"),
            Self::Shared(w) => {
                let mut w = w.lock().unwrap_or_else(PoisonError::into_inner);
                writeln!(w, "{line}")
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stderr => io::stderr().flush(),
            Self::File(f) => f.flush(),
            Self::Shared(w) => w.lock().unwrap_or_else(PoisonError::into_inner).flush(),
        }
    }
}

/// A lazily opened log, written one line per entry.
///
/// Nothing is opened until the first line arrives. A failed open or write is
/// reported once and the stream goes quiet; the data pipeline is unaffected.
pub struct LogStream {
    dest: LogDest,
    sink: Option<Sink>,
    broken: bool,
}

impl LogStream {
    #[must_use]
    pub const fn new(dest: LogDest) -> Self {
        Self {
            dest,
            sink: None,
            broken: false,
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.dest.is_enabled() && !self.broken
    }

    /// True once the first line has opened the destination.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    fn open(&self) -> io::Result<Sink> {
        Ok(match &self.dest {
            LogDest::Disabled | LogDest::Stderr => Sink::Stderr,
            LogDest::Path(p) => {
                debug!(path = %p.display(), "opening log");
                Sink::File(BufWriter::new(File::create(p)?))
            }
            LogDest::Writer(w) => Sink::Shared(Arc::clone(w)),
        })
    }

    pub fn write_line(&mut self, line: &str) {
        if !self.is_enabled() {
            return;
        }
        if self.sink.is_none() {
            match self.open() {
                Ok(sink) => self.sink = Some(sink),
                Err(err) => {
                    warn!(dest = ?self.dest, %err, "cannot open log, disabling it");
                    self.broken = true;
                    return;
                }
            }
        }
        if let Some(sink) = self.sink.as_mut()
            && let Err(err) = sink.write_line(line)
        {
            warn!(dest = ?self.dest, %err, "log write failed, disabling it");
            self.broken = true;
        }
    }

    /// Flush and release the destination. Writing again reopens it.
    pub fn close(&mut self) {
        if let Some(mut sink) = self.sink.take()
            && let Err(err) = sink.flush()
        {
            warn!(dest = ?self.dest, %err, "log flush failed");
        }
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.close();
    }
}
