use crate::log::{LogDest, LogStream};
use crate::stage::{Closeable, Stage, Stream, Unit};
use std::sync::{Arc, Mutex, PoisonError};

type Extract = fn(&Unit) -> Option<&str>;

fn opened_url(unit: &Unit) -> Option<&str> {
    match unit {
        Unit::Opened(o) => Some(&o.url),
        _ => None,
    }
}

fn sample_key(unit: &Unit) -> Option<&str> {
    match unit {
        Unit::Sample(s) => s.key(),
        _ => None,
    }
}

/// Pass-through stage that writes one line per matching unit to a debug
/// log. The log belongs to the stage and survives across epochs; it is
/// opened on the first line and released by [`Closeable::close`].
pub struct LogStage {
    name: &'static str,
    log: Arc<Mutex<LogStream>>,
    extract: Extract,
}

impl LogStage {
    /// Logs the URL of every opened shard.
    #[must_use]
    pub fn shards(dest: LogDest) -> Self {
        Self::new("log_shards", dest, opened_url)
    }

    /// Logs the key of every sample.
    #[must_use]
    pub fn keys(dest: LogDest) -> Self {
        Self::new("log_keys", dest, sample_key)
    }

    fn new(name: &'static str, dest: LogDest, extract: Extract) -> Self {
        Self {
            name,
            log: Arc::new(Mutex::new(LogStream::new(dest))),
            extract,
        }
    }
}

impl Stage for LogStage {
    fn name(&self) -> &str {
        self.name
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        let input = input?;
        let enabled = self
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_enabled();
        if !enabled {
            return Some(input);
        }
        let log = Arc::clone(&self.log);
        let extract = self.extract;
        Some(Box::new(input.inspect(move |unit| {
            if let Ok(unit) = unit
                && let Some(line) = extract(unit)
            {
                log.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .write_line(line);
            }
        })))
    }

    fn closeable(&mut self) -> Option<&mut dyn Closeable> {
        Some(self)
    }
}

impl Closeable for LogStage {
    fn close(&mut self) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
    }
}
