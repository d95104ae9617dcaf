//! Stage interface and the element type stages exchange.

use crate::error::DatasetError;
use crate::io::compression::ShardReader;
use crate::io::tar::MemberFile;
use crate::sample::Sample;
use crate::shardlist::ShardDescriptor;
use anyhow::Result;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A shard whose bytes are ready to be read.
pub struct OpenedShard {
    pub url: String,
    pub shard_num: usize,
    pub stream: ShardReader,
    /// Cached copy the stream was opened from, if any.
    pub local_path: Option<PathBuf>,
}

impl fmt::Debug for OpenedShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedShard")
            .field("url", &self.url)
            .field("shard_num", &self.shard_num)
            .field("local_path", &self.local_path)
            .finish_non_exhaustive()
    }
}

/// One element of a stage stream.
#[derive(Debug)]
pub enum Unit {
    Shard(ShardDescriptor),
    Opened(OpenedShard),
    File(MemberFile),
    Sample(Sample),
}

impl Unit {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Shard(_) => "shard",
            Self::Opened(_) => "opened shard",
            Self::File(_) => "member file",
            Self::Sample(_) => "sample",
        }
    }

    fn unexpected(&self, stage: &'static str, expected: &'static str) -> anyhow::Error {
        DatasetError::UnexpectedUnit {
            stage,
            expected,
            found: self.kind(),
        }
        .into()
    }

    /// # Errors
    ///
    /// [`DatasetError::UnexpectedUnit`] for any other variant.
    pub fn into_shard(self, stage: &'static str) -> Result<ShardDescriptor> {
        match self {
            Self::Shard(s) => Ok(s),
            other => Err(other.unexpected(stage, "shard")),
        }
    }

    /// # Errors
    ///
    /// [`DatasetError::UnexpectedUnit`] for any other variant.
    pub fn into_opened(self, stage: &'static str) -> Result<OpenedShard> {
        match self {
            Self::Opened(s) => Ok(s),
            other => Err(other.unexpected(stage, "opened shard")),
        }
    }

    /// # Errors
    ///
    /// [`DatasetError::UnexpectedUnit`] for any other variant.
    pub fn into_file(self, stage: &'static str) -> Result<MemberFile> {
        match self {
            Self::File(f) => Ok(f),
            other => Err(other.unexpected(stage, "member file")),
        }
    }

    /// # Errors
    ///
    /// [`DatasetError::UnexpectedUnit`] for any other variant.
    pub fn into_sample(self, stage: &'static str) -> Result<Sample> {
        match self {
            Self::Sample(s) => Ok(s),
            other => Err(other.unexpected(stage, "sample")),
        }
    }
}

/// A lazy stream of units.
pub type Stream = Box<dyn Iterator<Item = Result<Unit>> + Send>;

/// Stages that behave differently per epoch.
pub trait EpochAware {
    fn set_epoch(&mut self, epoch: i64);
}

/// Stages holding resources that must be released when the dataset closes.
pub trait Closeable {
    fn close(&mut self);
}

/// One step of the pipeline.
///
/// The first stage receives `None`; every later stage receives the stream of
/// its predecessor. Returning `None` is an assembly error. Stages are rebuilt
/// into a fresh chain every epoch, so `apply` must not consume state the next
/// epoch needs.
pub trait Stage: Send {
    fn name(&self) -> &str;

    fn apply(&self, input: Option<Stream>) -> Option<Stream>;

    fn epoch_aware(&mut self) -> Option<&mut dyn EpochAware> {
        None
    }

    fn closeable(&mut self) -> Option<&mut dyn Closeable> {
        None
    }
}

pub type StageFn = Arc<dyn Fn(Option<Stream>) -> Option<Stream> + Send + Sync>;

/// A stateless stage built from a closure.
pub struct FnStage {
    name: String,
    f: StageFn,
}

impl FnStage {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<Stream>) -> Option<Stream> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    /// A stage that maps every sample and passes other units through.
    pub fn map_samples<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Sample) -> Result<Sample> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, move |input: Option<Stream>| -> Option<Stream> {
            let f = Arc::clone(&f);
            let stream = input?.map(move |unit| match unit? {
                Unit::Sample(s) => f(s).map(Unit::Sample),
                other => Ok(other),
            });
            Some(Box::new(stream))
        })
    }
}

impl Stage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        (self.f)(input)
    }
}
