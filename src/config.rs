//! Dataset configuration.
//!
//! [`DatasetConfig`] is a plain value. Override fields with struct-update
//! syntax or through the fluent builder:
//!
//! ```
//! use shardflow::DatasetConfig;
//!
//! let base = DatasetConfig::builder("data/train-{000..009}.tar")
//!     .shuffle_size(1000)
//!     .build()?;
//! let eval = base.to_builder().shuffle_size(None).batch_size(32).build()?;
//! assert_eq!(eval.batch_size, Some(32));
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::batch::{CollationFn, default_collation_fn};
use crate::error::DatasetError;
use crate::handlers::{Handler, reraise_exception};
use crate::log::LogDest;
use crate::split::ShardSplitFn;
use crate::transform::{FileFn, Transform};
use anyhow::Result;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Where the shard list comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShardSource {
    List(Vec<String>),
    /// Brace pattern such as `shard-{000..099}.tar`; local entries may also
    /// contain glob metacharacters.
    Pattern(String),
    /// Path or URL of a JSON manifest.
    Manifest(String),
}

impl Default for ShardSource {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl fmt::Display for ShardSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List(urls) => write!(f, "list of {} urls", urls.len()),
            Self::Pattern(p) => write!(f, "pattern {p:?}"),
            Self::Manifest(m) => write!(f, "manifest {m:?}"),
        }
    }
}

impl From<&str> for ShardSource {
    fn from(value: &str) -> Self {
        if value.ends_with(".json") {
            Self::Manifest(value.to_string())
        } else {
            Self::Pattern(value.to_string())
        }
    }
}

impl From<String> for ShardSource {
    fn from(value: String) -> Self {
        value.as_str().into()
    }
}

impl From<Vec<String>> for ShardSource {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<&str>> for ShardSource {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ShardSource {
    fn from(value: [&str; N]) -> Self {
        Self::List(value.iter().map(|s| (*s).to_string()).collect())
    }
}

/// Maps a shard URL to its file in the cache directory. Relative results
/// are taken relative to `cache_dir`.
pub type LocalnameFn = Arc<dyn Fn(&str) -> PathBuf + Send + Sync>;

#[derive(Clone)]
pub struct CacheOptions {
    /// No cache unless set.
    pub cache_dir: Option<PathBuf>,
    /// Byte budget for cached shards.
    pub cache_size: u64,
    /// Maximum number of cached shard files.
    pub lru_size: usize,
    /// Leave cached files on disk when the dataset closes.
    pub keep_downloaded: bool,
    pub localname_fn: Option<LocalnameFn>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_dir: None,
            cache_size: 1_000_000_000_000,
            lru_size: 10,
            keep_downloaded: false,
            localname_fn: None,
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("cache_dir", &self.cache_dir)
            .field("cache_size", &self.cache_size)
            .field("lru_size", &self.lru_size)
            .field("keep_downloaded", &self.keep_downloaded)
            .field("localname_fn", &self.localname_fn.is_some())
            .finish()
    }
}

/// Every option of one dataset instance.
#[derive(Clone)]
pub struct DatasetConfig {
    pub shards: ShardSource,
    /// Applied in order to every sample.
    pub transformations: Vec<Transform>,
    pub handler: Handler,
    pub file_fn: Option<FileFn>,
    pub shard_split_fn: Option<ShardSplitFn>,
    /// Passes over this consumer's shards per epoch; at least 1.
    pub repeats: usize,
    /// `None` or `Some(0)` disables the shard shuffle.
    pub shard_shuffle_size: Option<usize>,
    /// `None` or `Some(0)` disables the sample shuffle.
    pub shuffle_size: Option<usize>,
    /// Fixed seed for both shuffles; entropy when unset.
    pub seed: Option<u64>,
    /// `None` disables batching; `Some(0)` fails validation.
    pub batch_size: Option<usize>,
    /// Emit a short final batch.
    pub batch_partial: bool,
    pub collation_fn: CollationFn,
    pub cache: CacheOptions,
    /// Truncate each epoch to this many samples (after transforms).
    /// `Some(0)` yields empty epochs.
    pub force_size: Option<usize>,
    /// Base for relative manifest entries.
    pub base_url: Option<String>,
    /// Fail the epoch if it yields nothing.
    pub check_empty: bool,
    pub log_shards: LogDest,
    pub log_keys: LogDest,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            shards: ShardSource::default(),
            transformations: Vec::new(),
            handler: reraise_exception(),
            file_fn: None,
            shard_split_fn: None,
            repeats: 1,
            shard_shuffle_size: Some(10_000),
            shuffle_size: None,
            seed: None,
            batch_size: None,
            batch_partial: true,
            collation_fn: default_collation_fn(),
            cache: CacheOptions::default(),
            force_size: None,
            base_url: None,
            check_empty: false,
            log_shards: LogDest::Disabled,
            log_keys: LogDest::Disabled,
        }
    }
}

impl fmt::Debug for DatasetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetConfig")
            .field("shards", &self.shards)
            .field("transformations", &self.transformations.len())
            .field("file_fn", &self.file_fn.is_some())
            .field("shard_split_fn", &self.shard_split_fn.is_some())
            .field("repeats", &self.repeats)
            .field("shard_shuffle_size", &self.shard_shuffle_size)
            .field("shuffle_size", &self.shuffle_size)
            .field("seed", &self.seed)
            .field("batch_size", &self.batch_size)
            .field("batch_partial", &self.batch_partial)
            .field("cache", &self.cache)
            .field("force_size", &self.force_size)
            .field("base_url", &self.base_url)
            .field("check_empty", &self.check_empty)
            .field("log_shards", &self.log_shards)
            .field("log_keys", &self.log_keys)
            .finish_non_exhaustive()
    }
}

/// A shuffle size that actually shuffles.
pub(crate) fn active_size(size: Option<usize>) -> Option<usize> {
    size.filter(|&n| n > 0)
}

impl DatasetConfig {
    #[must_use]
    pub fn builder(shards: impl Into<ShardSource>) -> DatasetConfigBuilder {
        DatasetConfigBuilder {
            config: Self {
                shards: shards.into(),
                ..Self::default()
            },
        }
    }

    /// Start a builder from a copy of this configuration.
    #[must_use]
    pub fn to_builder(&self) -> DatasetConfigBuilder {
        DatasetConfigBuilder {
            config: self.clone(),
        }
    }

    /// Check the options that do not depend on I/O.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::Config`] for a zero repeat count, batch size,
    /// cache size or LRU size.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| -> Result<()> { Err(DatasetError::Config(msg.to_string()).into()) };
        if self.repeats == 0 {
            return bad("repeats must be at least 1");
        }
        if self.batch_size == Some(0) {
            return bad("batch_size must be at least 1");
        }
        if let ShardSource::List(urls) = &self.shards
            && urls.iter().any(String::is_empty)
        {
            return bad("shard list contains an empty url");
        }
        if self.cache.cache_dir.is_some() {
            if self.cache.cache_size == 0 {
                return bad("cache_size must be positive");
            }
            if self.cache.lru_size == 0 {
                return bad("lru_size must be at least 1");
            }
        }
        Ok(())
    }
}

/// Fluent construction of a [`DatasetConfig`].
#[derive(Clone, Debug)]
pub struct DatasetConfigBuilder {
    config: DatasetConfig,
}

impl DatasetConfigBuilder {
    #[must_use]
    pub fn shards(mut self, shards: impl Into<ShardSource>) -> Self {
        self.config.shards = shards.into();
        self
    }

    /// Append one transform to the chain.
    #[must_use]
    pub fn transform(mut self, t: Transform) -> Self {
        self.config.transformations.push(t);
        self
    }

    /// Replace the whole transform chain.
    #[must_use]
    pub fn transformations(mut self, ts: Vec<Transform>) -> Self {
        self.config.transformations = ts;
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: Handler) -> Self {
        self.config.handler = handler;
        self
    }

    #[must_use]
    pub fn file_fn(mut self, f: FileFn) -> Self {
        self.config.file_fn = Some(f);
        self
    }

    #[must_use]
    pub fn shard_split_fn(mut self, f: ShardSplitFn) -> Self {
        self.config.shard_split_fn = Some(f);
        self
    }

    #[must_use]
    pub fn repeats(mut self, n: usize) -> Self {
        self.config.repeats = n;
        self
    }

    #[must_use]
    pub fn shard_shuffle_size(mut self, n: impl Into<Option<usize>>) -> Self {
        self.config.shard_shuffle_size = n.into();
        self
    }

    #[must_use]
    pub fn shuffle_size(mut self, n: impl Into<Option<usize>>) -> Self {
        self.config.shuffle_size = n.into();
        self
    }

    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn batch_size(mut self, n: impl Into<Option<usize>>) -> Self {
        self.config.batch_size = n.into();
        self
    }

    #[must_use]
    pub fn batch_partial(mut self, partial: bool) -> Self {
        self.config.batch_partial = partial;
        self
    }

    #[must_use]
    pub fn collation_fn(mut self, f: CollationFn) -> Self {
        self.config.collation_fn = f;
        self
    }

    #[must_use]
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache.cache_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn cache_size(mut self, bytes: u64) -> Self {
        self.config.cache.cache_size = bytes;
        self
    }

    #[must_use]
    pub fn lru_size(mut self, n: usize) -> Self {
        self.config.cache.lru_size = n;
        self
    }

    #[must_use]
    pub fn keep_downloaded(mut self, keep: bool) -> Self {
        self.config.cache.keep_downloaded = keep;
        self
    }

    #[must_use]
    pub fn localname_fn(mut self, f: LocalnameFn) -> Self {
        self.config.cache.localname_fn = Some(f);
        self
    }

    #[must_use]
    pub fn force_size(mut self, n: impl Into<Option<usize>>) -> Self {
        self.config.force_size = n.into();
        self
    }

    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn check_empty(mut self, check: bool) -> Self {
        self.config.check_empty = check;
        self
    }

    #[must_use]
    pub fn log_shards(mut self, dest: impl Into<LogDest>) -> Self {
        self.config.log_shards = dest.into();
        self
    }

    #[must_use]
    pub fn log_keys(mut self, dest: impl Into<LogDest>) -> Self {
        self.config.log_keys = dest.into();
        self
    }

    /// # Errors
    ///
    /// See [`DatasetConfig::validate`].
    pub fn build(self) -> Result<DatasetConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
