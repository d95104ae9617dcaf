//! The dataset object: one resolved shard list, one pipeline, many epochs.

use crate::cache::{CacheStats, FileCache, ShardCache};
use crate::config::DatasetConfig;
use crate::error::DatasetError;
use crate::pipeline::Pipeline;
use crate::sample::Sample;
use crate::shardlist::{ShardDescriptor, resolve};
use crate::stage::{Stage, Stream};
use crate::stages::standard_pipeline;
use anyhow::{Error, Result};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Accesses needed before the miss-rate check says anything.
pub const MISS_CHECK_MIN_ACCESSES: u64 = 100;
/// Miss rate above which the check warns.
pub const MISS_RATE_WARN: f64 = 0.3;

/// A streaming dataset over sharded tar archives.
///
/// ```no_run
/// use shardflow::{Dataset, DatasetConfig};
///
/// let config = DatasetConfig::builder("/data/train-{0000..0127}.tar")
///     .shuffle_size(5000)
///     .batch_size(64)
///     .build()?;
/// let mut dataset = Dataset::new(config)?;
/// for epoch in 0..3 {
///     for batch in dataset.iter()? {
///         let batch = batch?;
///         // train on `batch`
///     }
///     println!("finished epoch {epoch}");
/// }
/// dataset.close()?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Dataset {
    config: DatasetConfig,
    shards: Arc<[ShardDescriptor]>,
    name: Option<String>,
    pipeline: Pipeline,
    cache: Option<Arc<dyn ShardCache>>,
    epoch: i64,
    total_size: i64,
    closed: bool,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .field("stages", &self.pipeline.len())
            .field("epoch", &self.epoch)
            .field("total_size", &self.total_size)
            .field("cached", &self.cache.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Dataset {
    /// Resolve the shard list and assemble the pipeline. No stage runs yet.
    ///
    /// A [`FileCache`] is created when `config.cache.cache_dir` is set.
    ///
    /// # Errors
    ///
    /// Fails on invalid options, an unresolvable or empty shard source, or an
    /// unusable cache directory.
    pub fn new(config: DatasetConfig) -> Result<Self> {
        let cache: Option<Arc<dyn ShardCache>> = match config.cache.cache_dir {
            Some(_) => Some(Arc::new(FileCache::new(&config.cache)?)),
            None => None,
        };
        Self::build(config, cache)
    }

    /// Like [`Dataset::new`], but every shard is opened through `cache`.
    ///
    /// # Errors
    ///
    /// Same as [`Dataset::new`], minus cache creation.
    pub fn with_cache(config: DatasetConfig, cache: Arc<dyn ShardCache>) -> Result<Self> {
        Self::build(config, Some(cache))
    }

    fn build(config: DatasetConfig, cache: Option<Arc<dyn ShardCache>>) -> Result<Self> {
        config.validate()?;
        let list = resolve(&config.shards, config.base_url.as_deref())?;
        let shards: Arc<[ShardDescriptor]> = list.shards.into();
        let total_size = list
            .total_size
            .and_then(|n| i64::try_from(n).ok())
            .unwrap_or(-1);
        let pipeline = standard_pipeline(&config, Arc::clone(&shards), cache.clone());
        info!(
            source = %config.shards,
            shards = shards.len(),
            total_size,
            cached = cache.is_some(),
            "dataset ready"
        );
        Ok(Self {
            config,
            shards,
            name: list.name,
            pipeline,
            cache,
            epoch: -1,
            total_size,
            closed: false,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &DatasetConfig {
        &self.config
    }

    /// The resolved shard list, in original order.
    #[must_use]
    pub fn shards(&self) -> &[ShardDescriptor] {
        &self.shards
    }

    /// Manifest name, if the shards came from a manifest that has one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Number of the most recently started epoch; -1 before the first.
    #[must_use]
    pub const fn epoch(&self) -> i64 {
        self.epoch
    }

    /// Stage names in pipeline order.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.pipeline.names()
    }

    /// Append a stage after the batching stage.
    pub fn push_stage(&mut self, stage: impl Stage + 'static) {
        self.pipeline.push(stage);
    }

    /// Approximate number of samples per epoch: `force_size` if set, else
    /// the known total size, else -1.
    #[must_use]
    pub fn size(&self) -> i64 {
        self.config
            .force_size
            .and_then(|n| i64::try_from(n).ok())
            .unwrap_or(self.total_size)
    }

    pub fn set_size(&mut self, n: i64) {
        self.total_size = n;
    }

    /// Cache counters; zeros without a cache.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.cache
            .as_ref()
            .map(|c| c.stats())
            .unwrap_or_default()
    }

    /// Warn when the cache is fetching too often. Returns the miss rate when
    /// the warning fired.
    pub fn check_cache_misses(&self) -> Option<f64> {
        let stats = self.stats();
        let rate = stats.miss_rate();
        if stats.accesses > MISS_CHECK_MIN_ACCESSES && rate > MISS_RATE_WARN {
            warn!(
                accesses = stats.accesses,
                misses = stats.misses,
                "dataset has a cache miss rate of {:.1}%",
                rate * 100.0
            );
            return Some(rate);
        }
        None
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Start the next epoch.
    ///
    /// The returned iterator borrows the dataset, so a new epoch cannot
    /// start while the previous one is still alive.
    ///
    /// # Errors
    ///
    /// [`DatasetError::Closed`] after [`Dataset::close`], or an assembly
    /// error from the pipeline.
    pub fn iter(&mut self) -> Result<Epoch<'_>> {
        if self.closed {
            return Err(DatasetError::Closed.into());
        }
        self.epoch += 1;
        self.pipeline.set_epoch(self.epoch);
        let stream = self.pipeline.run()?;
        debug!(epoch = self.epoch, "starting epoch");
        Ok(Epoch {
            stream: Some(stream),
            pending: None,
            epoch: self.epoch,
            check_empty: self.config.check_empty,
            yielded: 0,
            _dataset: PhantomData,
        })
    }

    /// Close stages from last to first, then clear the cache. Idempotent;
    /// the dataset cannot be iterated afterwards.
    ///
    /// # Errors
    ///
    /// Fails when the cache cannot be cleared.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pipeline.close();
        if let Some(cache) = self.cache.take() {
            cache.clear()?;
        }
        debug!(epochs = self.epoch + 1, "dataset closed");
        Ok(())
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("closing dataset: {err:#}");
        }
    }
}

impl<'a> IntoIterator for &'a mut Dataset {
    type Item = Result<Sample>;
    type IntoIter = Epoch<'a>;

    /// Starts the next epoch; a failure to start is yielded as the only item.
    fn into_iter(self) -> Self::IntoIter {
        let epoch = self.epoch;
        self.iter().unwrap_or_else(|err| Epoch {
            stream: None,
            pending: Some(err),
            epoch,
            check_empty: false,
            yielded: 0,
            _dataset: PhantomData,
        })
    }
}

/// One pass over the dataset.
///
/// Yields samples (or batches) until the pipeline is exhausted or an error
/// is yielded; nothing follows an error.
pub struct Epoch<'a> {
    stream: Option<Stream>,
    pending: Option<Error>,
    epoch: i64,
    check_empty: bool,
    yielded: u64,
    _dataset: PhantomData<&'a mut Dataset>,
}

impl Epoch<'_> {
    #[must_use]
    pub const fn epoch(&self) -> i64 {
        self.epoch
    }

    /// Items yielded so far.
    #[must_use]
    pub const fn yielded(&self) -> u64 {
        self.yielded
    }
}

impl Iterator for Epoch<'_> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending.take() {
            return Some(Err(err));
        }
        let stream = self.stream.as_mut()?;
        let item = match stream.next() {
            Some(item) => item.and_then(|u| u.into_sample("dataset")),
            None => {
                self.stream = None;
                debug!(epoch = self.epoch, items = self.yielded, "epoch finished");
                if self.check_empty && self.yielded == 0 {
                    return Some(Err(DatasetError::EmptyEpoch { epoch: self.epoch }.into()));
                }
                return None;
            }
        };
        match item {
            Ok(sample) => {
                self.yielded += 1;
                Some(Ok(sample))
            }
            Err(err) => {
                self.stream = None;
                Some(Err(err))
            }
        }
    }
}
