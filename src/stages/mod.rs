//! The standard stages, in pipeline order:
//!
//! | # | Stage | Consumes | Produces |
//! |---|---|---|---|
//! | 1 | [`IterateShards`] | nothing | shards |
//! | 2 | [`SplitShards`] | shards | this consumer's shards |
//! | 3 | [`RepeatShards`] | shards | shards, `repeats` times over |
//! | 4 | [`ShuffleShards`] | shards | shards |
//! | 5 | [`OpenShards`] | shards | opened shards |
//! | 6 | [`LogStage`] (shards) | opened shards | opened shards |
//! | 7 | [`IterateTarFiles`] | opened shards | member files |
//! | 8 | [`RenameFiles`] | member files | member files |
//! | 9 | [`GroupSamples`] | member files | samples |
//! | 10 | [`LogStage`] (keys) | samples | samples |
//! | 11 | [`ShuffleSamples`] | samples | samples |
//! | 12 | [`TransformSamples`] | samples | samples |
//! | 13 | [`LimitSize`] | samples | samples |
//! | 14 | [`BatchSamples`] | samples | batches |

mod logging;
mod samples;
mod shards;

pub use logging::LogStage;
pub use samples::{
    BatchSamples, GroupSamples, IterateTarFiles, LimitSize, RenameFiles, ShuffleSamples,
    TransformSamples,
};
pub use shards::{IterateShards, OpenShards, RepeatShards, ShuffleShards, SplitShards};

use crate::cache::ShardCache;
use crate::config::DatasetConfig;
use crate::pipeline::Pipeline;
use crate::sample::Sample;
use crate::shardlist::ShardDescriptor;
use crate::stage::{Stream, Unit};
use anyhow::Result;
use std::sync::Arc;

/// The 14-stage pipeline described by `config`.
pub fn standard_pipeline(
    config: &DatasetConfig,
    shards: Arc<[ShardDescriptor]>,
    cache: Option<Arc<dyn ShardCache>>,
) -> Pipeline {
    Pipeline::new()
        .with(IterateShards::new(shards))
        .with(SplitShards::new(config.shard_split_fn.clone()))
        .with(RepeatShards::new(config.repeats))
        .with(ShuffleShards::new(config.shard_shuffle_size, config.seed))
        .with(OpenShards::new(cache, config.handler.clone()))
        .with(LogStage::shards(config.log_shards.clone()))
        .with(IterateTarFiles::new(config.handler.clone()))
        .with(RenameFiles::new(config.file_fn.clone(), config.handler.clone()))
        .with(GroupSamples::new(config.handler.clone()))
        .with(LogStage::keys(config.log_keys.clone()))
        .with(ShuffleSamples::new(config.shuffle_size, config.seed))
        .with(TransformSamples::new(
            config.transformations.clone(),
            config.handler.clone(),
        ))
        .with(LimitSize::new(config.force_size))
        .with(BatchSamples::new(
            config.batch_size,
            config.batch_partial,
            config.collation_fn.clone(),
            config.handler.clone(),
        ))
}

pub(crate) fn samples_of(
    input: Stream,
    stage: &'static str,
) -> impl Iterator<Item = Result<Sample>> + Send {
    input.map(move |unit| unit.and_then(|u| u.into_sample(stage)))
}

pub(crate) fn from_samples<I>(samples: I) -> Stream
where
    I: Iterator<Item = Result<Sample>> + Send + 'static,
{
    Box::new(samples.map(|s| s.map(Unit::Sample)))
}
