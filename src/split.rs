//! Shard splitting across nodes and workers.
//!
//! The pipeline imposes no policy; it hands the full shard sequence and the
//! current epoch to a [`ShardSplitFn`] and keeps whatever comes back. The
//! helpers here implement the usual modulo split.

use crate::error::DatasetError;
use crate::shardlist::ShardDescriptor;
use anyhow::{Context, Result, bail};
use std::sync::Arc;

pub type ShardIter = Box<dyn Iterator<Item = ShardDescriptor> + Send>;

pub type ShardSplitFn = Arc<dyn Fn(ShardIter, i64) -> ShardIter + Send + Sync>;

/// Keep every shard whose position in the original list is `rank` modulo
/// `world`.
///
/// # Errors
///
/// Returns [`DatasetError::Config`] for an empty world or a rank outside it.
pub fn split_by_rank(rank: usize, world: usize) -> Result<ShardSplitFn> {
    if rank >= world {
        let reason = format!("rank {rank} is outside a world of {world}");
        return Err(DatasetError::Config(reason).into());
    }
    Ok(Arc::new(move |shards: ShardIter, _epoch: i64| -> ShardIter {
        Box::new(shards.filter(move |s| s.shard_num % world == rank))
    }))
}

/// Split by worker within one node.
///
/// # Errors
///
/// Fails when `worker >= num_workers`.
pub fn split_by_worker(worker: usize, num_workers: usize) -> Result<ShardSplitFn> {
    split_by_rank(worker, num_workers)
}

/// Split by node, then by worker within the node.
///
/// # Errors
///
/// Fails when `info` does not validate.
pub fn split_by_node(info: WorkerInfo) -> Result<ShardSplitFn> {
    info.validate()?;
    split_by_rank(info.global_rank(), info.global_world())
}

/// Position of this consumer among all consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    pub rank: usize,
    pub world_size: usize,
    pub worker: usize,
    pub num_workers: usize,
}

impl Default for WorkerInfo {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            worker: 0,
            num_workers: 1,
        }
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name}={v:?} is not a non-negative integer")),
        Err(_) => Ok(None),
    }
}

impl WorkerInfo {
    /// Read `RANK`, `WORLD_SIZE`, `WORKER` and `NUM_WORKERS`; missing
    /// variables keep their single-process defaults.
    ///
    /// # Errors
    ///
    /// Fails on unparsable values or a rank outside its world.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let info = Self {
            rank: env_usize("RANK")?.unwrap_or(d.rank),
            world_size: env_usize("WORLD_SIZE")?.unwrap_or(d.world_size),
            worker: env_usize("WORKER")?.unwrap_or(d.worker),
            num_workers: env_usize("NUM_WORKERS")?.unwrap_or(d.num_workers),
        };
        info.validate()?;
        Ok(info)
    }

    /// # Errors
    ///
    /// Fails when a world is empty or a rank falls outside it.
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 || self.num_workers == 0 {
            bail!("world size and worker count must be at least 1: {self:?}");
        }
        if self.rank >= self.world_size || self.worker >= self.num_workers {
            bail!("rank out of range: {self:?}");
        }
        Ok(())
    }

    #[must_use]
    pub const fn global_rank(&self) -> usize {
        self.rank * self.num_workers + self.worker
    }

    #[must_use]
    pub const fn global_world(&self) -> usize {
        self.world_size * self.num_workers
    }
}
