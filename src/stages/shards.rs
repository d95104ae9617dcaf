//! Shard-level stages: listing, splitting, repeating, shuffling, opening.

use crate::cache::ShardCache;
use crate::config::active_size;
use crate::handlers::{Handler, route};
use crate::io::compression::auto_detect_reader;
use crate::io::gopen::open_url;
use crate::shardlist::ShardDescriptor;
use crate::shuffle::{SHARD_SALT, Shuffle, epoch_rng};
use crate::split::{ShardIter, ShardSplitFn};
use crate::stage::{EpochAware, OpenedShard, Stage, Stream, Unit};
use anyhow::{Context, Error, Result};
use std::iter;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

fn shards_of(input: Stream, stage: &'static str) -> impl Iterator<Item = Result<ShardDescriptor>> + Send {
    input.map(move |unit| unit.and_then(|u| u.into_shard(stage)))
}

/// Emits the resolved shard list in order.
pub struct IterateShards {
    shards: Arc<[ShardDescriptor]>,
}

impl IterateShards {
    #[must_use]
    pub const fn new(shards: Arc<[ShardDescriptor]>) -> Self {
        Self { shards }
    }
}

impl Stage for IterateShards {
    fn name(&self) -> &str {
        "iterate_shards"
    }

    fn apply(&self, _input: Option<Stream>) -> Option<Stream> {
        let shards = Arc::clone(&self.shards);
        Some(Box::new(
            (0..shards.len()).map(move |i| Ok(Unit::Shard(shards[i].clone()))),
        ))
    }
}

/// Hands the shard sequence to the configured split function.
pub struct SplitShards {
    split_fn: Option<ShardSplitFn>,
    epoch: i64,
}

impl SplitShards {
    #[must_use]
    pub const fn new(split_fn: Option<ShardSplitFn>) -> Self {
        Self { split_fn, epoch: -1 }
    }
}

impl EpochAware for SplitShards {
    fn set_epoch(&mut self, epoch: i64) {
        self.epoch = epoch;
    }
}

impl Stage for SplitShards {
    fn name(&self) -> &str {
        "split_shards"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        let input = input?;
        let Some(split) = &self.split_fn else {
            return Some(input);
        };
        // The split function sees plain descriptors; a stream error stops its
        // input and is re-emitted after whatever it produced.
        let fault: Arc<Mutex<Option<Error>>> = Arc::default();
        let slot = Arc::clone(&fault);
        let plain: ShardIter = Box::new(shards_of(input, "split_shards").map_while(move |s| {
            s.map_err(|e| {
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
            })
            .ok()
        }));
        let mine = split(plain, self.epoch).map(|s| Ok(Unit::Shard(s)));
        let trailing = iter::from_fn(move || {
            fault
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .map(Err)
        });
        Some(Box::new(mine.chain(trailing)))
    }

    fn epoch_aware(&mut self) -> Option<&mut dyn EpochAware> {
        Some(self)
    }
}

/// Replays this consumer's shard sequence `repeats` times.
pub struct RepeatShards {
    repeats: usize,
}

impl RepeatShards {
    #[must_use]
    pub fn new(repeats: usize) -> Self {
        Self {
            repeats: repeats.max(1),
        }
    }
}

struct Repeat {
    input: Option<Stream>,
    shards: Vec<ShardDescriptor>,
    repeats: usize,
    pass: usize,
    pos: usize,
}

impl Iterator for Repeat {
    type Item = Result<Unit>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(mut input) = self.input.take() {
            while let Some(unit) = input.next() {
                match unit.and_then(|u| u.into_shard("repeat_shards")) {
                    Ok(shard) => self.shards.push(shard),
                    Err(e) => {
                        self.input = Some(input);
                        return Some(Err(e));
                    }
                }
            }
        }
        while self.pass < self.repeats {
            if let Some(shard) = self.shards.get(self.pos) {
                self.pos += 1;
                return Some(Ok(Unit::Shard(shard.clone())));
            }
            self.pass += 1;
            self.pos = 0;
        }
        None
    }
}

impl Stage for RepeatShards {
    fn name(&self) -> &str {
        "repeat_shards"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        if self.repeats == 1 {
            return input;
        }
        Some(Box::new(Repeat {
            input: Some(input?),
            shards: Vec::new(),
            repeats: self.repeats,
            pass: 0,
            pos: 0,
        }))
    }
}

/// Reservoir shuffle of shards; buffer and initial fill are both the
/// configured size.
pub struct ShuffleShards {
    size: Option<usize>,
    seed: Option<u64>,
    epoch: i64,
}

impl ShuffleShards {
    #[must_use]
    pub const fn new(size: Option<usize>, seed: Option<u64>) -> Self {
        Self {
            size,
            seed,
            epoch: -1,
        }
    }
}

impl EpochAware for ShuffleShards {
    fn set_epoch(&mut self, epoch: i64) {
        self.epoch = epoch;
    }
}

impl Stage for ShuffleShards {
    fn name(&self) -> &str {
        "shuffle_shards"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        let input = input?;
        let Some(n) = active_size(self.size) else {
            return Some(input);
        };
        let rng = epoch_rng(self.seed, self.epoch, SHARD_SALT);
        Some(Box::new(Shuffle::new(input, n, n, rng)))
    }

    fn epoch_aware(&mut self) -> Option<&mut dyn EpochAware> {
        Some(self)
    }
}

/// Opens each shard directly or through the cache, then strips any
/// compression layer. Open failures go through the handler.
pub struct OpenShards {
    cache: Option<Arc<dyn ShardCache>>,
    handler: Handler,
}

impl OpenShards {
    #[must_use]
    pub fn new(cache: Option<Arc<dyn ShardCache>>, handler: Handler) -> Self {
        Self { cache, handler }
    }
}

fn open_shard(cache: Option<&dyn ShardCache>, shard: &ShardDescriptor) -> Result<OpenedShard> {
    let opened = match cache {
        Some(cache) => cache.open(shard)?,
        None => {
            debug!(url = %shard.url, shard_num = shard.shard_num, "opening shard");
            OpenedShard {
                url: shard.url.clone(),
                shard_num: shard.shard_num,
                stream: open_url(&shard.url)?,
                local_path: None,
            }
        }
    };
    let stream = auto_detect_reader(opened.stream, &opened.url)
        .with_context(|| format!("decompress {}", opened.url))?;
    Ok(OpenedShard { stream, ..opened })
}

impl Stage for OpenShards {
    fn name(&self) -> &str {
        "open_shards"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        let cache = self.cache.clone();
        let handler = self.handler.clone();
        let opened = shards_of(input?, "open_shards").filter_map(move |shard| {
            let shard = match shard {
                Ok(s) => s,
                Err(e) => return Some(Err(e)),
            };
            match open_shard(cache.as_deref(), &shard) {
                Ok(o) => Some(Ok(Unit::Opened(o))),
                Err(e) => route(&handler, e.context(format!("open shard {}", shard.url))).map(Err),
            }
        });
        Some(Box::new(opened))
    }
}
