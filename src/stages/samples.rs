//! Member-file and sample stages.

use super::{from_samples, samples_of};
use crate::batch::{Batched, CollationFn};
use crate::config::active_size;
use crate::handlers::{Handler, route};
use crate::io::tar::{GroupByKeys, MemberFile, TarMembers};
use crate::sample::{self, Sample};
use crate::shuffle::{SAMPLE_SALT, Shuffle, epoch_rng};
use crate::stage::{EpochAware, Stage, Stream, Unit};
use crate::transform::{ExpandFn, ExpandStream, FileFn, Transform};
use anyhow::Result;
use std::iter;
use std::sync::Arc;

/// Initial fill of the sample shuffle buffer.
const SAMPLE_SHUFFLE_INITIAL: usize = 100;

fn files_of(input: Stream, stage: &'static str) -> impl Iterator<Item = Result<MemberFile>> + Send {
    input.map(move |unit| unit.and_then(|u| u.into_file(stage)))
}

/// Expands opened shards into their member files. Archive faults go
/// through the handler; skipping one drops the rest of that shard.
pub struct IterateTarFiles {
    handler: Handler,
}

impl IterateTarFiles {
    #[must_use]
    pub fn new(handler: Handler) -> Self {
        Self { handler }
    }
}

impl Stage for IterateTarFiles {
    fn name(&self) -> &str {
        "iterate_tar_files"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        let handler = self.handler.clone();
        let files = input?.flat_map(move |unit| -> Stream {
            let opened = match unit.and_then(|u| u.into_opened("iterate_tar_files")) {
                Ok(o) => o,
                Err(e) => return Box::new(iter::once(Err(e))),
            };
            let handler = handler.clone();
            let members = TarMembers::new(opened.stream, opened.url, opened.shard_num);
            Box::new(members.filter_map(move |m| match m {
                Ok(file) => Some(Ok(Unit::File(file))),
                Err(e) => route(&handler, e).map(Err),
            }))
        });
        Some(Box::new(files))
    }
}

/// Applies the optional `file_fn` to every member file.
pub struct RenameFiles {
    file_fn: Option<FileFn>,
    handler: Handler,
}

impl RenameFiles {
    #[must_use]
    pub fn new(file_fn: Option<FileFn>, handler: Handler) -> Self {
        Self { file_fn, handler }
    }
}

impl Stage for RenameFiles {
    fn name(&self) -> &str {
        "rename_files"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        let input = input?;
        let Some(f) = &self.file_fn else {
            return Some(input);
        };
        let chain: Vec<ExpandFn<MemberFile>> = vec![Arc::clone(f)];
        let renamed = ExpandStream::new(files_of(input, "rename_files"), chain, self.handler.clone());
        Some(Box::new(renamed.map(|r| r.map(Unit::File))))
    }
}

/// Groups member files into samples, normalizes field names and stamps
/// `__epoch__` and a zero-based `__count__`.
pub struct GroupSamples {
    handler: Handler,
    epoch: i64,
}

impl GroupSamples {
    #[must_use]
    pub fn new(handler: Handler) -> Self {
        Self { handler, epoch: -1 }
    }
}

impl EpochAware for GroupSamples {
    fn set_epoch(&mut self, epoch: i64) {
        self.epoch = epoch;
    }
}

impl Stage for GroupSamples {
    fn name(&self) -> &str {
        "group_by_keys"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        let grouped = GroupByKeys::new(files_of(input?, "group_by_keys"), self.handler.clone());
        let epoch = self.epoch;
        let mut count: i64 = 0;
        let stamped = grouped.map(move |r| {
            r.map(|mut s: Sample| {
                s.fix_dots();
                s.insert(sample::EPOCH, epoch);
                s.insert(sample::COUNT, count);
                count += 1;
                s
            })
        });
        Some(from_samples(stamped))
    }

    fn epoch_aware(&mut self) -> Option<&mut dyn EpochAware> {
        Some(self)
    }
}

/// Reservoir shuffle of samples.
pub struct ShuffleSamples {
    size: Option<usize>,
    seed: Option<u64>,
    epoch: i64,
}

impl ShuffleSamples {
    #[must_use]
    pub const fn new(size: Option<usize>, seed: Option<u64>) -> Self {
        Self {
            size,
            seed,
            epoch: -1,
        }
    }
}

impl EpochAware for ShuffleSamples {
    fn set_epoch(&mut self, epoch: i64) {
        self.epoch = epoch;
    }
}

impl Stage for ShuffleSamples {
    fn name(&self) -> &str {
        "shuffle_samples"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        let input = input?;
        let Some(n) = active_size(self.size) else {
            return Some(input);
        };
        let rng = epoch_rng(self.seed, self.epoch, SAMPLE_SALT);
        let initial = n.min(SAMPLE_SHUFFLE_INITIAL);
        Some(Box::new(Shuffle::new(input, n, initial, rng)))
    }

    fn epoch_aware(&mut self) -> Option<&mut dyn EpochAware> {
        Some(self)
    }
}

/// Runs the transform chain; failures go through the handler.
pub struct TransformSamples {
    chain: Arc<[Transform]>,
    handler: Handler,
}

impl TransformSamples {
    #[must_use]
    pub fn new(transforms: Vec<Transform>, handler: Handler) -> Self {
        Self {
            chain: transforms.into(),
            handler,
        }
    }
}

impl Stage for TransformSamples {
    fn name(&self) -> &str {
        "transform_samples"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        let input = input?;
        if self.chain.is_empty() {
            return Some(input);
        }
        let out = ExpandStream::new(
            samples_of(input, "transform_samples"),
            Arc::clone(&self.chain),
            self.handler.clone(),
        );
        Some(from_samples(out))
    }
}

/// Truncates the epoch to `force_size` samples.
pub struct LimitSize {
    force_size: Option<usize>,
}

impl LimitSize {
    #[must_use]
    pub const fn new(force_size: Option<usize>) -> Self {
        Self { force_size }
    }
}

impl Stage for LimitSize {
    fn name(&self) -> &str {
        "limit_size"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        let input = input?;
        match self.force_size {
            Some(n) => Some(Box::new(input.take(n))),
            None => Some(input),
        }
    }
}

/// Collates consecutive samples into batches. Collation faults go through
/// the handler.
pub struct BatchSamples {
    batch_size: Option<usize>,
    partial: bool,
    collation: CollationFn,
    handler: Handler,
}

impl BatchSamples {
    #[must_use]
    pub fn new(
        batch_size: Option<usize>,
        partial: bool,
        collation: CollationFn,
        handler: Handler,
    ) -> Self {
        Self {
            batch_size,
            partial,
            collation,
            handler,
        }
    }
}

impl Stage for BatchSamples {
    fn name(&self) -> &str {
        "batch_samples"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        let input = input?;
        let Some(size) = self.batch_size else {
            return Some(input);
        };
        let batches = Batched::new(
            samples_of(input, "batch_samples"),
            size,
            self.partial,
            self.collation.clone(),
            self.handler.clone(),
        );
        Some(from_samples(batches))
    }
}
