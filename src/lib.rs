//! # Shardflow
//!
//! Streams training data stored as **sharded tar archives** into samples
//! and batches, one epoch at a time, without loading the dataset into
//! memory.
//!
//! ## Key Features
//!
//! - **Any shard source** - literal lists, brace patterns
//!   (`train-{0000..1023}.tar`), local globs and JSON manifests
//! - **Local and remote shards** - files, `pipe:` commands, `http(s)`, `gs:`
//!   and `ais:` URLs, with transparent gzip/zstd/bzip2/xz decompression
//! - **Distributed training** - per-worker shard splits that compose with
//!   repeats and epochs
//! - **Bounded-memory shuffling** - reservoir shuffles at shard and sample
//!   level, optionally seeded per epoch
//! - **Transforms and batching** - fan-out transform chains and pluggable
//!   collation
//! - **Shard cache** - LRU disk cache with access and miss counters
//! - **Error handlers** - skip or abort on broken shards and samples
//!
//! ## Quick Start
//!
//! ```no_run
//! use shardflow::{Dataset, DatasetConfig, map, warn_and_continue};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = DatasetConfig::builder("/data/imagenet-train-{000000..000146}.tar")
//!     .shuffle_size(2000)
//!     .handler(warn_and_continue())
//!     .transform(map(|mut s| {
//!         s.remove(".cls");
//!         Ok(s)
//!     }))
//!     .batch_size(32)
//!     .build()?;
//!
//! let mut dataset = Dataset::new(config)?;
//! for batch in dataset.iter()? {
//!     let batch = batch?;
//!     println!("{:?}", batch.get("__key__"));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## The Pipeline
//!
//! Every call to [`Dataset::iter`] starts a new epoch and rebuilds a lazy
//! chain of fourteen stages (see [`stages`]): list, split, repeat and
//! shuffle shards; open them; expand tar members; group members into
//! samples; shuffle, transform, truncate and batch the samples. Only the
//! shard list, the cache and the debug logs outlive an epoch.
//!
//! ## Samples
//!
//! Members `img01.jpg` and `img01.cls` of one shard become a single
//! [`Sample`] with fields `.jpg` and `.cls`, plus `__key__`, `__url__`,
//! `__epoch__` and a zero-based `__count__`.
//!
//! ## Errors
//!
//! Construction fails fast on configuration problems. Faults while reading
//! (a shard that cannot be opened, a corrupt archive, a duplicate member, a
//! failing transform) go through the configured [`Handler`], which decides
//! whether to skip the item or end the epoch with the error. Typed causes
//! are available through `err.downcast_ref::<DatasetError>()`.

pub mod batch;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod error;
pub mod handlers;
pub mod io;
pub mod log;
pub mod pipeline;
pub mod runner;
pub mod sample;
pub mod shardlist;
pub mod shuffle;
pub mod split;
pub mod stage;
pub mod stages;
pub mod testing;
pub mod transform;

pub use batch::{Batched, CollationFn, default_collation, default_collation_fn};
pub use cache::{CacheStats, FileCache, ShardCache};
pub use config::{CacheOptions, DatasetConfig, DatasetConfigBuilder, LocalnameFn, ShardSource};
pub use dataset::{Dataset, Epoch};
pub use error::DatasetError;
pub use handlers::{Handler, ignore_and_continue, reraise_exception, warn_and_continue};
pub use log::LogDest;
pub use pipeline::Pipeline;
pub use runner::{run_pipeline, set_pipeline_epochs};
pub use sample::{Field, Sample};
pub use shardlist::{ShardDescriptor, braceexpand};
pub use split::{ShardSplitFn, WorkerInfo, split_by_node, split_by_worker};
pub use stage::{Closeable, EpochAware, FnStage, OpenedShard, Stage, Stream, Unit};
pub use transform::{Expand, FileFn, Transform, expand, filter, map, map_files};
