//! Fixtures for tests and examples: shards written into temporary
//! directories.
//!
//! ```
//! use shardflow::testing::{ShardDir, sample_keys};
//! use shardflow::{Dataset, DatasetConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let dir = ShardDir::new()?;
//! let a = dir.write_numbered("a.tar", "a", 3)?;
//! let b = dir.write_numbered("b.tar.gz", "b", 2)?;
//!
//! let config = DatasetConfig::builder(vec![a, b]).shard_shuffle_size(None).build()?;
//! let mut dataset = Dataset::new(config)?;
//! let samples = dataset.iter()?.collect::<anyhow::Result<Vec<_>>>()?;
//! assert_eq!(sample_keys(&samples), ["a0000", "a0001", "a0002", "b0000", "b0001"]);
//! # Ok(())
//! # }
//! ```

use crate::io::compression::auto_detect_writer;
use crate::io::tar::TarWriter;
use crate::sample::{self, Sample};
use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary directory of shards, deleted on drop.
pub struct ShardDir {
    dir: TempDir,
}

impl ShardDir {
    /// # Errors
    ///
    /// Returns an error if the temporary directory cannot be created.
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: TempDir::new().context("create temporary shard directory")?,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write `samples` as a shard called `name` and return its path as a
    /// URL string. A compression suffix (`.gz`, `.zst`, ...) compresses it.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be written or a sample has no key.
    pub fn write(&self, name: &str, samples: &[Sample]) -> Result<String> {
        let path = self.file_path(name);
        write_shard(&path, samples)?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Write `count` samples from [`numbered_samples`].
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be written.
    pub fn write_numbered(&self, name: &str, prefix: &str, count: usize) -> Result<String> {
        self.write(name, &numbered_samples(prefix, count))
    }

    /// Write raw bytes, e.g. a corrupt shard.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be written.
    pub fn write_bytes(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let path = self.file_path(name);
        std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Write a tar shard to `path`, compressed according to its suffix.
///
/// # Errors
///
/// Fails if the file cannot be created or written, or a sample has no key.
pub fn write_shard(path: &Path, samples: &[Sample]) -> Result<usize> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let writer = auto_detect_writer(file, &path.to_string_lossy())?;
    let mut tar = TarWriter::new(writer);
    for s in samples {
        tar.write_sample(s)?;
    }
    let members = tar.members();
    drop(tar.finish()?);
    Ok(members)
}

/// `count` samples keyed `{prefix}0000`, `{prefix}0001`, ..., each with a
/// `txt` field holding the key and a `cls` field holding the index.
#[must_use]
pub fn numbered_samples(prefix: &str, count: usize) -> Vec<Sample> {
    (0..count)
        .map(|i| {
            let key = format!("{prefix}{i:04}");
            Sample::new()
                .with(sample::KEY, key.as_str())
                .with("txt", key.as_str())
                .with("cls", i.to_string())
        })
        .collect()
}

/// Keys of `samples`, in order.
#[must_use]
pub fn sample_keys(samples: &[Sample]) -> Vec<String> {
    samples
        .iter()
        .filter_map(|s| s.key().map(str::to_string))
        .collect()
}
