//! Local shard cache.
//!
//! [`FileCache`] copies every shard it is asked for into `cache_dir` on first
//! access and serves later accesses from the local copy. Once the cached
//! bytes exceed `cache_size` or the number of files exceeds `lru_size`, the
//! least recently used copies are deleted. The file that was just fetched is
//! never evicted, so a single shard larger than the budget still works.
//!
//! Downloads land in a temporary file next to their final name and are
//! renamed into place when complete; a crashed download never looks like a
//! cached shard.

use crate::config::{CacheOptions, LocalnameFn};
use crate::error::DatasetError;
use crate::io::gopen::open_url;
use crate::shardlist::ShardDescriptor;
use crate::stage::OpenedShard;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use tracing::{debug, warn};

const PARTIAL_SUFFIX: &str = ".partial";

/// Running access and miss counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub accesses: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of accesses that had to fetch; 0 before any access.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn miss_rate(&self) -> f64 {
        if self.accesses == 0 {
            0.0
        } else {
            self.misses as f64 / self.accesses as f64
        }
    }
}

/// Something that can stand in for the direct shard opener.
pub trait ShardCache: Send + Sync {
    /// Open `shard`, fetching it first if it is not cached.
    ///
    /// # Errors
    ///
    /// Fails when the shard cannot be fetched or the cached copy opened.
    fn open(&self, shard: &ShardDescriptor) -> Result<OpenedShard>;

    /// Current counters. Must not block on an in-flight fetch.
    fn stats(&self) -> CacheStats;

    /// Drop cached data.
    ///
    /// # Errors
    ///
    /// Fails when cached files cannot be removed.
    fn clear(&self) -> Result<()>;
}

/// Default cache file name: a hash prefix of the URL plus its base name.
#[must_use]
pub fn default_localname(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let prefix: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    let base = url
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default()
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    if base.is_empty() {
        prefix
    } else {
        format!("{prefix}-{base}")
    }
}

#[derive(Debug)]
struct Entry {
    size: u64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct LruState {
    entries: HashMap<PathBuf, Entry>,
    total_bytes: u64,
    tick: u64,
}

impl LruState {
    fn touch(&mut self, path: &Path, size: u64) {
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(path) {
            Some(e) => {
                self.total_bytes = self.total_bytes - e.size + size;
                e.size = size;
                e.last_used = tick;
            }
            None => {
                self.total_bytes += size;
                self.entries.insert(
                    path.to_path_buf(),
                    Entry {
                        size,
                        last_used: tick,
                    },
                );
            }
        }
    }

    fn forget(&mut self, path: &Path) {
        if let Some(e) = self.entries.remove(path) {
            self.total_bytes -= e.size;
        }
    }

    fn oldest_except(&self, keep: &Path) -> Option<PathBuf> {
        self.entries
            .iter()
            .filter(|(p, _)| p.as_path() != keep)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(p, _)| p.clone())
    }
}

/// Disk-backed LRU cache of shard files.
pub struct FileCache {
    dir: PathBuf,
    cache_size: u64,
    lru_size: usize,
    keep_downloaded: bool,
    localname_fn: Option<LocalnameFn>,
    accesses: AtomicU64,
    misses: AtomicU64,
    state: Mutex<LruState>,
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("dir", &self.dir)
            .field("cache_size", &self.cache_size)
            .field("lru_size", &self.lru_size)
            .field("keep_downloaded", &self.keep_downloaded)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl FileCache {
    /// Create the cache directory if needed and index the shards already in
    /// it, oldest first.
    ///
    /// # Errors
    ///
    /// Fails without a `cache_dir` or when the directory cannot be created or
    /// listed.
    pub fn new(options: &CacheOptions) -> Result<Self> {
        let Some(dir) = options.cache_dir.clone() else {
            return Err(DatasetError::Config("a file cache needs cache_dir".into()).into());
        };
        fs::create_dir_all(&dir).with_context(|| format!("create cache dir {}", dir.display()))?;

        let mut found = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let path = entry.path();
            if path.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                let _ = fs::remove_file(&path);
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, path, meta.len()));
        }
        found.sort();

        let mut state = LruState::default();
        for (_, path, size) in found {
            state.touch(&path, size);
        }
        debug!(dir = %dir.display(), files = state.entries.len(), bytes = state.total_bytes, "indexed cache");

        Ok(Self {
            dir,
            cache_size: options.cache_size,
            lru_size: options.lru_size.max(1),
            keep_downloaded: options.keep_downloaded,
            localname_fn: options.localname_fn.clone(),
            accesses: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where `url` is (or would be) cached.
    #[must_use]
    pub fn local_path(&self, url: &str) -> PathBuf {
        let name = match &self.localname_fn {
            Some(f) => f(url),
            None => PathBuf::from(default_localname(url)),
        };
        if name.is_absolute() {
            name
        } else {
            self.dir.join(name)
        }
    }

    /// Number of files and bytes currently tracked.
    #[must_use]
    pub fn usage(&self) -> (usize, u64) {
        let state = self.lock();
        (state.entries.len(), state.total_bytes)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut tmp_name = dest.as_os_str().to_owned();
        tmp_name.push(format!(".{}{PARTIAL_SUFFIX}", std::process::id()));
        let tmp = PathBuf::from(tmp_name);

        let copied = (|| -> Result<u64> {
            let mut src = open_url(url)?;
            let mut out = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            let n = io::copy(&mut src, &mut out).with_context(|| format!("download {url}"))?;
            out.sync_all()?;
            Ok(n)
        })();
        match copied {
            Ok(n) => {
                fs::rename(&tmp, dest)
                    .with_context(|| format!("move {} into place", tmp.display()))?;
                debug!(%url, path = %dest.display(), bytes = n, "fetched shard");
                Ok(n)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn evict(&self, keep: &Path) {
        let mut state = self.lock();
        while state.total_bytes > self.cache_size || state.entries.len() > self.lru_size {
            let Some(victim) = state.oldest_except(keep) else {
                break;
            };
            match fs::remove_file(&victim) {
                Ok(()) => debug!(path = %victim.display(), "evicted cached shard"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %victim.display(), %e, "cannot evict cached shard"),
            }
            state.forget(&victim);
        }
    }
}

impl ShardCache for FileCache {
    fn open(&self, shard: &ShardDescriptor) -> Result<OpenedShard> {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        let path = self.local_path(&shard.url);

        let size = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.fetch(&shard.url, &path)?
            }
        };
        self.lock().touch(&path, size);
        self.evict(&path);

        let file = File::open(&path).with_context(|| format!("open cached {}", path.display()))?;
        Ok(OpenedShard {
            url: shard.url.clone(),
            shard_num: shard.shard_num,
            stream: Box::new(file),
            local_path: Some(path),
        })
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            accesses: self.accesses.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.lock();
        if self.keep_downloaded {
            debug!(files = state.entries.len(), "keeping downloaded shards");
            state.entries.clear();
            state.total_bytes = 0;
            return Ok(());
        }
        let paths: Vec<PathBuf> = state.entries.keys().cloned().collect();
        let mut first_err = None;
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), %e, "cannot remove cached shard");
                    first_err.get_or_insert(
                        anyhow::Error::new(e).context(format!("remove {}", path.display())),
                    );
                }
            }
            state.forget(&path);
        }
        debug!(dir = %self.dir.display(), "cleared cache");
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn localname_is_hash_prefix_and_basename() {
        let name = default_localname("gs://bucket/train/shard-000017.tar");
        let (prefix, base) = name.split_once('-').unwrap();
        assert_eq!(prefix.len(), 16);
        assert!(prefix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(base, "shard-000017.tar");
        assert_ne!(name, default_localname("gs://other/train/shard-000017.tar"));
    }

    #[test]
    fn startup_indexes_files_and_drops_partials() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.tar"), [0u8; 10]).unwrap();
        fs::write(dir.path().join("b.tar"), [0u8; 5]).unwrap();
        fs::write(dir.path().join("c.tar.123.partial"), [0u8; 7]).unwrap();

        let options = CacheOptions {
            cache_dir: Some(dir.path().to_path_buf()),
            ..CacheOptions::default()
        };
        let cache = FileCache::new(&options).unwrap();
        assert_eq!(cache.usage(), (2, 15));
        assert!(!dir.path().join("c.tar.123.partial").exists());
    }

    #[test]
    fn miss_rate_is_zero_before_any_access() {
        assert!(CacheStats::default().miss_rate().abs() < f64::EPSILON);
        let stats = CacheStats { accesses: 4, misses: 1 };
        assert!((stats.miss_rate() - 0.25).abs() < f64::EPSILON);
    }
}
