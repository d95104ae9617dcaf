//! Reservoir-buffer shuffle.
//!
//! Keeps at most `bufsize` items in memory. Nothing is emitted until `initial`
//! items have been buffered; after that, every pull refills the buffer from
//! upstream and emits a uniformly chosen occupant. The result is only
//! approximately shuffled: an item can move at most as far as the buffer
//! allows.
//!
//! Errors from upstream are emitted immediately and never buffered.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Per-stage salts so shard and sample shuffles draw different streams.
pub const SHARD_SALT: u64 = 0x5348_4152_4453;
pub const SAMPLE_SALT: u64 = 0x5341_4d50_4c45;

// SplitMix64 finalizer.
const fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// RNG for one shuffle stage in one epoch.
///
/// With a seed, the stream depends only on `(seed, epoch, salt)`, so every
/// run of the same epoch reorders identically while consecutive epochs
/// differ. Without a seed the RNG comes from OS entropy.
#[must_use]
pub fn epoch_rng(seed: Option<u64>, epoch: i64, salt: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(mix(mix(seed ^ salt) ^ epoch as u64)),
        None => StdRng::from_entropy(),
    }
}

pub struct Shuffle<I, T> {
    source: I,
    buf: Vec<T>,
    bufsize: usize,
    initial: usize,
    rng: StdRng,
    started: bool,
    exhausted: bool,
}

impl<I, T> Shuffle<I, T>
where
    I: Iterator<Item = Result<T>>,
{
    /// `initial` is clamped to `1..=bufsize`.
    pub fn new(source: I, bufsize: usize, initial: usize, rng: StdRng) -> Self {
        let bufsize = bufsize.max(1);
        Self {
            source,
            buf: Vec::with_capacity(bufsize.min(4096)),
            bufsize,
            initial: initial.clamp(1, bufsize),
            rng,
            started: false,
            exhausted: false,
        }
    }
}

impl<I, T> Iterator for Shuffle<I, T>
where
    I: Iterator<Item = Result<T>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let target = if self.started { self.bufsize } else { self.initial };
        while !self.exhausted && self.buf.len() < target {
            match self.source.next() {
                Some(Ok(item)) => self.buf.push(item),
                Some(Err(e)) => return Some(Err(e)),
                None => self.exhausted = true,
            }
        }
        self.started = true;
        if self.buf.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..self.buf.len());
        Some(Ok(self.buf.swap_remove(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn shuffled(n: u32, bufsize: usize, initial: usize, seed: u64) -> Vec<u32> {
        let rng = epoch_rng(Some(seed), 0, SAMPLE_SALT);
        Shuffle::new((0..n).map(Ok), bufsize, initial, rng)
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn output_is_a_permutation() {
        let mut out = shuffled(200, 50, 10, 1);
        assert_ne!(out, (0..200).collect::<Vec<_>>());
        out.sort_unstable();
        assert_eq!(out, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn buffer_of_one_keeps_order() {
        assert_eq!(shuffled(20, 1, 1, 9), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn seed_epoch_and_salt_all_matter() {
        let draw = |rng: &mut StdRng| rng.r#gen::<u64>();
        let base = draw(&mut epoch_rng(Some(5), 0, SHARD_SALT));
        assert_eq!(base, draw(&mut epoch_rng(Some(5), 0, SHARD_SALT)));
        assert_ne!(base, draw(&mut epoch_rng(Some(5), 1, SHARD_SALT)));
        assert_ne!(base, draw(&mut epoch_rng(Some(6), 0, SHARD_SALT)));
        assert_ne!(base, draw(&mut epoch_rng(Some(5), 0, SAMPLE_SALT)));
    }

    #[test]
    fn errors_are_not_buffered() {
        let source = vec![Ok(1), Ok(2), Err(anyhow!("boom")), Ok(3)];
        let rng = epoch_rng(Some(0), 0, SAMPLE_SALT);
        let mut it = Shuffle::new(source.into_iter(), 10, 10, rng);
        assert!(it.next().unwrap().is_err());
        assert_eq!(it.filter_map(Result::ok).count(), 3);
    }
}
