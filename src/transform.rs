//! Per-item transforms with fan-out.
//!
//! A transform takes one item and returns an [`Expand`]: either exactly one
//! replacement or an iterator of zero or more. Chains are applied depth-first,
//! so the output of a fan-out keeps the order in which it was produced.

use crate::handlers::{Handler, route};
use crate::io::tar::MemberFile;
use crate::sample::Sample;
use anyhow::Result;
use std::sync::Arc;

/// Result of one transform application.
pub enum Expand<T> {
    Single(T),
    Many(Box<dyn Iterator<Item = T> + Send>),
}

impl<T: Send + 'static> Expand<T> {
    /// Fan out to every element of `items`.
    pub fn many<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::Many(Box::new(items.into_iter()))
    }

    /// Drop the item.
    #[must_use]
    pub fn none() -> Self {
        Self::Many(Box::new(std::iter::empty()))
    }
}

impl<T: Send + 'static> IntoIterator for Expand<T> {
    type Item = T;
    type IntoIter = Box<dyn Iterator<Item = T> + Send>;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            Self::Single(item) => Box::new(std::iter::once(item)),
            Self::Many(items) => items,
        }
    }
}

impl<T> std::fmt::Debug for Expand<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(_) => f.write_str("Expand::Single(..)"),
            Self::Many(_) => f.write_str("Expand::Many(..)"),
        }
    }
}

pub type ExpandFn<T> = Arc<dyn Fn(T) -> Result<Expand<T>> + Send + Sync>;

/// A sample transform.
pub type Transform = ExpandFn<Sample>;

/// A member-file rename/fan-out function.
pub type FileFn = ExpandFn<MemberFile>;

/// Wrap a one-to-one sample function.
pub fn map<F>(f: F) -> Transform
where
    F: Fn(Sample) -> Result<Sample> + Send + Sync + 'static,
{
    Arc::new(move |sample| f(sample).map(Expand::Single))
}

/// Wrap a one-to-many sample function.
pub fn expand<F, I>(f: F) -> Transform
where
    F: Fn(Sample) -> Result<I> + Send + Sync + 'static,
    I: IntoIterator<Item = Sample>,
    I::IntoIter: Send + 'static,
{
    Arc::new(move |sample| f(sample).map(Expand::many))
}

/// Keep only the samples for which `pred` holds.
pub fn filter<F>(pred: F) -> Transform
where
    F: Fn(&Sample) -> bool + Send + Sync + 'static,
{
    Arc::new(move |sample| {
        Ok(if pred(&sample) {
            Expand::Single(sample)
        } else {
            Expand::none()
        })
    })
}

/// Wrap a one-to-one member-file function, such as a rename.
pub fn map_files<F>(f: F) -> FileFn
where
    F: Fn(MemberFile) -> Result<MemberFile> + Send + Sync + 'static,
{
    Arc::new(move |file| f(file).map(Expand::Single))
}

type Pending<T> = (usize, Box<dyn Iterator<Item = T> + Send>);

/// Applies a chain of [`ExpandFn`]s to every item of `source`.
///
/// Failures of a function go through the handler; upstream errors pass
/// through unchanged.
pub struct ExpandStream<I, T> {
    source: I,
    chain: Arc<[ExpandFn<T>]>,
    handler: Handler,
    stack: Vec<Pending<T>>,
}

impl<I, T> ExpandStream<I, T>
where
    I: Iterator<Item = Result<T>>,
{
    pub fn new(source: I, chain: impl Into<Arc<[ExpandFn<T>]>>, handler: Handler) -> Self {
        Self {
            source,
            chain: chain.into(),
            handler,
            stack: Vec::new(),
        }
    }

    /// Push `item` down the chain from `level`. `None` means nothing is ready
    /// yet (the item fanned out or was skipped).
    fn descend(&mut self, mut item: T, mut level: usize) -> Option<Result<T>> {
        loop {
            let Some(f) = self.chain.get(level) else {
                return Some(Ok(item));
            };
            match f(item) {
                Ok(Expand::Single(next)) => {
                    item = next;
                    level += 1;
                }
                Ok(Expand::Many(items)) => {
                    self.stack.push((level + 1, items));
                    return None;
                }
                Err(e) => return route(&self.handler, e).map(Err),
            }
        }
    }
}

impl<I, T> Iterator for ExpandStream<I, T>
where
    I: Iterator<Item = Result<T>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (level, item) = if let Some((level, items)) = self.stack.last_mut() {
                match items.next() {
                    Some(item) => (*level, item),
                    None => {
                        self.stack.pop();
                        continue;
                    }
                }
            } else {
                match self.source.next()? {
                    Ok(item) => (0, item),
                    Err(e) => return Some(Err(e)),
                }
            };
            if let Some(out) = self.descend(item, level) {
                return Some(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{ignore_and_continue, reraise_exception};
    use anyhow::anyhow;

    fn numbered(n: i64) -> Sample {
        Sample::new().with("n", n)
    }

    fn values(out: Vec<Sample>) -> Vec<i64> {
        out.iter().map(|s| s.get("n").and_then(|f| f.as_int()).unwrap()).collect()
    }

    #[test]
    fn chain_fans_out_depth_first() {
        let twice = expand(|s: Sample| {
            let n = s.get("n").and_then(|f| f.as_int()).unwrap_or(0);
            Ok(vec![numbered(n * 10), numbered(n * 10 + 1)])
        });
        let plus_one = map(|s: Sample| {
            let n = s.get("n").and_then(|f| f.as_int()).unwrap_or(0);
            Ok(numbered(n + 1))
        });
        let source = (1..=2).map(|n| Ok(numbered(n)));
        let out: Vec<Sample> = ExpandStream::new(source, vec![twice, plus_one], reraise_exception())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(values(out), vec![11, 12, 21, 22]);
    }

    #[test]
    fn filter_drops_items() {
        let odd = filter(|s| s.get("n").and_then(|f| f.as_int()).unwrap_or(0) % 2 == 1);
        let source = (0..5).map(|n| Ok(numbered(n)));
        let out: Vec<Sample> = ExpandStream::new(source, vec![odd], reraise_exception())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(values(out), vec![1, 3]);
    }

    #[test]
    fn failures_go_through_the_handler() {
        let picky: Transform = Arc::new(|s: Sample| {
            if s.get("n").and_then(|f| f.as_int()) == Some(2) {
                Err(anyhow!("bad sample"))
            } else {
                Ok(Expand::Single(s))
            }
        });
        let source = (0..4).map(|n| Ok(numbered(n)));
        let skipped: Vec<Sample> =
            ExpandStream::new(source.clone(), vec![picky.clone()], ignore_and_continue())
                .collect::<Result<_>>()
                .unwrap();
        assert_eq!(values(skipped), vec![0, 1, 3]);

        let raised: Vec<Result<Sample>> =
            ExpandStream::new(source, vec![picky], reraise_exception()).collect();
        assert_eq!(raised.len(), 4);
        assert!(raised[2].is_err());
    }
}
