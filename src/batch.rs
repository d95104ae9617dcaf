//! Batching of consecutive samples.
//!
//! [`Batched`] groups `size` consecutive samples and hands each group to a
//! [`CollationFn`], which merges it into one output record. With
//! `partial = false` a short final group is dropped. A failed collation goes
//! through the handler; skipping it drops that batch only.

use crate::error::DatasetError;
use crate::handlers::{Handler, route};
use crate::sample::{Field, Sample};
use anyhow::Result;
use std::sync::Arc;

pub type CollationFn = Arc<dyn Fn(Vec<Sample>) -> Result<Sample> + Send + Sync>;

/// Collate field by field: every field name of the first sample becomes a
/// [`Field::List`] with one entry per sample, in batch order.
///
/// # Errors
///
/// Fails when a later sample lacks a field the first one has.
pub fn default_collation(samples: Vec<Sample>) -> Result<Sample> {
    let Some(first) = samples.first() else {
        return Ok(Sample::new());
    };
    let names: Vec<String> = first.names().map(str::to_string).collect();
    let mut columns: Vec<Vec<Field>> = vec![Vec::with_capacity(samples.len()); names.len()];
    for (i, mut sample) in samples.into_iter().enumerate() {
        for (name, column) in names.iter().zip(columns.iter_mut()) {
            let Some(value) = sample.remove(name) else {
                return Err(DatasetError::Collation(format!(
                    "sample #{i} of the batch has no field {name:?}"
                ))
                .into());
            };
            column.push(value);
        }
    }
    Ok(names
        .into_iter()
        .zip(columns)
        .map(|(name, column)| (name, Field::List(column)))
        .collect())
}

#[must_use]
pub fn default_collation_fn() -> CollationFn {
    Arc::new(default_collation)
}

pub struct Batched<I> {
    source: I,
    size: usize,
    partial: bool,
    collation: CollationFn,
    handler: Handler,
    buf: Vec<Sample>,
    exhausted: bool,
}

impl<I> Batched<I>
where
    I: Iterator<Item = Result<Sample>>,
{
    pub fn new(
        source: I,
        size: usize,
        partial: bool,
        collation: CollationFn,
        handler: Handler,
    ) -> Self {
        let size = size.max(1);
        Self {
            source,
            size,
            partial,
            collation,
            handler,
            buf: Vec::with_capacity(size),
            exhausted: false,
        }
    }
}

impl<I> Iterator for Batched<I>
where
    I: Iterator<Item = Result<Sample>>,
{
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while !self.exhausted && self.buf.len() < self.size {
                match self.source.next() {
                    Some(Ok(sample)) => self.buf.push(sample),
                    Some(Err(e)) => return Some(Err(e)),
                    None => self.exhausted = true,
                }
            }
            let full = self.buf.len() == self.size;
            if self.buf.is_empty() || (!full && !self.partial) {
                self.buf.clear();
                return None;
            }
            let batch = std::mem::replace(&mut self.buf, Vec::with_capacity(self.size));
            match (self.collation)(batch) {
                Ok(sample) => return Some(Ok(sample)),
                Err(e) => {
                    if let Some(e) = route(&self.handler, e) {
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{ignore_and_continue, reraise_exception};
    use anyhow::anyhow;

    fn numbered(n: i64) -> impl Iterator<Item = Result<Sample>> {
        (0..n).map(|i| Ok(Sample::new().with("i", i)))
    }

    #[test]
    fn collation_builds_columns() {
        let batch: Vec<Sample> =
            Batched::new(numbered(3), 3, true, default_collation_fn(), reraise_exception())
                .collect::<Result<_>>()
                .unwrap();
        assert_eq!(batch.len(), 1);
        let column = batch[0].get("i").and_then(Field::as_list).unwrap();
        assert_eq!(column, [Field::Int(0), Field::Int(1), Field::Int(2)]);
    }

    #[test]
    fn missing_field_fails_collation() {
        let samples = vec![Sample::new().with("a", 1i64), Sample::new().with("b", 2i64)];
        let err = default_collation(samples).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::Collation(_))
        ));
    }

    #[test]
    fn upstream_errors_pass_through() {
        let source = vec![
            Ok(Sample::new().with("i", 0i64)),
            Err(anyhow!("bad")),
            Ok(Sample::new().with("i", 1i64)),
        ];
        let out: Vec<Result<Sample>> = Batched::new(
            source.into_iter(),
            2,
            false,
            default_collation_fn(),
            reraise_exception(),
        )
        .collect();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
        assert!(out[1].is_ok());
    }

    #[test]
    fn skipped_collation_failure_drops_one_batch() {
        let source = vec![
            Sample::new().with("i", 0i64),
            Sample::new().with("j", 1i64),
            Sample::new().with("i", 2i64),
            Sample::new().with("i", 3i64),
        ];
        let make = |handler: Handler| {
            let input = source.clone().into_iter().map(Ok);
            Batched::new(input, 2, false, default_collation_fn(), handler)
        };

        let kept: Vec<Sample> = make(ignore_and_continue()).collect::<Result<_>>().unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(
            kept[0].get("i").and_then(Field::as_list).unwrap(),
            [Field::Int(2), Field::Int(3)]
        );

        let strict: Vec<Result<Sample>> = make(reraise_exception()).collect();
        assert_eq!(strict.len(), 2);
        assert!(strict[0].is_err());
    }
}
