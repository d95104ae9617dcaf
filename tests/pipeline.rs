use anyhow::Result;
use shardflow::split::ShardIter;
use shardflow::testing::{ShardDir, numbered_samples, sample_keys};
use shardflow::*;
use std::sync::Arc;

fn two_shards(dir: &ShardDir) -> Result<Vec<String>> {
    Ok(vec![
        dir.write_numbered("a.tar", "a", 3)?,
        dir.write_numbered("b.tar", "b", 2)?,
    ])
}

fn plain(shards: Vec<String>) -> DatasetConfigBuilder {
    DatasetConfig::builder(shards).shard_shuffle_size(None)
}

fn collect(dataset: &mut Dataset) -> Result<Vec<Sample>> {
    dataset.iter()?.collect()
}

#[test]
fn two_shards_stream_in_file_order() -> Result<()> {
    let dir = ShardDir::new()?;
    let shards = two_shards(&dir)?;
    let mut dataset = Dataset::new(plain(shards.clone()).build()?)?;

    let samples = collect(&mut dataset)?;
    assert_eq!(sample_keys(&samples), ["a0000", "a0001", "a0002", "b0000", "b0001"]);
    for (i, s) in samples.iter().enumerate() {
        assert_eq!(s.epoch(), Some(0));
        assert_eq!(s.count(), Some(i as i64));
        assert!(s.contains(".txt") && s.contains(".cls"));
        assert!(!s.contains("txt"));
    }
    assert_eq!(samples[0].url(), Some(shards[0].as_str()));
    assert_eq!(samples[4].url(), Some(shards[1].as_str()));
    Ok(())
}

#[test]
fn epochs_repeat_identically_without_shuffle() -> Result<()> {
    let dir = ShardDir::new()?;
    let mut dataset = Dataset::new(plain(two_shards(&dir)?).build()?)?;

    let first = collect(&mut dataset)?;
    let second = collect(&mut dataset)?;
    assert_eq!(dataset.epoch(), 1);
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.key(), b.key());
        assert_eq!(a.get(".txt"), b.get(".txt"));
        assert_eq!(a.count(), b.count());
        assert_eq!((a.epoch(), b.epoch()), (Some(0), Some(1)));
    }
    Ok(())
}

#[test]
fn for_loop_over_mut_dataset_starts_an_epoch() -> Result<()> {
    let dir = ShardDir::new()?;
    let mut dataset = Dataset::new(plain(two_shards(&dir)?).build()?)?;
    let mut n = 0;
    for sample in &mut dataset {
        sample?;
        n += 1;
    }
    assert_eq!(n, 5);
    assert_eq!(dataset.epoch(), 0);
    Ok(())
}

#[test]
fn repeats_multiply_each_workers_shards() -> Result<()> {
    let dir = ShardDir::new()?;
    let mut shards = Vec::new();
    for i in 0..4 {
        shards.push(dir.write_numbered(&format!("s{i}.tar"), &format!("s{i}-"), 2)?);
    }
    let config = plain(shards)
        .shard_split_fn(split_by_worker(0, 2)?)
        .repeats(3)
        .build()?;
    let mut dataset = Dataset::new(config)?;
    let keys = sample_keys(&collect(&mut dataset)?);

    // Worker 0 owns shards 0 and 2, each with two samples, three times over.
    let pass = ["s0-0000", "s0-0001", "s2-0000", "s2-0001"];
    assert_eq!(keys.len(), 3 * pass.len());
    for chunk in keys.chunks(pass.len()) {
        assert_eq!(chunk, pass);
    }
    Ok(())
}

#[test]
fn split_function_sees_the_epoch() -> Result<()> {
    let dir = ShardDir::new()?;
    let shards = two_shards(&dir)?;
    // Alternate which shard is used per epoch.
    let by_epoch: ShardSplitFn = Arc::new(|shards: ShardIter, epoch: i64| -> ShardIter {
        Box::new(shards.filter(move |s| i64::try_from(s.shard_num) == Ok(epoch % 2)))
    });
    let mut dataset = Dataset::new(plain(shards).shard_split_fn(by_epoch).build()?)?;
    assert_eq!(sample_keys(&collect(&mut dataset)?), ["a0000", "a0001", "a0002"]);
    assert_eq!(sample_keys(&collect(&mut dataset)?), ["b0000", "b0001"]);
    Ok(())
}

#[test]
fn force_size_truncates_and_never_pads() -> Result<()> {
    let dir = ShardDir::new()?;
    let shards = two_shards(&dir)?;

    let mut dataset = Dataset::new(plain(shards.clone()).force_size(4).build()?)?;
    let keys = sample_keys(&collect(&mut dataset)?);
    assert_eq!(keys, ["a0000", "a0001", "a0002", "b0000"]);
    assert_eq!(dataset.size(), 4);

    let mut dataset = Dataset::new(plain(shards).force_size(50).build()?)?;
    assert_eq!(collect(&mut dataset)?.len(), 5);
    Ok(())
}

#[test]
fn force_size_applies_after_transforms() -> Result<()> {
    let dir = ShardDir::new()?;
    let twice = expand(|s: Sample| Ok(vec![s.clone(), s]));
    let config = plain(two_shards(&dir)?).transform(twice).force_size(3).build()?;
    let mut dataset = Dataset::new(config)?;
    assert_eq!(sample_keys(&collect(&mut dataset)?), ["a0000", "a0000", "a0001"]);
    Ok(())
}

#[test]
fn batch_counts_follow_the_partial_flag() -> Result<()> {
    let dir = ShardDir::new()?;
    let shard = dir.write("all.tar", &numbered_samples("k", 10))?;

    let strict = plain(vec![shard.clone()]).batch_size(4).batch_partial(false).build()?;
    let batches = collect(&mut Dataset::new(strict)?)?;
    assert_eq!(batches.len(), 2);

    let lenient = plain(vec![shard.clone()]).batch_size(4).build()?;
    let batches = collect(&mut Dataset::new(lenient)?)?;
    assert_eq!(batches.len(), 3);
    let sizes: Vec<usize> = batches
        .iter()
        .map(|b| b.get("__key__").and_then(Field::as_list).map_or(0, <[Field]>::len))
        .collect();
    assert_eq!(sizes, [4, 4, 2]);

    let even = plain(vec![shard]).batch_size(5).batch_partial(false).build()?;
    assert_eq!(collect(&mut Dataset::new(even)?)?.len(), 2);
    Ok(())
}

#[test]
fn transforms_run_in_order_and_may_drop_samples() -> Result<()> {
    let dir = ShardDir::new()?;
    let tag = map(|s: Sample| Ok(s.with("stage", "tagged")));
    let only_a = filter(|s: &Sample| s.key().is_some_and(|k| k.starts_with('a')));
    let config = plain(two_shards(&dir)?)
        .transformations(vec![tag, only_a])
        .build()?;
    let samples = collect(&mut Dataset::new(config)?)?;
    assert_eq!(samples.len(), 3);
    assert!(samples.iter().all(|s| s.get("stage").and_then(Field::as_str) == Some("tagged")));
    Ok(())
}

#[test]
fn file_fn_renames_members_before_grouping() -> Result<()> {
    let dir = ShardDir::new()?;
    let rename = map_files(|mut f| {
        f.name = f.name.replace(".cls", ".label");
        Ok(f)
    });
    let config = plain(two_shards(&dir)?).file_fn(rename).build()?;
    let samples = collect(&mut Dataset::new(config)?)?;
    assert!(samples.iter().all(|s| s.contains(".label") && !s.contains(".cls")));
    Ok(())
}

#[test]
fn check_empty_fails_an_empty_epoch() -> Result<()> {
    let dir = ShardDir::new()?;
    let empty = dir.write("empty.tar", &[])?;
    let config = plain(vec![empty.clone()]).check_empty(true).build()?;
    let items: Vec<Result<Sample>> = Dataset::new(config)?.iter()?.collect();
    assert_eq!(items.len(), 1);
    let err = items.into_iter().next().unwrap().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DatasetError>(),
        Some(DatasetError::EmptyEpoch { epoch: 0 })
    ));

    let quiet = plain(vec![empty]).build()?;
    assert_eq!(Dataset::new(quiet)?.iter()?.count(), 0);
    Ok(())
}

#[test]
fn closed_dataset_cannot_be_iterated() -> Result<()> {
    let dir = ShardDir::new()?;
    let mut dataset = Dataset::new(plain(two_shards(&dir)?).build()?)?;
    dataset.close()?;
    dataset.close()?;
    let err = dataset.iter().err().expect("iterating a closed dataset fails");
    assert!(matches!(err.downcast_ref::<DatasetError>(), Some(DatasetError::Closed)));
    Ok(())
}

#[test]
fn size_reports_unknown_until_set() -> Result<()> {
    let dir = ShardDir::new()?;
    let mut dataset = Dataset::new(plain(two_shards(&dir)?).build()?)?;
    assert_eq!(dataset.size(), -1);
    dataset.set_size(5);
    assert_eq!(dataset.size(), 5);
    Ok(())
}

#[test]
fn standard_pipeline_has_fourteen_stages() -> Result<()> {
    let dir = ShardDir::new()?;
    let dataset = Dataset::new(plain(two_shards(&dir)?).build()?)?;
    let names: Vec<&str> = dataset.stage_names().collect();
    assert_eq!(names.len(), 14);
    assert_eq!(names.first(), Some(&"iterate_shards"));
    assert_eq!(names.last(), Some(&"batch_samples"));
    Ok(())
}

#[test]
fn custom_stage_runs_after_batching() -> Result<()> {
    let dir = ShardDir::new()?;
    let mut dataset = Dataset::new(plain(two_shards(&dir)?).build()?)?;
    dataset.push_stage(FnStage::map_samples("mark", |s| Ok(s.with("seen", 1i64))));
    let samples = collect(&mut dataset)?;
    assert!(samples.iter().all(|s| s.get("seen") == Some(&Field::Int(1))));
    Ok(())
}

#[test]
fn empty_shard_list_fails_at_construction() {
    let config = DatasetConfig::builder(Vec::<String>::new()).build().unwrap();
    let err = Dataset::new(config).unwrap_err();
    let err = err.downcast_ref::<DatasetError>().unwrap();
    assert!(matches!(err, DatasetError::EmptyShardList { .. }));
    assert!(err.is_configuration());
}

#[test]
fn stage_returning_no_stream_is_an_assembly_error() {
    let pipeline = Pipeline::new()
        .with(FnStage::new("source", |_| {
            Some(Box::new(std::iter::empty::<Result<Unit>>()) as Stream)
        }))
        .with(FnStage::new("broken", |_| None));
    let err = pipeline.run().err().expect("assembly fails");
    assert!(matches!(
        err.downcast_ref::<DatasetError>(),
        Some(DatasetError::Assembly { index: 1, .. })
    ));

    let empty: Vec<Box<dyn Stage>> = Vec::new();
    assert!(run_pipeline(&empty).is_err());
}

struct EpochRecorder {
    seen: Arc<std::sync::Mutex<Vec<i64>>>,
}

impl EpochAware for EpochRecorder {
    fn set_epoch(&mut self, epoch: i64) {
        self.seen.lock().unwrap().push(epoch);
    }
}

impl Stage for EpochRecorder {
    fn name(&self) -> &str {
        "epoch_recorder"
    }

    fn apply(&self, input: Option<Stream>) -> Option<Stream> {
        input
    }

    fn epoch_aware(&mut self) -> Option<&mut dyn EpochAware> {
        Some(self)
    }
}

#[test]
fn epochs_reach_only_epoch_aware_stages() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut stages: Vec<Box<dyn Stage>> = vec![
        Box::new(FnStage::new("plain", |i| i)),
        Box::new(EpochRecorder { seen: Arc::clone(&seen) }),
    ];
    set_pipeline_epochs(&mut stages, 3);
    set_pipeline_epochs(&mut stages, 4);
    assert_eq!(*seen.lock().unwrap(), [3, 4]);
}
