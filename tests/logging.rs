use anyhow::Result;
use shardflow::testing::ShardDir;
use shardflow::*;
use std::sync::{Arc, Mutex};

fn lines(buf: &Mutex<Vec<u8>>) -> Vec<String> {
    String::from_utf8_lossy(&buf.lock().unwrap())
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn shard_and_key_logs_get_one_line_each() -> Result<()> {
    let dir = ShardDir::new()?;
    let shards = vec![
        dir.write_numbered("a.tar", "a", 2)?,
        dir.write_numbered("b.tar", "b", 1)?,
    ];
    let shard_log = Arc::new(Mutex::new(Vec::<u8>::new()));
    let key_log = Arc::new(Mutex::new(Vec::<u8>::new()));
    let config = DatasetConfig::builder(shards.clone())
        .shard_shuffle_size(None)
        .log_shards(LogDest::Writer(shard_log.clone()))
        .log_keys(LogDest::Writer(key_log.clone()))
        .build()?;
    let mut dataset = Dataset::new(config)?;

    dataset.iter()?.for_each(drop);
    assert_eq!(lines(&shard_log), shards);
    assert_eq!(lines(&key_log), ["a0000", "a0001", "b0000"]);

    // Logs persist across epochs.
    dataset.iter()?.for_each(drop);
    assert_eq!(lines(&shard_log).len(), 4);
    assert_eq!(lines(&key_log).len(), 6);
    Ok(())
}

#[test]
fn path_log_is_flushed_on_close() -> Result<()> {
    let dir = ShardDir::new()?;
    let shard = dir.write_numbered("a.tar", "a", 3)?;
    let log_path = dir.file_path("keys.log");
    let config = DatasetConfig::builder(vec![shard])
        .log_keys(log_path.clone())
        .build()?;
    let mut dataset = Dataset::new(config)?;
    assert!(!log_path.exists());

    dataset.iter()?.for_each(drop);
    dataset.close()?;
    assert_eq!(std::fs::read_to_string(&log_path)?, "a0000\na0001\na0002\n");
    Ok(())
}

#[test]
fn unwritable_log_does_not_stop_iteration() -> Result<()> {
    let dir = ShardDir::new()?;
    let shard = dir.write_numbered("a.tar", "a", 2)?;
    let config = DatasetConfig::builder(vec![shard])
        .log_shards(dir.file_path("no/such/dir/shards.log"))
        .build()?;
    let mut dataset = Dataset::new(config)?;
    assert_eq!(dataset.iter()?.count(), 2);
    Ok(())
}
