//! Shards produced by other tools.

use anyhow::Result;
use flate2::Compression;
use flate2::write::GzEncoder;
use shardflow::testing::{ShardDir, sample_keys};
use shardflow::*;
use std::fs::File;
use std::path::Path;

fn write_with_tar_crate(path: &Path, members: &[(&str, &[u8])]) -> Result<()> {
    let mut builder = tar::Builder::new(File::create(path)?);
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data)?;
    }
    builder.into_inner()?;
    Ok(())
}

fn read_all(urls: Vec<String>) -> Result<Vec<Sample>> {
    let config = DatasetConfig::builder(urls).shard_shuffle_size(None).build()?;
    Dataset::new(config)?.iter()?.collect()
}

#[test]
fn reads_archives_written_by_the_tar_crate() -> Result<()> {
    let dir = ShardDir::new()?;
    let path = dir.file_path("gnu.tar");
    write_with_tar_crate(
        &path,
        &[
            ("img01.jpg", b"\xff\xd8jpeg".as_slice()),
            ("img01.cls", b"3".as_slice()),
            ("nested/img02.jpg", b"\xff\xd8more".as_slice()),
            ("nested/img02.cls", b"7".as_slice()),
        ],
    )?;

    let samples = read_all(vec![path.to_string_lossy().into_owned()])?;
    assert_eq!(sample_keys(&samples), ["img01", "nested/img02"]);
    assert_eq!(
        samples[1].get(".cls").and_then(Field::as_bytes),
        Some(b"7".as_slice())
    );
    Ok(())
}

#[test]
fn gzip_is_detected_by_suffix_and_by_magic() -> Result<()> {
    let dir = ShardDir::new()?;
    let plain = dir.file_path("plain.tar");
    write_with_tar_crate(&plain, &[("k.txt", b"zipped".as_slice())])?;
    let raw = std::fs::read(&plain)?;

    let mut urls = Vec::new();
    for name in ["suffix.tar.gz", "magic.tar"] {
        let path = dir.file_path(name);
        let mut gz = GzEncoder::new(File::create(&path)?, Compression::default());
        std::io::Write::write_all(&mut gz, &raw)?;
        gz.finish()?;
        urls.push(path.to_string_lossy().into_owned());
    }

    let samples = read_all(urls)?;
    assert_eq!(samples.len(), 2);
    for s in &samples {
        assert_eq!(s.get(".txt").and_then(Field::as_bytes), Some(b"zipped".as_slice()));
    }
    Ok(())
}

#[test]
fn pipe_urls_read_command_output() -> Result<()> {
    let dir = ShardDir::new()?;
    let path = dir.write_numbered("piped.tar", "p", 2)?;
    let samples = read_all(vec![format!("pipe:cat '{path}'")])?;
    assert_eq!(sample_keys(&samples), ["p0000", "p0001"]);
    assert_eq!(samples[0].url(), Some(format!("pipe:cat '{path}'").as_str()));
    Ok(())
}

#[test]
fn failing_pipe_command_is_a_shard_error() -> Result<()> {
    let dir = ShardDir::new()?;
    let good = dir.write_numbered("good.tar", "g", 1)?;
    let config = DatasetConfig::builder(vec!["pipe:exit 3".to_string(), good])
        .shard_shuffle_size(None)
        .handler(ignore_and_continue())
        .build()?;
    let samples: Vec<Sample> = Dataset::new(config)?.iter()?.collect::<Result<_>>()?;
    assert_eq!(sample_keys(&samples), ["g0000"]);
    Ok(())
}

#[test]
fn unknown_scheme_is_reported() -> Result<()> {
    let config = DatasetConfig::builder(vec!["ftp://host/a.tar"]).build()?;
    let items: Vec<Result<Sample>> = Dataset::new(config)?.iter()?.collect();
    assert_eq!(items.len(), 1);
    let err = items.into_iter().next().unwrap().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DatasetError>(),
        Some(DatasetError::UnsupportedScheme { .. })
    ));
    Ok(())
}

#[test]
fn plain_tar_whose_first_key_looks_like_bzip2() -> Result<()> {
    let dir = ShardDir::new()?;
    let ours = dir.write_numbered("ours.tar", "BZh_", 2)?;
    let gnu = dir.file_path("gnu.tar");
    write_with_tar_crate(&gnu, &[("BZh91AY.txt", b"plain".as_slice())])?;

    let samples = read_all(vec![ours, gnu.to_string_lossy().into_owned()])?;
    assert_eq!(sample_keys(&samples), ["BZh_0000", "BZh_0001", "BZh91AY"]);
    Ok(())
}
