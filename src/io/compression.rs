//! Transparent decompression of shard streams.
//!
//! Shards are frequently stored compressed (`train-0001.tar.gz`,
//! `train-0001.tar.zst`). The opening stage passes every raw stream through
//! [`auto_detect_reader`], so the archive reader always sees plain tar bytes.
//!
//! Detection checks the URL suffix first and falls back to magic bytes, so a
//! compressed shard with a misleading name is still recognized.
//!
//! ## Built-in Codecs
//!
//! - **Gzip** (`.gz`, `.tgz`) - via `flate2` (feature: `compression-gzip`)
//! - **Zstd** (`.zst`) - via `zstd` (feature: `compression-zstd`)
//! - **Bzip2** (`.bz2`) - via `bzip2` (feature: `compression-bzip2`)
//! - **Xz** (`.xz`) - via `xz2` (feature: `compression-xz`)
//!
//! Additional codecs can be added at runtime with [`register_codec`].

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::sync::{Arc, PoisonError, RwLock};

pub type ShardReader = Box<dyn Read + Send>;
pub type ShardWriter = Box<dyn Write + Send>;

static CODEC_REGISTRY: RwLock<Option<Vec<Arc<dyn CompressionCodec>>>> = RwLock::new(None);

fn builtin_codecs() -> Vec<Arc<dyn CompressionCodec>> {
    vec![
        #[cfg(feature = "compression-gzip")]
        Arc::new(GzipCodec),
        #[cfg(feature = "compression-zstd")]
        Arc::new(ZstdCodec),
        #[cfg(feature = "compression-bzip2")]
        Arc::new(Bzip2Codec),
        #[cfg(feature = "compression-xz")]
        Arc::new(XzCodec),
    ]
}

fn codecs() -> Vec<Arc<dyn CompressionCodec>> {
    {
        let lock = CODEC_REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = lock.as_ref() {
            return list.clone();
        }
    }
    let mut lock = CODEC_REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    lock.get_or_insert_with(builtin_codecs).clone()
}

/// Register an extra codec; it is consulted after the built-in ones.
pub fn register_codec(codec: Arc<dyn CompressionCodec>) {
    let mut lock = CODEC_REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    lock.get_or_insert_with(builtin_codecs).push(codec);
}

/// A pluggable compression algorithm.
pub trait CompressionCodec: Send + Sync {
    fn name(&self) -> &str;

    /// Lowercase suffixes including the leading dot (e.g. `&[".gz", ".tgz"]`).
    fn extensions(&self) -> &[&str];

    /// Stream signature, if the format has a reliable one.
    fn magic_bytes(&self) -> Option<&[u8]>;

    fn wrap_reader(&self, reader: ShardReader) -> std::io::Result<ShardReader>;

    fn wrap_writer(&self, writer: ShardWriter) -> std::io::Result<ShardWriter>;
}

/// Name of the codec matching `url`'s suffix, if any.
#[must_use]
pub fn codec_for(url: &str) -> Option<String> {
    detect_from_extension(url).map(|c| c.name().to_string())
}

fn detect_from_extension(url: &str) -> Option<Arc<dyn CompressionCodec>> {
    let lower = url.to_lowercase();
    codecs()
        .into_iter()
        .find(|codec| codec.extensions().iter().any(|ext| lower.ends_with(ext)))
}

fn detect_from_magic<R: BufRead>(reader: &mut R) -> Option<Arc<dyn CompressionCodec>> {
    let buf = reader.fill_buf().ok()?;
    if buf.is_empty() || crate::io::tar::is_tar_header(buf) {
        return None;
    }
    codecs().into_iter().find(|codec| {
        codec
            .magic_bytes()
            .is_some_and(|magic| buf.len() >= magic.len() && buf.starts_with(magic))
    })
}

/// Wrap `reader` with a decompressor when `url` (or the stream itself) says
/// it is compressed; plain streams come back buffered.
pub fn auto_detect_reader<R: Read + Send + 'static>(reader: R, url: &str) -> Result<ShardReader> {
    if let Some(codec) = detect_from_extension(url) {
        return codec
            .wrap_reader(Box::new(reader))
            .with_context(|| format!("wrap {url} with {} decoder", codec.name()));
    }

    let mut buffered = BufReader::new(reader);
    if let Some(codec) = detect_from_magic(&mut buffered) {
        return codec
            .wrap_reader(Box::new(buffered))
            .with_context(|| format!("wrap {url} with {} decoder", codec.name()));
    }

    Ok(Box::new(buffered))
}

/// Wrap `writer` with a compressor chosen by `url`'s suffix.
pub fn auto_detect_writer<W: Write + Send + 'static>(writer: W, url: &str) -> Result<ShardWriter> {
    if let Some(codec) = detect_from_extension(url) {
        return codec
            .wrap_writer(Box::new(writer))
            .with_context(|| format!("wrap {url} with {} encoder", codec.name()));
    }
    Ok(Box::new(BufWriter::new(writer)))
}

// ============================================================================
// Built-in Codec Implementations
// ============================================================================

#[cfg(feature = "compression-gzip")]
struct GzipCodec;

#[cfg(feature = "compression-gzip")]
impl CompressionCodec for GzipCodec {
    fn name(&self) -> &str {
        "gzip"
    }

    fn extensions(&self) -> &[&str] {
        &[".gz", ".tgz", ".gzip"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x1f, 0x8b])
    }

    fn wrap_reader(&self, reader: ShardReader) -> std::io::Result<ShardReader> {
        use flate2::read::MultiGzDecoder;
        Ok(Box::new(MultiGzDecoder::new(reader)))
    }

    fn wrap_writer(&self, writer: ShardWriter) -> std::io::Result<ShardWriter> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        Ok(Box::new(GzEncoder::new(writer, Compression::default())))
    }
}

#[cfg(feature = "compression-zstd")]
struct ZstdCodec;

#[cfg(feature = "compression-zstd")]
impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn extensions(&self) -> &[&str] {
        &[".zst", ".zstd"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x28, 0xb5, 0x2f, 0xfd])
    }

    fn wrap_reader(&self, reader: ShardReader) -> std::io::Result<ShardReader> {
        zstd::stream::read::Decoder::new(reader).map(|d| Box::new(d) as ShardReader)
    }

    fn wrap_writer(&self, writer: ShardWriter) -> std::io::Result<ShardWriter> {
        zstd::stream::write::Encoder::new(writer, 3)
            .map(|e| Box::new(e.auto_finish()) as ShardWriter)
    }
}

#[cfg(feature = "compression-bzip2")]
struct Bzip2Codec;

#[cfg(feature = "compression-bzip2")]
impl CompressionCodec for Bzip2Codec {
    fn name(&self) -> &str {
        "bzip2"
    }

    fn extensions(&self) -> &[&str] {
        &[".bz2", ".bzip2"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(b"BZh")
    }

    fn wrap_reader(&self, reader: ShardReader) -> std::io::Result<ShardReader> {
        use bzip2::read::BzDecoder;
        Ok(Box::new(BzDecoder::new(reader)))
    }

    fn wrap_writer(&self, writer: ShardWriter) -> std::io::Result<ShardWriter> {
        use bzip2::Compression;
        use bzip2::write::BzEncoder;
        Ok(Box::new(BzEncoder::new(writer, Compression::default())))
    }
}

#[cfg(feature = "compression-xz")]
struct XzCodec;

#[cfg(feature = "compression-xz")]
impl CompressionCodec for XzCodec {
    fn name(&self) -> &str {
        "xz"
    }

    fn extensions(&self) -> &[&str] {
        &[".xz"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00])
    }

    fn wrap_reader(&self, reader: ShardReader) -> std::io::Result<ShardReader> {
        use xz2::read::XzDecoder;
        Ok(Box::new(XzDecoder::new(reader)))
    }

    fn wrap_writer(&self, writer: ShardWriter) -> std::io::Result<ShardWriter> {
        use xz2::write::XzEncoder;
        Ok(Box::new(XzEncoder::new(writer, 6)))
    }
}
