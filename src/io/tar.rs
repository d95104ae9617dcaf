//! Streaming tar expansion and key grouping.
//!
//! [`TarMembers`] owns its reader and yields one [`MemberFile`] at a time, so
//! a shard is never held in memory as a whole. [`GroupByKeys`] folds runs of
//! consecutive members that share a key (`sample01.jpg`, `sample01.cls`) into
//! one [`Sample`]. [`TarWriter`] produces archives in the same layout.
//!
//! The reader understands POSIX ustar headers (with the `prefix` field), GNU
//! long names (`L` entries) and the `path` record of pax headers. Members
//! whose name looks like `__meta__` are pipeline metadata and are skipped.

use crate::error::DatasetError;
use crate::handlers::{Handler, route};
use crate::sample::{self, Field, Sample};
use anyhow::{Context, Result, bail};
use regex::Regex;
use std::io::{self, Read, Write};
use std::sync::LazyLock;

const BLOCK: usize = 512;

static META_MEMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__[^/]*__($|/)").expect("valid meta regex"));

static KEY_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^((?:.*/|)[^./]+)[.]([^/]*)$").expect("valid key regex"));

/// One regular file read from a shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberFile {
    pub name: String,
    pub data: Vec<u8>,
    pub url: String,
    pub shard_num: usize,
}

/// Split a member name into its sample key and lowercase suffix.
///
/// `dir/img001.seg.png` becomes `("dir/img001", "seg.png")`. Names without a
/// dot after the last slash have no key.
#[must_use]
pub fn split_key(name: &str) -> Option<(String, String)> {
    let caps = KEY_SUFFIX.captures(name)?;
    Some((caps[1].to_string(), caps[2].to_lowercase()))
}

fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text = cstr(field);
    let text = text.trim_matches(|c: char| c == ' ' || c == '\0');
    if text.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(text, 8).ok()
}

fn parse_size(field: &[u8]) -> Option<u64> {
    // GNU base-256 for sizes above 8 GiB.
    if field[0] & 0x80 != 0 {
        let mut n = u64::from(field[0] & 0x7f);
        for &b in &field[1..] {
            n = n.checked_mul(256)?.checked_add(u64::from(b))?;
        }
        return Some(n);
    }
    parse_octal(field)
}

fn header_checksum(header: &[u8; BLOCK]) -> u64 {
    header
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { 32 } else { u64::from(b) })
        .sum()
}

/// Whether `block` starts with a tar header: either the ustar magic or a
/// non-empty block whose stored checksum matches.
pub(crate) fn is_tar_header(block: &[u8]) -> bool {
    let Some(header) = block.get(..BLOCK).and_then(|b| <&[u8; BLOCK]>::try_from(b).ok()) else {
        return false;
    };
    if &header[257..262] == b"ustar" {
        return true;
    }
    header.iter().any(|&b| b != 0)
        && parse_octal(&header[148..156]) == Some(header_checksum(header))
}

fn pax_path(records: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(records);
    text.lines().find_map(|line| {
        let (_len, kv) = line.split_once(' ')?;
        let (key, value) = kv.split_once('=')?;
        (key == "path").then(|| value.to_string())
    })
}

/// Iterator over the regular files of one tar stream.
pub struct TarMembers<R> {
    reader: R,
    url: String,
    shard_num: usize,
    long_name: Option<String>,
    done: bool,
}

impl<R: Read> TarMembers<R> {
    pub fn new(reader: R, url: impl Into<String>, shard_num: usize) -> Self {
        Self {
            reader,
            url: url.into(),
            shard_num,
            long_name: None,
            done: false,
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> anyhow::Error {
        DatasetError::Archive {
            url: self.url.clone(),
            reason: reason.into(),
        }
        .into()
    }

    /// Fill one header block. `false` means a clean end of stream.
    fn read_block(&mut self, block: &mut [u8; BLOCK]) -> Result<bool> {
        let mut filled = 0;
        while filled < BLOCK {
            match self.reader.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).with_context(|| format!("read {}", self.url)),
            }
        }
        match filled {
            0 => Ok(false),
            BLOCK => Ok(true),
            _ => Err(self.malformed("truncated header")),
        }
    }

    fn read_data(&mut self, size: u64) -> Result<Vec<u8>> {
        let len = usize::try_from(size).map_err(|_| self.malformed("member too large"))?;
        let mut data = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut data) {
            return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
                self.malformed("truncated member")
            } else {
                anyhow::Error::new(e).context(format!("read {}", self.url))
            });
        }
        let padding = (BLOCK - len % BLOCK) % BLOCK;
        if padding > 0 {
            let mut pad = [0u8; BLOCK];
            // A missing final pad is tolerated; the next header read ends cleanly.
            let _ = self.reader.read_exact(&mut pad[..padding]);
        }
        Ok(data)
    }

    fn next_member(&mut self) -> Result<Option<MemberFile>> {
        let mut header = [0u8; BLOCK];
        loop {
            if !self.read_block(&mut header)? || header.iter().all(|&b| b == 0) {
                return Ok(None);
            }
            let stored = parse_octal(&header[148..156]);
            if stored != Some(header_checksum(&header)) {
                return Err(self.malformed("header checksum mismatch"));
            }
            let mut name = cstr(&header[..100]);
            if &header[257..263] == b"ustar\0" {
                let prefix = cstr(&header[345..500]);
                if !prefix.is_empty() {
                    name = format!("{prefix}/{name}");
                }
            }
            let Some(size) = parse_size(&header[124..136]) else {
                return Err(self.malformed(format!("bad size field for {name}")));
            };
            let data = self.read_data(size)?;

            match header[156] {
                b'0' | b'\0' | b'7' => {
                    let name = self.long_name.take().unwrap_or(name);
                    if META_MEMBER.is_match(&name) {
                        continue;
                    }
                    return Ok(Some(MemberFile {
                        name,
                        data,
                        url: self.url.clone(),
                        shard_num: self.shard_num,
                    }));
                }
                b'L' => self.long_name = Some(cstr(&data)),
                b'x' => self.long_name = pax_path(&data),
                _ => self.long_name = None,
            }
        }
    }
}

impl<R: Read> Iterator for TarMembers<R> {
    type Item = Result<MemberFile>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_member() {
            Ok(Some(member)) => Some(Ok(member)),
            Ok(None) => {
                self.done = true;
                None
            }
            // The stream position is unknown after a failure; stop here.
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

struct Pending {
    key: String,
    url: String,
    sample: Sample,
}

/// Groups consecutive members with the same key and URL into samples.
///
/// A suffix seen twice within one sample is a data fault; it is passed to
/// the handler and the partial sample is discarded either way. Errors coming
/// from upstream are forwarded untouched.
pub struct GroupByKeys<I> {
    source: I,
    handler: Handler,
    current: Option<Pending>,
}

impl<I> GroupByKeys<I>
where
    I: Iterator<Item = Result<MemberFile>>,
{
    pub fn new(source: I, handler: Handler) -> Self {
        Self {
            source,
            handler,
            current: None,
        }
    }
}

impl<I> Iterator for GroupByKeys<I>
where
    I: Iterator<Item = Result<MemberFile>>,
{
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let file = match self.source.next() {
                None => return self.current.take().map(|p| Ok(p.sample)),
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(file)) => file,
            };
            let Some((key, suffix)) = split_key(&file.name) else {
                continue;
            };

            let same = self
                .current
                .as_ref()
                .is_some_and(|p| p.key == key && p.url == file.url);
            if !same {
                let sample = Sample::new()
                    .with(sample::KEY, key.as_str())
                    .with(sample::URL, file.url.as_str())
                    .with(suffix, Field::Bytes(file.data));
                let finished = self.current.replace(Pending {
                    key,
                    url: file.url,
                    sample,
                });
                if let Some(done) = finished {
                    return Some(Ok(done.sample));
                }
                continue;
            }

            if let Some(pending) = self.current.as_mut() {
                if pending.sample.contains(&suffix) {
                    let err = DatasetError::DuplicateMember {
                        key,
                        suffix,
                        url: file.url,
                    };
                    self.current = None;
                    if let Some(e) = route(&self.handler, err.into()) {
                        return Some(Err(e));
                    }
                    continue;
                }
                pending.sample.insert(suffix, Field::Bytes(file.data));
            }
        }
    }
}

/// Writes tar archives that [`TarMembers`] and other tar readers accept.
pub struct TarWriter<W: Write> {
    inner: W,
    members: usize,
}

impl<W: Write> TarWriter<W> {
    pub const fn new(inner: W) -> Self {
        Self { inner, members: 0 }
    }

    /// Number of regular files written so far.
    #[must_use]
    pub const fn members(&self) -> usize {
        self.members
    }

    fn write_header(&mut self, name: &str, size: usize, typeflag: u8) -> Result<()> {
        let mut header = [0u8; BLOCK];
        let name_bytes = name.as_bytes();
        let n = name_bytes.len().min(100);
        header[..n].copy_from_slice(&name_bytes[..n]);
        header[100..108].copy_from_slice(b"0000644\0");
        header[108..116].copy_from_slice(b"0000000\0");
        header[116..124].copy_from_slice(b"0000000\0");
        let size = size as u64;
        if size <= 0o77_777_777_777 {
            header[124..136].copy_from_slice(format!("{size:011o}\0").as_bytes());
        } else {
            header[124] = 0x80;
            header[128..136].copy_from_slice(&size.to_be_bytes());
        }
        header[136..148].copy_from_slice(b"00000000000\0");
        header[156] = typeflag;
        header[257..263].copy_from_slice(b"ustar\0");
        header[263..265].copy_from_slice(b"00");
        let checksum = header_checksum(&header);
        header[148..156].copy_from_slice(format!("{checksum:06o}\0 ").as_bytes());
        self.inner.write_all(&header)?;
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data)?;
        let padding = (BLOCK - data.len() % BLOCK) % BLOCK;
        self.inner.write_all(&[0u8; BLOCK][..padding])?;
        Ok(())
    }

    /// Append one regular file.
    pub fn append(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if name.len() > 100 {
            let mut long = name.as_bytes().to_vec();
            long.push(0);
            self.write_header("././@LongLink", long.len(), b'L')?;
            self.write_data(&long)?;
        }
        self.write_header(name, data.len(), b'0')?;
        self.write_data(data)?;
        self.members += 1;
        Ok(())
    }

    /// Write every payload field of `sample` as `<key>.<suffix>`.
    ///
    /// Returns the number of members written.
    pub fn write_sample(&mut self, sample: &Sample) -> Result<usize> {
        let Some(key) = sample.key() else {
            bail!("sample has no {} field", sample::KEY);
        };
        let key = key.to_string();
        let mut written = 0;
        for (name, field) in sample {
            if name.starts_with(sample::META_PREFIX) {
                continue;
            }
            let suffix = name.trim_start_matches('.');
            let bytes = match field {
                Field::Bytes(b) => b.clone(),
                Field::Text(s) => s.clone().into_bytes(),
                Field::Int(i) => i.to_string().into_bytes(),
                Field::Float(f) => f.to_string().into_bytes(),
                Field::Json(v) => serde_json::to_vec(v)?,
                Field::List(_) => bail!("cannot write list field {name} of sample {key}"),
            };
            self.append(&format!("{key}.{suffix}"), &bytes)?;
            written += 1;
        }
        Ok(written)
    }

    /// Write the end-of-archive marker and hand back the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.inner.write_all(&[0u8; 2 * BLOCK])?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::reraise_exception;
    use std::io::Cursor;

    fn archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut w = TarWriter::new(Vec::new());
        for (name, data) in members {
            w.append(name, data).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn header_detection() {
        let tar = archive(&[("BZh_0001.txt", b"x".as_slice())]);
        assert!(is_tar_header(&tar));
        assert!(!is_tar_header(&tar[..100]));
        assert!(!is_tar_header(&[0u8; BLOCK]));

        let mut gnu = tar[..BLOCK].to_vec();
        gnu[257..263].copy_from_slice(b"\0\0\0\0\0\0");
        let sum = header_checksum(<&[u8; BLOCK]>::try_from(gnu.as_slice()).unwrap());
        gnu[148..156].copy_from_slice(format!("{sum:06o}\0 ").as_bytes());
        assert!(is_tar_header(&gnu));
        gnu[0] ^= 1;
        assert!(!is_tar_header(&gnu));
    }

    #[test]
    fn split_key_uses_first_dot_of_basename() {
        assert_eq!(
            split_key("dir.v1/img001.seg.PNG"),
            Some(("dir.v1/img001".into(), "seg.png".into()))
        );
        assert_eq!(split_key("README"), None);
    }

    #[test]
    fn members_round_trip_with_long_names() {
        let long = format!("{}/sample.txt", "d".repeat(120));
        let bytes = archive(&[("a.txt", b"hello".as_slice()), (long.as_str(), b"x")]);
        let files: Vec<MemberFile> = TarMembers::new(Cursor::new(bytes), "mem", 3)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].data, b"hello");
        assert_eq!(files[1].name, long);
        assert_eq!(files[1].shard_num, 3);
    }

    #[test]
    fn metadata_members_are_skipped() {
        let bytes = archive(&[("__index__", b"{}".as_slice()), ("k.txt", b"v")]);
        let names: Vec<String> = TarMembers::new(Cursor::new(bytes), "mem", 0)
            .map(|m| m.unwrap().name)
            .collect();
        assert_eq!(names, vec!["k.txt"]);
    }

    #[test]
    fn truncated_archive_is_an_error() {
        let mut bytes = archive(&[("k.txt", &[7u8; 1000])]);
        bytes.truncate(700);
        let items: Vec<Result<MemberFile>> = TarMembers::new(Cursor::new(bytes), "mem", 0).collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[test]
    fn grouping_starts_a_new_sample_per_key() {
        let bytes = archive(&[("a.jpg", b"1".as_slice()), ("a.cls", b"2"), ("b.jpg", b"3")]);
        let members = TarMembers::new(Cursor::new(bytes), "shard", 0);
        let samples: Vec<Sample> = GroupByKeys::new(members, reraise_exception())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].key(), Some("a"));
        assert!(samples[0].contains("jpg") && samples[0].contains("cls"));
        assert_eq!(samples[1].url(), Some("shard"));
    }

    #[test]
    fn duplicate_suffix_goes_to_handler() {
        let bytes = archive(&[("a.jpg", b"1".as_slice()), ("a.jpg", b"2")]);
        let members = TarMembers::new(Cursor::new(bytes), "shard", 0);
        let out: Vec<Result<Sample>> = GroupByKeys::new(members, reraise_exception()).collect();
        assert_eq!(out.len(), 1);
        let err = out.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::DuplicateMember { .. })
        ));
    }
}
