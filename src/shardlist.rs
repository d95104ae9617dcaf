//! Shard list resolution.
//!
//! A [`ShardSource`] is resolved exactly once per dataset into an ordered
//! list of [`ShardDescriptor`]s:
//!
//! - `List` is taken as is.
//! - `Pattern` is brace-expanded (`a-{000..002}.tar` → three shards,
//!   `{train,val}.tar` → two); local entries with glob metacharacters are
//!   then matched against the filesystem.
//! - `Manifest` is a JSON file of the form
//!   `{"name": .., "base_url": .., "shardlist": [{"url": .., "nsamples": ..} | ".."]}`.
//!   Relative entries are resolved against the configured base URL, else the
//!   manifest's own `base_url`, else the manifest's directory.

use crate::config::ShardSource;
use crate::error::DatasetError;
use crate::io::glob::{expand_glob, has_glob_meta};
use crate::io::gopen::{is_local, local_path, open_url, url_scheme};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::LazyLock;
use tracing::debug;

/// A shard URL and its position in the resolved list.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub url: String,
    pub shard_num: usize,
}

impl ShardDescriptor {
    pub fn new(url: impl Into<String>, shard_num: usize) -> Self {
        Self {
            url: url.into(),
            shard_num,
        }
    }
}

/// Outcome of resolving a shard source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardList {
    pub shards: Vec<ShardDescriptor>,
    /// Known sample count, from a manifest where every entry has one.
    pub total_size: Option<u64>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestEntry {
    Url(String),
    Entry { url: String, nsamples: Option<u64> },
}

#[derive(Debug, Deserialize)]
struct Manifest {
    name: Option<String>,
    base_url: Option<String>,
    shardlist: Vec<ManifestEntry>,
}

static NUM_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-?\d+)\.\.(-?\d+)(?:\.\.(-?\d+))?$").expect("valid range regex")
});

static CHAR_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z])\.\.([A-Za-z])(?:\.\.(-?\d+))?$").expect("valid range regex")
});

fn pattern_error(pattern: &str, reason: impl Into<String>) -> anyhow::Error {
    DatasetError::Pattern {
        pattern: pattern.to_string(),
        reason: reason.into(),
    }
    .into()
}

/// Index of the `}` closing the `{` at `open`.
fn matching_brace(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s[open..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_alternatives(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_step(pattern: &str, step: Option<&str>) -> Result<i64> {
    let step = match step {
        Some(s) => s
            .parse::<i64>()
            .map_err(|e| pattern_error(pattern, format!("bad step {s:?}: {e}")))?,
        None => 1,
    };
    if step == 0 {
        return Err(pattern_error(pattern, "range step is zero"));
    }
    step.checked_abs()
        .ok_or_else(|| pattern_error(pattern, format!("range step {step} is too large")))
}

/// Upper bound on the entries one range may produce.
const MAX_RANGE_LEN: usize = 10_000_000;

fn stepped(pattern: &str, start: i64, end: i64, step: i64) -> Result<Vec<i64>> {
    let mut out = Vec::new();
    let mut next = Some(start);
    while let Some(i) = next {
        if (start <= end && i > end) || (start > end && i < end) {
            break;
        }
        if out.len() == MAX_RANGE_LEN {
            return Err(pattern_error(
                pattern,
                format!("range has more than {MAX_RANGE_LEN} entries"),
            ));
        }
        out.push(i);
        next = if start <= end { i.checked_add(step) } else { i.checked_sub(step) };
    }
    Ok(out)
}

fn expand_range(pattern: &str, body: &str) -> Result<Option<Vec<String>>> {
    if let Some(c) = NUM_RANGE.captures(body) {
        let (a, b) = (&c[1], &c[2]);
        let parse = |s: &str| {
            s.parse::<i64>()
                .map_err(|e| pattern_error(pattern, format!("bad range bound {s:?}: {e}")))
        };
        let step = parse_step(pattern, c.get(3).map(|m| m.as_str()))?;
        let padded = a.trim_start_matches('-').starts_with('0') && a.len() > 1
            || b.trim_start_matches('-').starts_with('0') && b.len() > 1;
        let width = if padded { a.len().max(b.len()) } else { 0 };
        let values = stepped(pattern, parse(a)?, parse(b)?, step)?;
        return Ok(Some(values.into_iter().map(|v| format!("{v:0width$}")).collect()));
    }
    if let Some(c) = CHAR_RANGE.captures(body) {
        let (a, b) = (c[1].as_bytes()[0], c[2].as_bytes()[0]);
        let step = parse_step(pattern, c.get(3).map(|m| m.as_str()))?;
        let values = stepped(pattern, i64::from(a), i64::from(b), step)?;
        return Ok(Some(
            values
                .into_iter()
                .filter_map(|v| u8::try_from(v).ok())
                .map(|v| char::from(v).to_string())
                .collect(),
        ));
    }
    Ok(None)
}

/// Shell-style brace expansion.
///
/// Supports alternation (`{a,b}`), nesting (`{a,b{1,2}}`), numeric ranges
/// with optional zero padding and step (`{00..10..2}`) and letter ranges
/// (`{a..e}`). A brace group with a single plain alternative is kept
/// literally.
///
/// # Errors
///
/// Returns [`DatasetError::Pattern`] for unbalanced braces or a zero step.
pub fn braceexpand(pattern: &str) -> Result<Vec<String>> {
    let Some(open) = pattern.find('{') else {
        if pattern.contains('}') {
            return Err(pattern_error(pattern, "unmatched '}'"));
        }
        return Ok(vec![pattern.to_string()]);
    };
    let Some(close) = matching_brace(pattern, open) else {
        return Err(pattern_error(pattern, "unmatched '{'"));
    };
    let prefix = &pattern[..open];
    if prefix.contains('}') {
        return Err(pattern_error(pattern, "unmatched '}'"));
    }
    let body = &pattern[open + 1..close];
    let alternatives = split_alternatives(body);

    let choices = if alternatives.len() > 1 {
        let mut v = Vec::new();
        for alt in alternatives {
            v.extend(braceexpand(alt)?);
        }
        v
    } else if let Some(range) = expand_range(pattern, body)? {
        range
    } else {
        braceexpand(body)?
            .into_iter()
            .map(|inner| format!("{{{inner}}}"))
            .collect()
    };

    let suffixes = braceexpand(&pattern[close + 1..])?;
    let mut out = Vec::with_capacity(choices.len() * suffixes.len());
    for choice in &choices {
        for suffix in &suffixes {
            out.push(format!("{prefix}{choice}{suffix}"));
        }
    }
    Ok(out)
}

fn is_relative(url: &str) -> bool {
    url_scheme(url).is_none() && !url.starts_with('/')
}

fn join_url(base: &str, rel: &str) -> String {
    if base.is_empty() {
        return rel.to_string();
    }
    format!("{}/{rel}", base.trim_end_matches('/'))
}

/// Directory part of a manifest location, with a trailing slash removed.
fn manifest_dir(location: &str) -> String {
    location
        .rfind('/')
        .map(|i| location[..i].to_string())
        .unwrap_or_default()
}

/// Parse manifest JSON text.
///
/// # Errors
///
/// Fails on malformed JSON or a missing `shardlist`.
pub fn parse_manifest(
    text: &str,
    location: &str,
    base_url: Option<&str>,
) -> Result<ShardList> {
    let manifest: Manifest =
        serde_json::from_str(text).with_context(|| format!("parse manifest {location}"))?;
    let base = base_url
        .map(str::to_string)
        .or(manifest.base_url)
        .unwrap_or_else(|| manifest_dir(location));

    let mut total = Some(0u64);
    let mut shards = Vec::with_capacity(manifest.shardlist.len());
    for (i, entry) in manifest.shardlist.into_iter().enumerate() {
        let (url, nsamples) = match entry {
            ManifestEntry::Url(url) => (url, None),
            ManifestEntry::Entry { url, nsamples } => (url, nsamples),
        };
        total = total.zip(nsamples).map(|(t, n)| t + n);
        let url = if is_relative(&url) { join_url(&base, &url) } else { url };
        shards.push(ShardDescriptor::new(url, i));
    }
    if shards.is_empty() {
        total = None;
    }
    Ok(ShardList {
        shards,
        total_size: total,
        name: manifest.name,
    })
}

/// Read and parse a manifest from a local path or any URL `gopen` handles.
///
/// # Errors
///
/// Fails if the manifest cannot be opened, read or parsed.
pub fn read_manifest(location: &str, base_url: Option<&str>) -> Result<ShardList> {
    let mut reader = open_url(location).with_context(|| format!("open manifest {location}"))?;
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .with_context(|| format!("read manifest {location}"))?;
    parse_manifest(&text, location, base_url)
}

fn expand_pattern(pattern: &str) -> Result<Vec<String>> {
    let mut urls = Vec::new();
    for url in braceexpand(pattern)? {
        if is_local(&url) && has_glob_meta(&url) {
            urls.extend(expand_glob(&local_path(&url))?);
        } else {
            urls.push(url);
        }
    }
    Ok(urls)
}

fn numbered(urls: Vec<String>) -> Vec<ShardDescriptor> {
    urls.into_iter()
        .enumerate()
        .map(|(i, url)| ShardDescriptor::new(url, i))
        .collect()
}

/// Resolve `source` into a non-empty shard list.
///
/// # Errors
///
/// Returns [`DatasetError::EmptyShardList`] when nothing is left, plus any
/// pattern or manifest error.
pub fn resolve(source: &ShardSource, base_url: Option<&str>) -> Result<ShardList> {
    let list = match source {
        ShardSource::List(urls) => ShardList {
            shards: numbered(urls.clone()),
            total_size: None,
            name: None,
        },
        ShardSource::Pattern(pattern) => ShardList {
            shards: numbered(expand_pattern(pattern)?),
            total_size: None,
            name: None,
        },
        ShardSource::Manifest(location) => read_manifest(location, base_url)?,
    };
    if list.shards.is_empty() {
        return Err(DatasetError::EmptyShardList {
            source_desc: source.to_string(),
        }
        .into());
    }
    debug!(shards = list.shards.len(), total_size = ?list.total_size, "resolved shard list");
    Ok(list)
}
