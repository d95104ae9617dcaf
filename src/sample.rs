//! Sample records: the unit that flows out of the grouping stage.
//!
//! A [`Sample`] is an ordered map from field names to [`Field`] values. Names
//! that start with `__` carry pipeline metadata (`__key__`, `__url__`,
//! `__epoch__`, `__count__`); payload fields are stored under a leading dot
//! (`.jpg`, `.cls`) once [`Sample::fix_dots`] has run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map;

pub const KEY: &str = "__key__";
pub const URL: &str = "__url__";
pub const EPOCH: &str = "__epoch__";
pub const COUNT: &str = "__count__";

/// Reserved prefix for metadata fields.
pub const META_PREFIX: &str = "__";

/// A single value stored in a [`Sample`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Field {
    Bytes(Vec<u8>),
    Text(String),
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
    /// Produced by collation: one entry per sample of a batch.
    List(Vec<Field>),
}

impl Field {
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Field]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// Short variant name, used in error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::Text(_) => "text",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Json(_) => "json",
            Self::List(_) => "list",
        }
    }
}

impl From<Vec<u8>> for Field {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for Field {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Field {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<serde_json::Value> for Field {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// One logical training example.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    fields: BTreeMap<String, Field>,
}

/// True for names that fix-dots leaves alone.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    name.starts_with(META_PREFIX) || name.starts_with('.')
}

impl Sample {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Field>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Field>) -> Option<Field> {
        self.fields.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Field> {
        self.fields.remove(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Field> {
        self.fields.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Field names that are not metadata.
    pub fn payload_names(&self) -> impl Iterator<Item = &str> {
        self.names().filter(|n| !n.starts_with(META_PREFIX))
    }

    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.get(KEY).and_then(Field::as_str)
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.get(URL).and_then(Field::as_str)
    }

    #[must_use]
    pub fn epoch(&self) -> Option<i64> {
        self.get(EPOCH).and_then(Field::as_int)
    }

    #[must_use]
    pub fn count(&self) -> Option<i64> {
        self.get(COUNT).and_then(Field::as_int)
    }

    /// Move every payload field `k` to `.k`.
    ///
    /// Names that already start with `.` or with the metadata prefix are left
    /// untouched, so running this twice is the same as running it once.
    pub fn fix_dots(&mut self) {
        let plain: Vec<String> = self
            .fields
            .keys()
            .filter(|k| !is_reserved(k))
            .cloned()
            .collect();
        for k in plain {
            if let Some(v) = self.fields.remove(&k) {
                self.fields.insert(format!(".{k}"), v);
            }
        }
    }
}

impl IntoIterator for Sample {
    type Item = (String, Field);
    type IntoIter = btree_map::IntoIter<String, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a Sample {
    type Item = (&'a String, &'a Field);
    type IntoIter = btree_map::Iter<'a, String, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl FromIterator<(String, Field)> for Sample {
    fn from_iter<I: IntoIterator<Item = (String, Field)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}
