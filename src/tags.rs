//! Tag sets carried as workload identity.
//!
//! Tags are `key=value` pairs. They are kept in a `BTreeMap` so a tag set
//! always serializes in the same key order, which token caching relies on
//! (the verification cache keys on exact token bytes).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved tag carrying the destination port observed by the receiver.
pub const PORT_TAG: &str = "@sys:port";

/// An ordered set of `key=value` identity tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Create an empty tag set.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert or replace a tag.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate tags in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of this set with the destination port tag appended.
    pub fn with_port(&self, port: u16) -> Self {
        let mut augmented = self.clone();
        augmented.insert(PORT_TAG, port.to_string());
        augmented
    }

    /// Copy of this set with `extra` tags added where the key is not
    /// already present.
    pub fn merged_with(&self, extra: &TagSet) -> Self {
        let mut merged = self.clone();
        for (k, v) in &extra.0 {
            merged.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
        merged
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, String>> for TagSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}
