//! Tag selectors.
//!
//! A selector is a conjunction of clauses. Each clause tests one tag key:
//!
//! - `equal`: the key is present and its value is one of `values`
//! - `not_equal`: the key is absent, or its value is none of `values`
//! - `key_exists`: the key is present, any value
//! - `key_not_exists`: the key is absent
//!
//! An empty selector matches every tag set.

use crate::tags::TagSet;
use serde::{Deserialize, Serialize};

/// Comparison applied by a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Value is one of the listed values.
    Equal,
    /// Key absent or value not listed.
    NotEqual,
    /// Key present.
    KeyExists,
    /// Key absent.
    KeyNotExists,
}

/// One `key <op> values` test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    /// Tag key.
    pub key: String,
    /// Comparison.
    pub operator: Operator,
    /// Values for `equal`/`not_equal`; ignored otherwise.
    #[serde(default)]
    pub values: Vec<String>,
}

impl Clause {
    /// `key == value`.
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::Equal,
            values: vec![value.into()],
        }
    }

    /// `key != value`.
    pub fn not_equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::NotEqual,
            values: vec![value.into()],
        }
    }

    /// Key present with any value.
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::KeyExists,
            values: Vec::new(),
        }
    }

    /// Key absent.
    pub fn not_exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::KeyNotExists,
            values: Vec::new(),
        }
    }

    fn matches(&self, tags: &TagSet) -> bool {
        let value = tags.get(&self.key);
        match self.operator {
            Operator::Equal => value.is_some_and(|v| self.values.iter().any(|x| x == v)),
            Operator::NotEqual => value.is_none_or(|v| self.values.iter().all(|x| x != v)),
            Operator::KeyExists => value.is_some(),
            Operator::KeyNotExists => value.is_none(),
        }
    }
}

/// Conjunction of clauses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSelector(Vec<Clause>);

impl TagSelector {
    /// Build a selector from clauses.
    pub fn new(clauses: Vec<Clause>) -> Self {
        Self(clauses)
    }

    /// Whether every clause holds for `tags`.
    pub fn matches(&self, tags: &TagSet) -> bool {
        self.0.iter().all(|c| c.matches(tags))
    }

    /// The clauses of this selector.
    pub fn clauses(&self) -> &[Clause] {
        &self.0
    }
}
