//! Label model for querymesh components
//!
//! A label is a `(name, value)` string pair; a label set is a sequence of
//! labels sorted by name with unique names. Label sets identify series and
//! describe the data exposed by a backend store, and their ordering drives
//! the merge of backend response streams.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single `(name, value)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    /// Label name (e.g. "region")
    pub name: String,

    /// Label value (e.g. "eu-west-1")
    pub value: String,
}

impl Label {
    /// Create a new label
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}", self.name, self.value)
    }
}

/// A sequence of labels sorted by name, with unique names.
///
/// The derived ordering is lexicographic over the `(name, value)` pairs,
/// which is exactly the series ordering backend streams are required to
/// emit.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabelSet(Vec<Label>);

impl LabelSet {
    /// Create an empty label set
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Create a label set from labels, sorting by name and dropping
    /// duplicate names (first occurrence wins).
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort();
        labels.dedup_by(|b, a| a.name == b.name);
        Self(labels)
    }

    /// Create a label set from `(name, value)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(n, v)| Label::new(n, v))
                .collect(),
        )
    }

    /// Labels in sorted order
    pub fn labels(&self) -> &[Label] {
        &self.0
    }

    /// Get the value stored for a name, if any
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Check whether the set has a value for a name
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Element-wise merge with another sorted set; on a name collision the
    /// label from `other` wins.
    pub fn extend_sorted(&self, other: &LabelSet) -> LabelSet {
        let mut merged = Vec::with_capacity(self.0.len() + other.0.len());
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].name.cmp(&other.0[j].name) {
                std::cmp::Ordering::Less => {
                    merged.push(self.0[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(other.0[j].clone());
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    merged.push(other.0[j].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&self.0[i..]);
        merged.extend_from_slice(&other.0[j..]);
        LabelSet(merged)
    }

}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", l)?;
        }
        write!(f, "}}")
    }
}
