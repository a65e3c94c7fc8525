//! Feature tags and their canonical signature.
//!
//! A feature is a capability tag (`hsi_1`, `dna_w`) that a task requires and
//! a worker advertises. A task's feature list doubles as its resource claim.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeatureError {
    #[error("feature tag must not be empty")]
    Empty,

    #[error("feature tag {0:?} must not contain a comma")]
    ContainsComma(String),
}

/// Ordered, duplicate-free list of feature tags.
///
/// Order is insertion order. Two sets with the same tags in a different order
/// produce different signatures; the queue only ever compares signatures built
/// through [`FeatureSet::with_defaults`], so the rule stays consistent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct FeatureSet(Vec<String>);

impl FeatureSet {
    pub fn new<I, S>(tags: I) -> Result<Self, FeatureError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        for tag in tags {
            let tag = tag.into();
            if tag.is_empty() {
                return Err(FeatureError::Empty);
            }
            if tag.contains(',') {
                return Err(FeatureError::ContainsComma(tag));
            }
            set.push(tag);
        }
        Ok(set)
    }

    fn push(&mut self, tag: String) {
        if !self.0.contains(&tag) {
            self.0.push(tag);
        }
    }

    /// Caller features first, then any default not already present.
    pub fn with_defaults(&self, defaults: &FeatureSet) -> FeatureSet {
        let mut merged = self.clone();
        for tag in &defaults.0 {
            merged.push(tag.clone());
        }
        merged
    }

    pub fn signature(&self) -> FeatureSignature {
        FeatureSignature(self.0.join(","))
    }

    /// True when every required tag is in `available` (order-independent).
    pub fn is_satisfied_by(&self, available: &[String]) -> bool {
        self.0.iter().all(|tag| available.contains(tag))
    }

    pub fn intersects(&self, available: &[String]) -> bool {
        self.0.iter().any(|tag| available.contains(tag))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<String>> for FeatureSet {
    type Error = FeatureError;

    fn try_from(tags: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(tags)
    }
}

impl From<FeatureSet> for Vec<String> {
    fn from(set: FeatureSet) -> Self {
        set.0
    }
}

/// Comma-joined feature list; the partition key inside a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FeatureSignature(String);

impl FeatureSignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
