//! Sparse feature vectors and weight handling.
//!
//! Feature names are interned in the same `Vocab` as words, so a vector maps
//! `WordId` to `f64`. Missing entries read as zero. A `BTreeMap` keeps
//! iteration order deterministic, which matters for reproducible decoding.

use std::collections::BTreeMap;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::vocab::{Vocab, VocabError, WordId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    values: BTreeMap<WordId, f64>,
}

impl SparseVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: WordId) -> f64 {
        self.values.get(&id).copied().unwrap_or(0.0)
    }

    /// Add `value` to the entry for `id`, dropping the entry if it cancels
    /// to exactly zero.
    pub fn add(&mut self, id: WordId, value: f64) {
        let entry = self.values.entry(id).or_insert(0.0);
        *entry += value;
        if *entry == 0.0 {
            self.values.remove(&id);
        }
    }

    pub fn set(&mut self, id: WordId, value: f64) {
        if value == 0.0 {
            self.values.remove(&id);
        } else {
            self.values.insert(id, value);
        }
    }

    pub fn dot(&self, other: &SparseVector) -> f64 {
        // Iterate the smaller side.
        let (a, b) = if self.values.len() <= other.values.len() {
            (&self.values, &other.values)
        } else {
            (&other.values, &self.values)
        };
        a.iter()
            .filter_map(|(id, v)| b.get(id).map(|w| v * w))
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WordId, f64)> + '_ {
        self.values.iter().map(|(&id, &v)| (id, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl AddAssign<&SparseVector> for SparseVector {
    fn add_assign(&mut self, rhs: &SparseVector) {
        for (id, v) in rhs.iter() {
            self.add(id, v);
        }
    }
}

impl FromIterator<(WordId, f64)> for SparseVector {
    fn from_iter<T: IntoIterator<Item = (WordId, f64)>>(iter: T) -> Self {
        let mut out = SparseVector::new();
        for (id, v) in iter {
            out.add(id, v);
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeatureParseError {
    #[error("malformed feature entry {0:?} (expected name=value)")]
    Malformed(String),
    #[error("bad feature value in {0:?}")]
    BadValue(String),
    #[error(transparent)]
    Vocab(#[from] VocabError),
}

/// Parse whitespace-separated `name=value` pairs (the rule-table feature
/// column).
pub fn parse_features(vocab: &Vocab, text: &str) -> Result<SparseVector, FeatureParseError> {
    let mut out = SparseVector::new();
    for entry in text.split_whitespace() {
        let (name, value) = entry
            .rsplit_once('=')
            .ok_or_else(|| FeatureParseError::Malformed(entry.to_string()))?;
        let value: f64 = value
            .parse()
            .map_err(|_| FeatureParseError::BadValue(entry.to_string()))?;
        out.add(vocab.intern(name)?, value);
    }
    Ok(out)
}

/// Parse a weights file: whitespace-separated `name value` pairs, one per
/// line. Unknown features simply become new entries; features absent from the
/// file read as zero.
pub fn parse_weights(vocab: &Vocab, text: &str) -> Result<SparseVector, FeatureParseError> {
    let mut out = SparseVector::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut it = line.split_whitespace();
        let (name, value) = match (it.next(), it.next()) {
            (Some(n), Some(v)) => (n, v),
            _ => return Err(FeatureParseError::Malformed(line.to_string())),
        };
        let value: f64 = value
            .parse()
            .map_err(|_| FeatureParseError::BadValue(line.to_string()))?;
        out.add(vocab.intern(name)?, value);
    }
    Ok(out)
}

pub fn print_features(vocab: &Vocab, feats: &SparseVector) -> String {
    let mut out = String::new();
    for (id, v) in feats.iter() {
        if !out.is_empty() {
            out.push(' ');
        }
        match vocab.word(id) {
            Some(name) => out.push_str(&name),
            None => out.push_str("<bad-id>"),
        }
        out.push('=');
        out.push_str(&v.to_string());
    }
    out
}
