//! Synchronous grammar rules.
//!
//! A `TranslationRule` pairs a source pattern (`CfgData`) with one target
//! template per factor, a sparse feature vector, and head labels used as
//! recombination keys. Rules are immutable after grammar load.

mod parse;
pub mod trie;

pub use parse::{parse_rule, parse_rule_table};

use std::io;

use serde::{Deserialize, Serialize};

use crate::features::{FeatureParseError, SparseVector};
use crate::vocab::{slot_index, Sentence, VocabError, WordId};

/// Unified error type for rule-table parsing and compiled-grammar I/O.
#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error("invalid header (too short)")]
    InvalidHeader,

    #[error("invalid magic bytes (expected SYGR)")]
    InvalidMagic,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("serialization error: {0}")]
    Serialize(bincode::Error),

    #[error("deserialization error: {0}")]
    Deserialize(bincode::Error),

    #[error(transparent)]
    Vocab(#[from] VocabError),

    #[error(transparent)]
    Features(#[from] FeatureParseError),
}

/// One side of a rule: a word sequence with embedded slot markers, a head
/// label, and one child label per slot.
///
/// Invariant: the number of negative entries in `words` equals `syms.len()`,
/// and each negative entry's slot index is a valid index into `syms`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgData {
    pub words: Sentence,
    pub label: WordId,
    pub syms: Sentence,
}

impl CfgData {
    pub fn new(words: Sentence, label: WordId, syms: Sentence) -> Self {
        let data = Self { words, label, syms };
        debug_assert!(data.check_slots());
        data
    }

    /// Positions of slot markers in `words`.
    pub fn nonterm_positions(&self) -> Vec<usize> {
        self.words
            .iter()
            .enumerate()
            .filter(|(_, &w)| w < 0)
            .map(|(i, _)| i)
            .collect()
    }

    fn check_slots(&self) -> bool {
        let negs: Vec<usize> = self
            .words
            .iter()
            .filter(|&&w| w < 0)
            .map(|&w| slot_index(w))
            .collect();
        negs.len() == self.syms.len() && negs.iter().all(|&s| s < self.syms.len())
    }
}

/// Target sides, one per factor.
pub type CfgDataVector = Vec<CfgData>;

/// Recombination key for a rule head: one label per target factor plus one
/// for the source, source first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HieroHeadLabels(pub Vec<WordId>);

impl HieroHeadLabels {
    /// The same label across the source and every target factor.
    pub fn uniform(label: WordId, trg_factors: usize) -> Self {
        Self(vec![label; trg_factors + 1])
    }

    pub fn from_sides(src_label: WordId, trg_labels: &[WordId]) -> Self {
        let mut labels = Vec::with_capacity(trg_labels.len() + 1);
        labels.push(src_label);
        labels.extend_from_slice(trg_labels);
        Self(labels)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A synchronous translation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRule {
    pub src: CfgData,
    pub trg: CfgDataVector,
    pub features: SparseVector,
    pub head_labels: HieroHeadLabels,
    pub child_head_labels: Vec<HieroHeadLabels>,
}

impl TranslationRule {
    pub fn new(src: CfgData, trg: CfgDataVector, features: SparseVector) -> Self {
        let trg_labels: Vec<WordId> = trg.iter().map(|t| t.label).collect();
        let head_labels = HieroHeadLabels::from_sides(src.label, &trg_labels);
        let child_head_labels = (0..src.syms.len())
            .map(|slot| {
                let trg_syms: Vec<WordId> = trg.iter().map(|t| t.syms[slot]).collect();
                HieroHeadLabels::from_sides(src.syms[slot], &trg_syms)
            })
            .collect();
        Self {
            src,
            trg,
            features,
            head_labels,
            child_head_labels,
        }
    }

    /// Number of non-terminal slots.
    pub fn arity(&self) -> usize {
        self.src.syms.len()
    }

    pub fn child_head_labels(&self, slot: usize) -> &HieroHeadLabels {
        &self.child_head_labels[slot]
    }
}
