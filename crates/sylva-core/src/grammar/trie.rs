//! Source-pattern index for the chart decoder.
//!
//! The source side of every rule is serialised to a byte key: terminals as
//! little-endian `i32` bit patterns, non-terminal slots as the child
//! head-label tuple with every label negative-encoded (`-1 - label`). A trie
//! over these keys supports exact lookup (returning a rule-bucket id) and
//! prefix existence, which is what drives the CKY+ chart walk.
//!
//! Compiled grammars are stored in a small binary container (magic, version,
//! bincode payload) and can be opened through a memory map.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use super::{GrammarError, HieroHeadLabels, TranslationRule};
use crate::vocab::WordId;

const MAGIC: &[u8; 4] = b"SYGR";
const VERSION: u8 = 1;
const HEADER_SIZE: usize = 4 + 1 + 4; // magic + version + payload_len

/// Append a terminal to a serialised pattern.
pub fn push_terminal(key: &mut Vec<u8>, id: WordId) {
    debug_assert!(id >= 0);
    key.extend_from_slice(&id.to_le_bytes());
}

/// Append a non-terminal (negative-encoded head-label tuple) to a serialised
/// pattern.
pub fn push_nonterm(key: &mut Vec<u8>, labels: &HieroHeadLabels) {
    for &label in &labels.0 {
        key.extend_from_slice(&(-1 - label).to_le_bytes());
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrieNode {
    children: BTreeMap<u8, u32>,
    key_id: Option<u32>,
}

/// Byte-trie mapping serialised patterns to bucket ids.
#[derive(Debug, Serialize, Deserialize)]
struct RuleTrie {
    nodes: Vec<TrieNode>,
}

impl RuleTrie {
    fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
        }
    }

    /// Walk `key`, returning the node index it ends at, if present.
    fn walk(&self, key: &[u8]) -> Option<usize> {
        let mut node = 0usize;
        for &byte in key {
            node = *self.nodes[node].children.get(&byte)? as usize;
        }
        Some(node)
    }

    fn lookup(&self, key: &[u8]) -> Option<u32> {
        self.nodes[self.walk(key)?].key_id
    }

    /// True iff some key in the trie has `key` as a prefix (including `key`
    /// itself).
    fn has_prefix(&self, key: &[u8]) -> bool {
        match self.walk(key) {
            Some(node) => {
                self.nodes[node].key_id.is_some() || !self.nodes[node].children.is_empty()
            }
            None => false,
        }
    }

    /// Insert `key`, assigning `next_id` if it is new. Returns the key id.
    fn insert(&mut self, key: &[u8], next_id: u32) -> u32 {
        let mut node = 0usize;
        for &byte in key {
            node = match self.nodes[node].children.get(&byte) {
                Some(&child) => child as usize,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children.insert(byte, child as u32);
                    child
                }
            };
        }
        *self.nodes[node].key_id.get_or_insert(next_id)
    }
}

/// Location of a rule inside a `RuleFsm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRef {
    bucket: u32,
    offset: u32,
}

/// A grammar indexed for chart decoding: the pattern trie, rule buckets (one
/// per distinct source pattern), and the unary index used by cube pruning.
#[derive(Debug, Serialize, Deserialize)]
pub struct RuleFsm {
    trie: RuleTrie,
    buckets: Vec<Vec<TranslationRule>>,
    // Ordered so downstream unary-rule numbering is deterministic.
    unary: BTreeMap<HieroHeadLabels, Vec<RuleRef>>,
}

impl RuleFsm {
    /// Index a set of rules. Rules sharing a serialised source pattern land
    /// in the same bucket, in input order.
    pub fn from_rules(rules: impl IntoIterator<Item = TranslationRule>) -> Self {
        let mut fsm = Self {
            trie: RuleTrie::new(),
            buckets: Vec::new(),
            unary: BTreeMap::new(),
        };
        for rule in rules {
            let key = fsm.pattern_key(&rule);
            let bucket = fsm.trie.insert(&key, fsm.buckets.len() as u32);
            if bucket as usize == fsm.buckets.len() {
                fsm.buckets.push(Vec::new());
            }
            let offset = fsm.buckets[bucket as usize].len() as u32;
            // A pattern of exactly one non-terminal is a unary rule; index it
            // by its child labels for cube-pruning expansion.
            if rule.src.words.len() == 1 && rule.arity() == 1 {
                fsm.unary
                    .entry(rule.child_head_labels(0).clone())
                    .or_default()
                    .push(RuleRef { bucket, offset });
            }
            fsm.buckets[bucket as usize].push(rule);
        }
        fsm
    }

    fn pattern_key(&self, rule: &TranslationRule) -> Vec<u8> {
        let mut key = Vec::with_capacity(rule.src.words.len() * 4);
        for &word in &rule.src.words {
            if word >= 0 {
                push_terminal(&mut key, word);
            } else {
                let slot = crate::vocab::slot_index(word);
                push_nonterm(&mut key, rule.child_head_labels(slot));
            }
        }
        key
    }

    /// Exact lookup of a serialised pattern.
    pub fn lookup(&self, key: &[u8]) -> Option<u32> {
        self.trie.lookup(key)
    }

    /// Prefix-existence query. Never mutates the caller's key.
    pub fn has_prefix(&self, key: &[u8]) -> bool {
        self.trie.has_prefix(key)
    }

    /// All rules sharing the bucket's source pattern.
    pub fn rules_for(&self, bucket: u32) -> &[TranslationRule] {
        &self.buckets[bucket as usize]
    }

    /// Refs to every rule in a bucket, in load order.
    pub fn bucket_refs(&self, bucket: u32) -> impl Iterator<Item = RuleRef> + '_ {
        (0..self.buckets[bucket as usize].len()).map(move |i| RuleRef {
            bucket,
            offset: i as u32,
        })
    }

    /// Unary rules whose single child carries these head labels.
    pub fn unary_rules_for(&self, labels: &HieroHeadLabels) -> &[RuleRef] {
        self.unary.get(labels).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All unary entries, ordered by child head labels.
    pub fn unary_entries(&self) -> impl Iterator<Item = (&HieroHeadLabels, &[RuleRef])> {
        self.unary.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn rule(&self, rref: RuleRef) -> &TranslationRule {
        &self.buckets[rref.bucket as usize][rref.offset as usize]
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, GrammarError> {
        let payload = bincode::serialize(self).map_err(GrammarError::Serialize)?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, GrammarError> {
        if data.len() < 5 {
            return Err(GrammarError::InvalidHeader);
        }
        if &data[..4] != MAGIC {
            return Err(GrammarError::InvalidMagic);
        }
        if data[4] != VERSION {
            return Err(GrammarError::UnsupportedVersion(data[4]));
        }
        if data.len() < HEADER_SIZE {
            return Err(GrammarError::InvalidHeader);
        }
        let payload_len = u32::from_le_bytes(data[5..9].try_into().unwrap()) as usize;
        if data.len() < HEADER_SIZE + payload_len {
            return Err(GrammarError::InvalidHeader);
        }
        bincode::deserialize(&data[HEADER_SIZE..HEADER_SIZE + payload_len])
            .map_err(GrammarError::Deserialize)
    }

    /// Open a compiled grammar, mapping the file instead of buffering it.
    pub fn open(path: &Path) -> Result<Self, GrammarError> {
        let file = File::open(path)?;
        // SAFETY: the file is opened read-only and the mapping is immutable.
        // The Mmap is dropped after deserialization completes below.
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_bytes(&mmap)
    }

    pub fn save(&self, path: &Path) -> Result<(), GrammarError> {
        Ok(fs::write(path, self.to_bytes()?)?)
    }
}
