//! Symbol table mapping tokens to integer word ids.
//!
//! Ids are signed: `id >= 0` is a terminal token, `id < 0` is a non-terminal
//! slot marker whose slot index is `-1 - id`. The table is interior-mutable
//! so a single instance can be shared; `freeze` forbids further insertions,
//! after which the table may be read from any number of threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Signed word id. Non-negative ids are terminals, negative ids are
/// non-terminal slots.
pub type WordId = i32;

/// A sequence of word ids, possibly containing slot markers.
pub type Sentence = Vec<WordId>;

/// Slot index encoded by a negative word id.
pub fn slot_index(id: WordId) -> usize {
    debug_assert!(id < 0);
    (-1 - id) as usize
}

/// Negative word id encoding a slot index.
pub fn slot_id(index: usize) -> WordId {
    -1 - index as i32
}

#[derive(Debug, thiserror::Error)]
pub enum VocabError {
    #[error("cannot intern {0:?}: vocabulary is frozen")]
    Frozen(String),
}

#[derive(Default)]
struct Inner {
    ids: HashMap<String, WordId>,
    words: Vec<String>,
}

/// Bidirectional token ↔ id table with a freeze lifecycle.
#[derive(Default)]
pub struct Vocab {
    inner: RwLock<Inner>,
    frozen: AtomicBool,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a token, assigning the next free id on first sight.
    /// Fails once the table is frozen and the token is unknown.
    pub fn intern(&self, token: &str) -> Result<WordId, VocabError> {
        if let Some(&id) = self.inner.read().unwrap().ids.get(token) {
            return Ok(id);
        }
        if self.frozen.load(Ordering::Acquire) {
            return Err(VocabError::Frozen(token.to_string()));
        }
        let mut inner = self.inner.write().unwrap();
        // Another writer may have interned it between the locks.
        if let Some(&id) = inner.ids.get(token) {
            return Ok(id);
        }
        let id = inner.words.len() as WordId;
        inner.words.push(token.to_string());
        inner.ids.insert(token.to_string(), id);
        Ok(id)
    }

    /// Id of an already-interned token.
    pub fn get(&self, token: &str) -> Option<WordId> {
        self.inner.read().unwrap().ids.get(token).copied()
    }

    /// Token for a terminal id.
    pub fn word(&self, id: WordId) -> Option<String> {
        if id < 0 {
            return None;
        }
        self.inner.read().unwrap().words.get(id as usize).cloned()
    }

    /// Forbid further insertions. Required before decoding sentences in
    /// parallel.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Intern every whitespace-separated token of `text`.
    pub fn parse_words(&self, text: &str) -> Result<Sentence, VocabError> {
        text.split_whitespace().map(|t| self.intern(t)).collect()
    }

    /// Render a sentence; slot markers print as `x0`, `x1`, ...
    pub fn print_words(&self, sent: &[WordId]) -> String {
        let inner = self.inner.read().unwrap();
        let mut out = String::new();
        for (i, &id) in sent.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            if id < 0 {
                out.push('x');
                out.push_str(&slot_index(id).to_string());
            } else {
                match inner.words.get(id as usize) {
                    Some(w) => out.push_str(w),
                    None => out.push_str("<bad-id>"),
                }
            }
        }
        out
    }
}
