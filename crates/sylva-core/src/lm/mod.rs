//! N-gram language model with chart-state scoring.
//!
//! `NGramLm` is a backoff model loaded from ARPA text. Scoring during chart
//! decoding works on `ChartState`s: a span's state carries its first words
//! (whose context was incomplete when they were scored, so parents can
//! re-estimate them) and its last `order - 1` words (the context for
//! whatever follows). Two spans with byte-equal states are indistinguishable
//! to the model, which is what makes them safe to recombine.

pub mod arpa;

pub use arpa::{load_arpa, parse_arpa};

use std::collections::HashMap;
use std::io;

use crate::vocab::{slot_index, Vocab, WordId};

pub type LmWordIndex = u32;

/// Index reserved for `<unk>`.
pub const UNK_INDEX: LmWordIndex = 0;

pub const BOS: &str = "<s>";
pub const EOS: &str = "</s>";

/// Log-probability floor for unknown words when the model has no `<unk>`
/// entry.
pub(crate) const UNK_FLOOR: f64 = -100.0;

#[derive(Debug, thiserror::Error)]
pub enum LmError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error("truncated ARPA file (missing \\end\\)")]
    Truncated,

    #[error("model declares no n-gram orders")]
    Empty,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ProbBackoff {
    pub prob: f64,
    pub backoff: f64,
}

/// Backoff n-gram model over its own integer vocabulary (`<unk>` = 0).
#[derive(Debug)]
pub struct NGramLm {
    vocab: HashMap<String, LmWordIndex>,
    pub(crate) ngrams: Vec<HashMap<Vec<LmWordIndex>, ProbBackoff>>,
}

/// One element of a target span handed to the scorer: either a concrete
/// word or an already-scored child span.
pub enum SpanItem<'a> {
    Word(LmWordIndex),
    Child(&'a ChartState),
}

impl NGramLm {
    pub(crate) fn empty() -> Self {
        let mut vocab = HashMap::new();
        vocab.insert("<unk>".to_string(), UNK_INDEX);
        Self {
            vocab,
            ngrams: Vec::new(),
        }
    }

    pub(crate) fn intern(&mut self, word: &str) -> LmWordIndex {
        if let Some(&idx) = self.vocab.get(word) {
            return idx;
        }
        let idx = self.vocab.len() as LmWordIndex;
        self.vocab.insert(word.to_string(), idx);
        idx
    }

    /// Index of a word, `UNK_INDEX` if the model has never seen it.
    pub fn index(&self, word: &str) -> LmWordIndex {
        self.vocab.get(word).copied().unwrap_or(UNK_INDEX)
    }

    pub fn order(&self) -> usize {
        self.ngrams.len()
    }

    /// `log P(word | context)`, backing off through shorter contexts. The
    /// context is truncated to the model order internally.
    pub fn logprob(&self, context: &[LmWordIndex], word: LmWordIndex) -> f64 {
        let max_ctx = self.order().saturating_sub(1);
        let ctx = &context[context.len().saturating_sub(max_ctx)..];
        self.logprob_backoff(ctx, word)
    }

    fn logprob_backoff(&self, ctx: &[LmWordIndex], word: LmWordIndex) -> f64 {
        let mut key = Vec::with_capacity(ctx.len() + 1);
        key.extend_from_slice(ctx);
        key.push(word);
        if let Some(pb) = self.ngrams.get(ctx.len()).and_then(|t| t.get(&key)) {
            return pb.prob;
        }
        if ctx.is_empty() {
            return self
                .ngrams
                .first()
                .and_then(|t| t.get([UNK_INDEX].as_slice()))
                .map(|pb| pb.prob)
                .unwrap_or(UNK_FLOOR);
        }
        self.backoff(ctx) + self.logprob_backoff(&ctx[1..], word)
    }

    fn backoff(&self, ctx: &[LmWordIndex]) -> f64 {
        self.ngrams
            .get(ctx.len() - 1)
            .and_then(|t| t.get(ctx))
            .map(|pb| pb.backoff)
            .unwrap_or(0.0)
    }

    /// Score a span assembled from terminals and child spans, producing the
    /// span's log-probability contribution and its chart state.
    ///
    /// Words near the span's left edge are scored with the context available
    /// inside the span; when a child is embedded with words before it, the
    /// difference between its left-edge words' old and improved estimates is
    /// charged here. The running sum over a whole derivation therefore
    /// converges to the exact n-gram score once `final_score` closes the
    /// sentence.
    pub fn score_span<'a>(&self, items: impl IntoIterator<Item = SpanItem<'a>>) -> (f64, ChartState) {
        let max_ctx = self.order().saturating_sub(1);
        let mut score = 0.0;
        let mut left: Vec<LmWordIndex> = Vec::new();
        let mut left_full = max_ctx == 0;
        let mut ctx: Vec<LmWordIndex> = Vec::new();

        for item in items {
            match item {
                SpanItem::Word(w) => {
                    score += self.logprob(&ctx, w);
                    if !left_full {
                        left.push(w);
                        left_full = left.len() >= max_ctx;
                    }
                    push_context(&mut ctx, w, max_ctx);
                }
                SpanItem::Child(child) => {
                    for (p, &w) in child.left.iter().enumerate() {
                        let old_ctx = &child.left[..p];
                        if old_ctx.len() < max_ctx && !ctx.is_empty() {
                            let mut new_ctx = ctx.clone();
                            new_ctx.extend_from_slice(old_ctx);
                            if new_ctx.len() > max_ctx {
                                new_ctx.drain(..new_ctx.len() - max_ctx);
                            }
                            if new_ctx.len() > old_ctx.len() {
                                score +=
                                    self.logprob(&new_ctx, w) - self.logprob(old_ctx, w);
                            }
                        }
                        if !left_full {
                            left.push(w);
                            left_full = left.len() >= max_ctx;
                        }
                    }
                    if child.left_full {
                        left_full = true;
                        ctx.clear();
                        ctx.extend_from_slice(&child.right);
                    } else {
                        // A short child's right side is its entire word
                        // sequence.
                        for &w in &child.right {
                            push_context(&mut ctx, w, max_ctx);
                        }
                    }
                }
            }
        }
        (
            score,
            ChartState {
                left,
                left_full,
                right: ctx,
            },
        )
    }

    /// Close a sentence: re-estimate the left edge against `<s>` and score
    /// `</s>` after the right edge.
    pub fn final_score(&self, state: &ChartState) -> f64 {
        let bos = self.index(BOS);
        let eos = self.index(EOS);
        let items = [
            SpanItem::Word(bos),
            SpanItem::Child(state),
            SpanItem::Word(eos),
        ];
        let (score, _) = self.score_span(items);
        score - self.logprob(&[], bos)
    }
}

fn push_context(ctx: &mut Vec<LmWordIndex>, word: LmWordIndex, max_ctx: usize) {
    ctx.push(word);
    if ctx.len() > max_ctx {
        ctx.remove(0);
    }
}

/// Minimal LM context of a span, the recombination key for LM-aware search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ChartState {
    /// The span's first words, up to `order - 1` of them, in span order.
    left: Vec<LmWordIndex>,
    /// True once the span holds at least `order - 1` words.
    left_full: bool,
    /// The span's last words, up to `order - 1` of them.
    right: Vec<LmWordIndex>,
}

impl ChartState {
    /// State of a span containing exactly the given words.
    pub fn from_words(lm: &NGramLm, words: &[LmWordIndex]) -> Self {
        lm.score_span(words.iter().map(|&w| SpanItem::Word(w))).1
    }
}

/// Result of scoring one edge's target side against one LM.
#[derive(Debug, Clone)]
pub struct NontermScore {
    pub prob: f64,
    pub oov: i64,
    pub state: ChartState,
}

/// A language model plus its decoder-facing configuration: the features it
/// writes, the weights applied inside search, and the target factor it reads.
pub struct LmData {
    pub lm: NGramLm,
    pub feature: WordId,
    pub unk_feature: WordId,
    pub weight: f64,
    pub unk_weight: f64,
    pub factor: usize,
}

impl LmData {
    /// Wrap a model with the conventional `lm` / `lmunk` feature names.
    pub fn new(lm: NGramLm, vocab: &Vocab, weight: f64, unk_weight: f64) -> Self {
        // Interning cannot fail before the vocabulary is frozen; models are
        // loaded at startup.
        let feature = vocab.intern("lm").unwrap_or(0);
        let unk_feature = vocab.intern("lmunk").unwrap_or(0);
        Self {
            lm,
            feature,
            unk_feature,
            weight,
            unk_weight,
            factor: 0,
        }
    }

    pub fn with_feature(mut self, vocab: &Vocab, name: &str, unk_name: &str) -> Self {
        self.feature = vocab.intern(name).unwrap_or(self.feature);
        self.unk_feature = vocab.intern(unk_name).unwrap_or(self.unk_feature);
        self
    }

    /// LM index of a decoder word.
    pub fn map_word(&self, vocab: &Vocab, wid: WordId) -> LmWordIndex {
        match vocab.word(wid) {
            Some(w) => self.lm.index(&w),
            None => UNK_INDEX,
        }
    }

    /// Score one edge's target template: terminals are mapped into the LM
    /// vocabulary (counting OOVs), slots splice in the matching child state.
    pub fn calc_nonterm_score(
        &self,
        vocab: &Vocab,
        words: &[WordId],
        child_states: &[&ChartState],
    ) -> NontermScore {
        let mut oov = 0;
        let items: Vec<SpanItem> = words
            .iter()
            .map(|&w| {
                if w < 0 {
                    SpanItem::Child(child_states[slot_index(w)])
                } else {
                    let idx = self.map_word(vocab, w);
                    if idx == UNK_INDEX {
                        oov += 1;
                    }
                    SpanItem::Word(idx)
                }
            })
            .collect();
        let (prob, state) = self.lm.score_span(items);
        NontermScore { prob, oov, state }
    }

    /// Sentence-boundary score for a completed span.
    pub fn calc_final_score(&self, state: &ChartState) -> f64 {
        self.lm.final_score(state)
    }
}
