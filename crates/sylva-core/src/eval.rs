//! BLEU evaluation.
//!
//! Sentence statistics (per-order match/total counts plus lengths) are kept
//! separate from the score so they can be summed for corpus BLEU or scaled
//! for tuning. N-gram count maps can be cached under caller-supplied ids,
//! which matters when tuning re-scores the same reference thousands of
//! times.

use std::collections::HashMap;
use std::ops::AddAssign;
use std::rc::Rc;

use crate::vocab::{Sentence, WordId};

pub const DEFAULT_ORDER: usize = 4;

/// Sufficient statistics for BLEU over one or more sentence pairs.
/// Stored as floats so tuning can scale them.
#[derive(Debug, Clone, PartialEq)]
pub struct BleuStats {
    matches: Vec<f64>,
    totals: Vec<f64>,
    ref_len: f64,
    sys_len: f64,
    smooth: f64,
}

impl BleuStats {
    pub fn zero(order: usize, smooth: f64) -> Self {
        Self {
            matches: vec![0.0; order],
            totals: vec![0.0; order],
            ref_len: 0.0,
            sys_len: 0.0,
            smooth,
        }
    }

    /// BLEU = BP * exp(mean log precision). Orders with no system n-grams
    /// are left out of the mean, so a reference shorter than the n-gram
    /// order still scores 1 against itself.
    pub fn score(&self) -> f64 {
        if self.sys_len <= 0.0 {
            return 0.0;
        }
        let mut log_sum = 0.0;
        let mut count = 0usize;
        for (m, t) in self.matches.iter().zip(&self.totals) {
            if *t <= 0.0 {
                continue;
            }
            let ratio = (m + self.smooth) / (t + self.smooth);
            if ratio <= 0.0 {
                return 0.0;
            }
            log_sum += ratio.ln();
            count += 1;
        }
        if count == 0 {
            return 0.0;
        }
        let bp = (1.0 - self.ref_len / self.sys_len).exp().min(1.0);
        bp * (log_sum / count as f64).exp()
    }

    /// Scale every count, for tuning's per-example multipliers.
    pub fn scale(&mut self, factor: f64) {
        for m in &mut self.matches {
            *m *= factor;
        }
        for t in &mut self.totals {
            *t *= factor;
        }
        self.ref_len *= factor;
        self.sys_len *= factor;
    }

    pub fn matches(&self) -> &[f64] {
        &self.matches
    }

    pub fn totals(&self) -> &[f64] {
        &self.totals
    }
}

impl AddAssign<&BleuStats> for BleuStats {
    fn add_assign(&mut self, rhs: &BleuStats) {
        for (m, r) in self.matches.iter_mut().zip(&rhs.matches) {
            *m += r;
        }
        for (t, r) in self.totals.iter_mut().zip(&rhs.totals) {
            *t += r;
        }
        self.ref_len += rhs.ref_len;
        self.sys_len += rhs.sys_len;
    }
}

/// N-gram counts of one sentence, cached under a caller id.
#[derive(Debug)]
struct CachedCounts {
    ngrams: HashMap<Sentence, f64>,
    len: usize,
}

/// BLEU measure with an n-gram cache. Single-writer: callers decoding in
/// parallel must partition cache ids or use separate evaluators.
pub struct BleuEvaluator {
    order: usize,
    smooth: f64,
    cache: HashMap<i64, Rc<CachedCounts>>,
}

impl Default for BleuEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_ORDER, 0.0)
    }
}

impl BleuEvaluator {
    pub fn new(order: usize, smooth: f64) -> Self {
        Self {
            order,
            smooth,
            cache: HashMap::new(),
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    fn extract_ngrams(&self, sent: &[WordId]) -> HashMap<Sentence, f64> {
        let mut out: HashMap<Sentence, f64> = HashMap::new();
        for i in 0..sent.len() {
            for n in 1..=self.order.min(sent.len() - i) {
                *out.entry(sent[i..i + n].to_vec()).or_insert(0.0) += 1.0;
            }
        }
        out
    }

    fn cached(&mut self, sent: &[WordId], cache_id: Option<i64>) -> Rc<CachedCounts> {
        if let Some(id) = cache_id {
            if let Some(hit) = self.cache.get(&id) {
                return Rc::clone(hit);
            }
        }
        let counts = Rc::new(CachedCounts {
            ngrams: self.extract_ngrams(sent),
            len: sent.len(),
        });
        if let Some(id) = cache_id {
            self.cache.insert(id, Rc::clone(&counts));
        }
        counts
    }

    /// Statistics of `sys` against `ref_sent`. Pass cache ids when the same
    /// sentence will be scored repeatedly.
    pub fn calculate_stats(
        &mut self,
        ref_sent: &[WordId],
        sys_sent: &[WordId],
        ref_cache_id: Option<i64>,
        sys_cache_id: Option<i64>,
    ) -> BleuStats {
        let ref_counts = self.cached(ref_sent, ref_cache_id);
        let sys_counts = self.cached(sys_sent, sys_cache_id);
        let mut stats = BleuStats::zero(self.order, self.smooth);
        stats.ref_len = ref_counts.len as f64;
        stats.sys_len = sys_counts.len as f64;
        for (ngram, &count) in &sys_counts.ngrams {
            let n = ngram.len() - 1;
            stats.totals[n] += count;
            if let Some(&ref_count) = ref_counts.ngrams.get(ngram) {
                stats.matches[n] += count.min(ref_count);
            }
        }
        stats
    }

    /// Sentence-level BLEU without caching.
    pub fn sentence_score(&mut self, ref_sent: &[WordId], sys_sent: &[WordId]) -> f64 {
        self.calculate_stats(ref_sent, sys_sent, None, None).score()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::Vocab;

    fn words(vocab: &Vocab, text: &str) -> Sentence {
        vocab.parse_words(text).unwrap()
    }

    #[test]
    fn identical_sentences_score_one() {
        let vocab = Vocab::new();
        let mut bleu = BleuEvaluator::default();
        let sent = words(&vocab, "the cat sat on the mat");
        assert_eq!(bleu.sentence_score(&sent, &sent), 1.0);
    }

    #[test]
    fn short_reference_still_scores_one_against_itself() {
        let vocab = Vocab::new();
        let mut bleu = BleuEvaluator::default();
        // Shorter than the n-gram order of 4.
        let sent = words(&vocab, "hi there");
        assert_eq!(bleu.sentence_score(&sent, &sent), 1.0);
    }

    #[test]
    fn disjoint_sentences_score_zero() {
        let vocab = Vocab::new();
        let mut bleu = BleuEvaluator::default();
        let r = words(&vocab, "the cat sat");
        let s = words(&vocab, "a dog ran");
        assert_eq!(bleu.sentence_score(&r, &s), 0.0);
    }

    #[test]
    fn brevity_penalty_punishes_short_output() {
        let vocab = Vocab::new();
        let mut bleu = BleuEvaluator::new(1, 0.0);
        let r = words(&vocab, "a b c d");
        let s = words(&vocab, "a b");
        // Unigram precision 1.0, BP = exp(1 - 4/2).
        let expected = (1.0f64 - 2.0).exp();
        let got = bleu.sentence_score(&r, &s);
        assert!((got - expected).abs() < 1e-12);
    }

    #[test]
    fn clipping_limits_repeated_matches() {
        let vocab = Vocab::new();
        let mut bleu = BleuEvaluator::new(1, 0.0);
        let r = words(&vocab, "a b");
        let s = words(&vocab, "a a a b");
        let stats = bleu.calculate_stats(&r, &s, None, None);
        // "a" matches once despite three occurrences.
        assert_eq!(stats.matches()[0], 2.0);
        assert_eq!(stats.totals()[0], 4.0);
    }

    #[test]
    fn corpus_stats_accumulate() {
        let vocab = Vocab::new();
        let mut bleu = BleuEvaluator::default();
        let r1 = words(&vocab, "the cat sat");
        let r2 = words(&vocab, "a dog ran");
        let mut total = bleu.calculate_stats(&r1, &r1, None, None);
        total += &bleu.calculate_stats(&r2, &r2, None, None);
        assert_eq!(total.score(), 1.0);
    }

    #[test]
    fn cache_ids_reuse_counts() {
        let vocab = Vocab::new();
        let mut bleu = BleuEvaluator::default();
        let r = words(&vocab, "the cat sat");
        let s = words(&vocab, "the cat sat");
        let first = bleu.calculate_stats(&r, &s, Some(7), None);
        // Same cache id with a different sentence returns the cached counts.
        let other = words(&vocab, "completely different words");
        let second = bleu.calculate_stats(&other, &s, Some(7), None);
        assert_eq!(first, second);
        bleu.clear_cache();
        let third = bleu.calculate_stats(&other, &s, Some(7), None);
        assert_eq!(third.score(), 0.0);
    }
}
