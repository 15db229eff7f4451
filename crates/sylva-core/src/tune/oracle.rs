//! Oracle extraction: the forest candidate closest to the reference.
//!
//! An n-gram model is built directly from the reference (each n-gram scored
//! `log count(ngram) - log count(context)`), written as ARPA to a fresh
//! temporary file, and used to re-decode the forest through the incremental
//! composer. The n-best candidate with the highest sentence BLEU wins.

use std::collections::BTreeMap;
use std::io::Write as _;

use tracing::debug;

use crate::compose::{ComposeError, LmComposerIncremental};
use crate::eval::BleuEvaluator;
use crate::features::SparseVector;
use crate::hypergraph::HyperGraph;
use crate::lm::{load_arpa, LmData, LmError, BOS, EOS};
use crate::vocab::{Sentence, Vocab, VocabError, WordId};

const ORACLE_ORDER: usize = 5;
const ORACLE_NBEST: usize = 10;
const UNK_LOGPROB: &str = "-99";

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Lm(#[from] LmError),

    #[error(transparent)]
    Vocab(#[from] VocabError),

    #[error(transparent)]
    Compose(#[from] ComposeError),
}

/// Render the reference's count-based model as ARPA text.
fn reference_arpa(vocab: &Vocab, ref_sent: &[WordId]) -> Result<String, OracleError> {
    let mut bordered: Sentence = Vec::with_capacity(ref_sent.len() + 2);
    bordered.push(vocab.intern(BOS)?);
    bordered.extend_from_slice(ref_sent);
    bordered.push(vocab.intern(EOS)?);

    // counts[n] maps n-length word sequences to occurrence counts;
    // counts[0] holds the empty context's total.
    let mut counts: Vec<BTreeMap<Sentence, u64>> = vec![BTreeMap::new(); ORACLE_ORDER + 1];
    let mut act_order = 0;
    for i in 0..bordered.len() {
        let mut curr = Sentence::new();
        for n in 0..=ORACLE_ORDER {
            *counts[n].entry(curr.clone()).or_insert(0) += 1;
            act_order = act_order.max(n);
            if i + n >= bordered.len() {
                break;
            }
            curr.push(bordered[i + n]);
        }
    }

    let mut out = String::from("\\data\\\n");
    for n in 1..=act_order {
        let size = counts[n].len() + usize::from(n == 1);
        out.push_str(&format!("ngram {n}={size}\n"));
    }
    for n in 1..=act_order {
        if n != 1 && counts[n].is_empty() {
            break;
        }
        out.push_str(&format!("\n\\{n}-grams:\n"));
        if n == 1 {
            out.push_str(&format!("{UNK_LOGPROB}\t<unk>\t{UNK_LOGPROB}\n"));
        }
        let context_counts = std::mem::take(&mut counts[n - 1]);
        for (ngram, &count) in &counts[n] {
            let context = &ngram[..n - 1];
            let denom = context_counts[context] as f64;
            let logprob = (count as f64).ln() - denom.ln();
            out.push_str(&format!("{logprob}\t{}", vocab.print_words(ngram)));
            if n != act_order {
                out.push_str(&format!("\t{UNK_LOGPROB}"));
            }
            out.push('\n');
        }
    }
    out.push_str("\\end\\\n");
    Ok(out)
}

/// Decode `graph` against a model of `ref_sent` and return the candidate
/// with the highest sentence BLEU. Ties keep the earlier candidate.
pub fn calculate_oracle(
    vocab: &Vocab,
    evaluator: &mut BleuEvaluator,
    graph: &HyperGraph,
    ref_sent: &[WordId],
) -> Result<Sentence, OracleError> {
    let arpa = reference_arpa(vocab, ref_sent)?;

    // A unique path per call; concurrent tuning runs must not collide.
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(arpa.as_bytes())?;
    file.flush()?;
    let lm = load_arpa(file.path())?;

    let lm_data =
        LmData::new(lm, vocab, 1.0, 0.0).with_feature(vocab, "oraclelm", "oraclelmunk");

    // Strip model scores so only the oracle model steers the search.
    let mut rescored = HyperGraph::new();
    rescored.set_words(graph.words().clone());
    rescored.append(graph);
    rescored.score_edges(&SparseVector::new());

    let composer = LmComposerIncremental::new(vocab, vec![lm_data])?;
    let lm_graph = composer.transform(&rescored);

    let mut best = Sentence::new();
    let mut best_score = 0.0;
    for entry in lm_graph.nbest(ORACLE_NBEST) {
        let score = evaluator
            .calculate_stats(ref_sent, &entry.words, None, None)
            .score();
        if score > best_score {
            best = entry.words;
            best_score = score;
        }
    }
    debug!(score = best_score, "oracle candidate selected");
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{CfgData, CfgDataVector};
    use crate::lm::parse_arpa;

    fn leaf_trg(words: Sentence) -> CfgDataVector {
        vec![CfgData::new(words, 0, vec![])]
    }

    /// A forest whose root offers two complete candidate sentences.
    fn two_candidate_forest(vocab: &Vocab, a: &str, b: &str) -> HyperGraph {
        let s = vocab.intern("S").unwrap();
        let mut hg = HyperGraph::new();
        let root = hg.add_node((0, 3), s);
        let wa = vocab.parse_words(a).unwrap();
        let wb = vocab.parse_words(b).unwrap();
        hg.add_edge(root, vec![], None, SparseVector::new(), leaf_trg(wa), 0.0);
        hg.add_edge(root, vec![], None, SparseVector::new(), leaf_trg(wb), 0.0);
        hg
    }

    #[test]
    fn reference_arpa_is_loadable_and_counts_ratios() {
        let vocab = Vocab::new();
        let ref_sent = vocab.parse_words("the cat sat").unwrap();
        let arpa = reference_arpa(&vocab, &ref_sent).unwrap();
        let lm = parse_arpa(&arpa).unwrap();
        // Orders up to the bordered length (5 words).
        assert_eq!(lm.order(), ORACLE_ORDER);
        // P(the) = log(1/5).
        let the = lm.index("the");
        assert!((lm.logprob(&[], the) - (1.0f64 / 5.0).ln()).abs() < 1e-9);
        // P(cat | the) = log(1/1) = 0.
        let cat = lm.index("cat");
        assert!((lm.logprob(&[the], cat)).abs() < 1e-9);
    }

    #[test]
    fn oracle_prefers_the_reference_candidate() {
        let vocab = Vocab::new();
        let ref_sent = vocab.parse_words("the cat sat").unwrap();
        let forest = two_candidate_forest(&vocab, "a dog ran", "the cat sat");
        let mut bleu = BleuEvaluator::default();
        let oracle = calculate_oracle(&vocab, &mut bleu, &forest, &ref_sent).unwrap();
        assert_eq!(vocab.print_words(&oracle), "the cat sat");
    }

    #[test]
    fn oracle_on_empty_forest_is_empty() {
        let vocab = Vocab::new();
        let ref_sent = vocab.parse_words("the cat sat").unwrap();
        let mut bleu = BleuEvaluator::default();
        let oracle =
            calculate_oracle(&vocab, &mut bleu, &HyperGraph::new(), &ref_sent).unwrap();
        assert!(oracle.is_empty());
    }
}
