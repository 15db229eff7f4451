//! One tuning example backed by a decoded forest.
//!
//! Hypergraphs from successive decoder runs are merged under a shared root
//! so line search explores all of them at once. The example exposes the
//! oracle score, the potential gain under current weights, and the convex
//! hull for a search direction.

use std::collections::BTreeSet;

use tracing::warn;

use crate::eval::{BleuEvaluator, BleuStats};
use crate::features::SparseVector;
use crate::grammar::CfgData;
use crate::hypergraph::{HyperGraph, NodeId};
use crate::vocab::{slot_id, Sentence, Vocab, WordId};

use super::hull::{MertHull, MertHullWeightFunction};
use super::oracle::calculate_oracle;
use super::ConvexHull;

/// Zero-width interval half-width used to pin the current hypothesis'
/// score at `t = 0`.
const EPS: f64 = f64::MIN_POSITIVE;

pub struct ForestTuningExample {
    forest: Option<HyperGraph>,
    ref_sent: Sentence,
    cache_id: i64,
    /// Sign multiplier for the measure (1 to maximise, -1 to minimise).
    mult: f64,
    oracle_score: f64,
    active: BTreeSet<WordId>,
}

impl ForestTuningExample {
    pub fn new(ref_sent: Sentence, cache_id: i64) -> Self {
        Self {
            forest: None,
            ref_sent,
            cache_id,
            mult: 1.0,
            oracle_score: 0.0,
            active: BTreeSet::new(),
        }
    }

    pub fn with_mult(mut self, mult: f64) -> Self {
        self.mult = mult;
        self
    }

    /// Merge a decoded hypergraph into the shared forest: append it and hang
    /// its root off the combined root node.
    pub fn add_hypothesis(&mut self, hg: &HyperGraph) {
        let forest = self.forest.get_or_insert_with(|| {
            let mut f = HyperGraph::new();
            f.set_words(hg.words().clone());
            f.add_node((0, hg.words().len()), -1);
            f
        });
        if hg.is_empty() {
            return;
        }
        let child = forest.append(hg);
        let sym = forest.node(child).sym;
        let trg = vec![CfgData::new(vec![slot_id(0)], sym, vec![sym])];
        forest.add_edge(0, vec![child], None, SparseVector::new(), trg, 0.0);
    }

    /// Collect every feature appearing anywhere in the forest.
    pub fn find_active_features(&mut self) {
        self.active.clear();
        if let Some(forest) = &self.forest {
            for edge in forest.edges() {
                for (id, _) in edge.features.iter() {
                    self.active.insert(id);
                }
            }
        }
    }

    /// Compute and store the oracle score. Failures are logged and the score
    /// defaults to the multiplier, so line search keeps a well-defined gain.
    pub fn calculate_oracle(&mut self, vocab: &Vocab, evaluator: &mut BleuEvaluator) {
        let Some(forest) = &self.forest else {
            self.oracle_score = self.mult;
            return;
        };
        match calculate_oracle(vocab, evaluator, forest, &self.ref_sent) {
            Ok(sent) => {
                self.oracle_score = evaluator
                    .calculate_stats(&self.ref_sent, &sent, Some(self.cache_id), None)
                    .score()
                    * self.mult;
            }
            Err(e) => {
                warn!(error = %e, "oracle calculation failed, defaulting to 1");
                self.oracle_score = self.mult;
            }
        }
    }

    pub fn oracle_score(&self) -> f64 {
        self.oracle_score
    }

    /// Gain still available over the current hypothesis, spread over every
    /// active feature.
    pub fn calculate_potential_gain(
        &mut self,
        evaluator: &mut BleuEvaluator,
        weights: &SparseVector,
    ) -> SparseVector {
        let curr = self.current_stats(evaluator, weights).score() * self.mult;
        self.oracle_score = self.oracle_score.max(curr);
        let gain = self.oracle_score - curr;
        if self.active.is_empty() {
            self.find_active_features();
        }
        self.active.iter().map(|&id| (id, gain)).collect()
    }

    /// Score the forest's 1-best under `weights` against the reference.
    fn current_stats(&mut self, evaluator: &mut BleuEvaluator, weights: &SparseVector) -> BleuStats {
        let sent = match &mut self.forest {
            Some(forest) => {
                forest.score_edges(weights);
                forest
                    .nbest(1)
                    .into_iter()
                    .next()
                    .map(|e| e.words)
                    .unwrap_or_default()
            }
            None => Sentence::new(),
        };
        let mut stats =
            evaluator.calculate_stats(&self.ref_sent, &sent, Some(self.cache_id), None);
        stats.scale(self.mult);
        stats
    }

    /// The convex hull of evaluation scores along `gradient` from `weights`.
    ///
    /// When the gradient touches no active feature the hull is a single
    /// infinite span at the current score. A segment containing `t = 0` is
    /// split so the current hypothesis occupies a zero-width interval there.
    pub fn calculate_convex_hull(
        &mut self,
        evaluator: &mut BleuEvaluator,
        weights: &SparseVector,
        gradient: &SparseVector,
    ) -> ConvexHull {
        let curr_stats = self.current_stats(evaluator, weights);

        let active = self.active.is_empty()
            || gradient.iter().any(|(id, _)| self.active.contains(&id));
        let Some(forest) = &self.forest else {
            return vec![((f64::MIN, f64::MAX), curr_stats)];
        };
        if !active || forest.is_empty() {
            return vec![((f64::MIN, f64::MAX), curr_stats)];
        }

        let func = MertHullWeightFunction::new(weights.clone(), gradient.clone());
        let mut hulls: Vec<Option<std::rc::Rc<MertHull>>> = vec![None; forest.num_nodes()];
        let root_hull = calc_hull(forest, &func, &mut hulls, 0);

        let mut out = ConvexHull::new();
        let segments = root_hull.segments();
        for (i, (x, line)) in segments.iter().enumerate() {
            let sent = line.construct_translation(forest);
            let mut stats =
                evaluator.calculate_stats(&self.ref_sent, &sent, Some(self.cache_id), None);
            stats.scale(self.mult);
            let next = segments.get(i + 1).map(|(nx, _)| *nx).unwrap_or(f64::MAX);
            let x = pos_zero(*x);
            let next = pos_zero(next);
            if x < 0.0 && 0.0 < next {
                // The segment straddles the current weights.
                out.push(((x + EPS, -EPS), stats.clone()));
                out.push(((-EPS, EPS), curr_stats.clone()));
                out.push(((EPS, next - EPS), stats));
            } else {
                if x == 0.0 {
                    out.push(((-EPS, EPS), curr_stats.clone()));
                }
                out.push(((x + EPS, next - EPS), stats));
            }
        }
        out
    }
}

/// Memoised inside recursion:
/// `Hull(n) = sum over edges e of (Line(e) * prod over tails Hull(tail))`.
fn calc_hull(
    forest: &HyperGraph,
    func: &MertHullWeightFunction,
    hulls: &mut Vec<Option<std::rc::Rc<MertHull>>>,
    node: NodeId,
) -> std::rc::Rc<MertHull> {
    if let Some(h) = &hulls[node] {
        return std::rc::Rc::clone(h);
    }
    let mut total = MertHull::new();
    for &eid in &forest.node(node).edges {
        let mut h = func.line_of(forest, eid);
        for &tail in &forest.edge(eid).tails {
            let tail_hull = calc_hull(forest, func, hulls, tail);
            h.multiply(&tail_hull);
        }
        total.add(&h);
    }
    let total = std::rc::Rc::new(total);
    hulls[node] = Some(std::rc::Rc::clone(&total));
    total
}

fn pos_zero(x: f64) -> f64 {
    if x == -0.0 {
        0.0
    } else {
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::parse_weights;
    use crate::grammar::CfgDataVector;

    fn leaf_trg(words: Sentence) -> CfgDataVector {
        vec![CfgData::new(words, 0, vec![])]
    }

    /// A decoded "forest" with one candidate sentence carrying one feature.
    fn candidate_graph(vocab: &Vocab, text: &str, feature: &str) -> HyperGraph {
        let s = vocab.intern("S").unwrap();
        let mut hg = HyperGraph::new();
        hg.set_words(vocab.parse_words(text).unwrap());
        let root = hg.add_node((0, 3), s);
        let words = vocab.parse_words(text).unwrap();
        let mut feats = SparseVector::new();
        feats.add(vocab.intern(feature).unwrap(), 1.0);
        hg.add_edge(root, vec![], None, feats, leaf_trg(words), 0.0);
        hg
    }

    fn example(vocab: &Vocab) -> ForestTuningExample {
        let ref_sent = vocab.parse_words("the cat sat").unwrap();
        let mut ex = ForestTuningExample::new(ref_sent, 1);
        ex.add_hypothesis(&candidate_graph(vocab, "the cat sat", "good"));
        ex.add_hypothesis(&candidate_graph(vocab, "a dog ran", "bad"));
        ex.find_active_features();
        ex
    }

    #[test]
    fn potential_gain_spans_active_features() {
        let vocab = Vocab::new();
        let mut ex = example(&vocab);
        let mut bleu = BleuEvaluator::default();
        ex.calculate_oracle(&vocab, &mut bleu);
        assert!((ex.oracle_score() - 1.0).abs() < 1e-9);

        // Weights that prefer the bad candidate leave the full gain open.
        let weights = parse_weights(&vocab, "bad 1.0").unwrap();
        let gain = ex.calculate_potential_gain(&mut bleu, &weights);
        let good = vocab.get("good").unwrap();
        let bad = vocab.get("bad").unwrap();
        assert!((gain.get(good) - 1.0).abs() < 1e-9);
        assert!((gain.get(bad) - 1.0).abs() < 1e-9);

        // Weights already picking the oracle leave nothing.
        let weights = parse_weights(&vocab, "good 1.0").unwrap();
        let gain = ex.calculate_potential_gain(&mut bleu, &weights);
        assert_eq!(gain.get(good), 0.0);
    }

    #[test]
    fn convex_hull_tracks_the_crossover() {
        let vocab = Vocab::new();
        let mut ex = example(&vocab);
        let mut bleu = BleuEvaluator::default();
        // Score = t * good - t * bad + 1 * bad at weights (bad=1):
        // candidate "good" line: m=1, b=0; candidate "bad": m=-1, b=1.
        let weights = parse_weights(&vocab, "bad 1.0").unwrap();
        let gradient = parse_weights(&vocab, "good 1.0\nbad -1.0").unwrap();
        let hull = ex.calculate_convex_hull(&mut bleu, &weights, &gradient);

        // Bad wins below the crossover at t = 0.5, good above; the segment
        // containing t = 0 is split around the current hypothesis.
        assert_eq!(hull.len(), 4);
        assert_eq!(hull[1].1.score(), 0.0); // current hypothesis: "a dog ran"
        assert_eq!(hull[0].1.score(), 0.0);
        assert_eq!(hull[3].1.score(), 1.0);
        let boundary = hull[3].0 .0;
        assert!((boundary - 0.5).abs() < 1e-6);
    }

    #[test]
    fn inactive_gradient_gives_a_single_span() {
        let vocab = Vocab::new();
        let mut ex = example(&vocab);
        let mut bleu = BleuEvaluator::default();
        let weights = parse_weights(&vocab, "good 1.0").unwrap();
        let gradient = parse_weights(&vocab, "unrelated 1.0").unwrap();
        let hull = ex.calculate_convex_hull(&mut bleu, &weights, &gradient);
        assert_eq!(hull.len(), 1);
        assert_eq!(hull[0].0, (f64::MIN, f64::MAX));
        // Current best is the oracle, so the span scores 1.
        assert_eq!(hull[0].1.score(), 1.0);
    }

    #[test]
    fn empty_example_still_produces_a_hull() {
        let vocab = Vocab::new();
        let ref_sent = vocab.parse_words("the cat sat").unwrap();
        let mut ex = ForestTuningExample::new(ref_sent, 2);
        let mut bleu = BleuEvaluator::default();
        let hull =
            ex.calculate_convex_hull(&mut bleu, &SparseVector::new(), &SparseVector::new());
        assert_eq!(hull.len(), 1);
        assert_eq!(hull[0].1.score(), 0.0);
    }
}
