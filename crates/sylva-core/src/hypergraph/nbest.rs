//! Lazy k-best derivation extraction.
//!
//! Per-node ranked derivation lists grown on demand from a candidate heap
//! (Huang & Chiang style). Results come out in non-increasing score order;
//! ties resolve toward lower edge ids, then lower child ranks, so repeated
//! runs are identical.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashSet;

use super::{EdgeId, HyperGraph, NodeId};
use crate::features::SparseVector;
use crate::vocab::{slot_index, Sentence};

/// One entry of an n-best list.
#[derive(Debug, Clone)]
pub struct NbestEntry {
    pub score: f64,
    /// Target words, reconstructed by substituting tail words into each
    /// edge's target template (factor 0).
    pub words: Sentence,
    /// Sum of the derivation's edge features.
    pub features: SparseVector,
    /// Derivation edges in pre-order.
    pub edges: Vec<EdgeId>,
}

#[derive(Debug, Clone, PartialEq)]
struct Deriv {
    score: f64,
    edge: EdgeId,
    child_ranks: Vec<usize>,
}

struct HeapItem(Deriv);

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .score
            .partial_cmp(&other.0.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.0.edge.cmp(&self.0.edge))
            .then_with(|| other.0.child_ranks.cmp(&self.0.child_ranks))
    }
}

#[derive(Default)]
struct NodeState {
    initialized: bool,
    derivs: Vec<Deriv>,
    cand: BinaryHeap<HeapItem>,
    seen: HashSet<(EdgeId, Vec<usize>)>,
}

struct KBest<'a> {
    hg: &'a HyperGraph,
    states: Vec<NodeState>,
}

impl<'a> KBest<'a> {
    fn new(hg: &'a HyperGraph) -> Self {
        let states = (0..hg.num_nodes()).map(|_| NodeState::default()).collect();
        Self { hg, states }
    }

    /// Score of a candidate derivation, or None if some child rank does not
    /// exist.
    fn candidate_score(&mut self, edge: EdgeId, ranks: &[usize]) -> Option<f64> {
        let mut score = self.hg.edge(edge).score;
        for (slot, &rank) in ranks.iter().enumerate() {
            let tail = self.hg.edge(edge).tails[slot];
            score += self.kth(tail, rank)?.score;
        }
        Some(score)
    }

    /// The rank-th best derivation of `node`, growing the list lazily.
    fn kth(&mut self, node: NodeId, rank: usize) -> Option<Deriv> {
        if !self.states[node].initialized {
            self.states[node].initialized = true;
            for eid in self.hg.node(node).edges.clone() {
                let ranks = vec![0; self.hg.edge(eid).tails.len()];
                if let Some(score) = self.candidate_score(eid, &ranks) {
                    self.states[node].seen.insert((eid, ranks.clone()));
                    self.states[node].cand.push(HeapItem(Deriv {
                        score,
                        edge: eid,
                        child_ranks: ranks,
                    }));
                }
            }
        }
        while self.states[node].derivs.len() <= rank {
            let best = self.states[node].cand.pop()?.0;
            // Each popped derivation spawns one successor per child slot.
            for slot in 0..best.child_ranks.len() {
                let mut ranks = best.child_ranks.clone();
                ranks[slot] += 1;
                if self.states[node].seen.contains(&(best.edge, ranks.clone())) {
                    continue;
                }
                if let Some(score) = self.candidate_score(best.edge, &ranks) {
                    self.states[node].seen.insert((best.edge, ranks.clone()));
                    self.states[node].cand.push(HeapItem(Deriv {
                        score,
                        edge: best.edge,
                        child_ranks: ranks,
                    }));
                }
            }
            self.states[node].derivs.push(best);
        }
        self.states[node].derivs.get(rank).cloned()
    }

    /// Materialise a ranked derivation into words, features and edge list.
    fn realize(&mut self, node: NodeId, rank: usize, entry: &mut NbestEntry) {
        let deriv = match self.states[node].derivs.get(rank) {
            Some(d) => d.clone(),
            None => return,
        };
        entry.edges.push(deriv.edge);
        let edge = self.hg.edge(deriv.edge);
        entry.features += &edge.features;
        let template = match edge.trg.first() {
            Some(t) => t.words.clone(),
            None => Vec::new(),
        };
        for word in template {
            if word >= 0 {
                entry.words.push(word);
            } else {
                let slot = slot_index(word);
                let tail = edge.tails[slot];
                self.realize(tail, deriv.child_ranks[slot], entry);
            }
        }
    }
}

impl HyperGraph {
    /// Extract up to `k` best derivations rooted at node 0, in
    /// non-increasing score order.
    pub fn nbest(&self, k: usize) -> Vec<NbestEntry> {
        if self.is_empty() || k == 0 {
            return Vec::new();
        }
        let mut kbest = KBest::new(self);
        let mut out = Vec::new();
        for rank in 0..k {
            let deriv = match kbest.kth(0, rank) {
                Some(d) => d,
                None => break,
            };
            let mut entry = NbestEntry {
                score: deriv.score,
                words: Sentence::new(),
                features: SparseVector::new(),
                edges: Vec::new(),
            };
            kbest.realize(0, rank, &mut entry);
            out.push(entry);
        }
        out
    }
}
