//! Weighted hypergraph of partial translations.
//!
//! The graph is an arena: it owns its nodes and edges, and heads/tails are
//! integer ids into it (valid only for the lifetime of the graph). Node 0 is
//! the root by convention. The graph is acyclic by construction since spans
//! strictly decompose, so Viterbi scores can be memoised top-down.

mod nbest;

pub use nbest::NbestEntry;

use crate::features::SparseVector;
use crate::grammar::trie::RuleRef;
use crate::grammar::CfgDataVector;
use crate::vocab::{Sentence, WordId};

pub type NodeId = usize;
pub type EdgeId = usize;

#[derive(Debug, Clone)]
pub struct HyperNode {
    pub id: NodeId,
    pub span: (usize, usize),
    pub sym: WordId,
    /// Incoming edges, in insertion order.
    pub edges: Vec<EdgeId>,
}

#[derive(Debug, Clone)]
pub struct HyperEdge {
    pub id: EdgeId,
    pub head: NodeId,
    pub tails: Vec<NodeId>,
    /// Originating rule, when the edge came from a grammar lookup.
    pub rule: Option<RuleRef>,
    pub features: SparseVector,
    pub score: f64,
    /// Target templates, one per factor; slot k substitutes `tails[k]`.
    pub trg: CfgDataVector,
}

#[derive(Debug, Default)]
pub struct HyperGraph {
    nodes: Vec<HyperNode>,
    edges: Vec<HyperEdge>,
    words: Sentence,
    viterbi: Vec<Option<f64>>,
}

impl HyperGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn words(&self) -> &Sentence {
        &self.words
    }

    pub fn set_words(&mut self, words: Sentence) {
        self.words = words;
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &HyperNode {
        &self.nodes[id]
    }

    pub fn edge(&self, id: EdgeId) -> &HyperEdge {
        &self.edges[id]
    }

    pub fn nodes(&self) -> &[HyperNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[HyperEdge] {
        &self.edges
    }

    /// Append a node, returning its id.
    pub fn add_node(&mut self, span: (usize, usize), sym: WordId) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(HyperNode {
            id,
            span,
            sym,
            edges: Vec::new(),
        });
        self.viterbi.push(None);
        id
    }

    /// Append an edge with the given score and register it on its head node.
    pub fn add_edge(
        &mut self,
        head: NodeId,
        tails: Vec<NodeId>,
        rule: Option<RuleRef>,
        features: SparseVector,
        trg: CfgDataVector,
        score: f64,
    ) -> EdgeId {
        debug_assert!(head < self.nodes.len());
        debug_assert!(tails.iter().all(|&t| t < self.nodes.len()));
        let id = self.edges.len();
        self.edges.push(HyperEdge {
            id,
            head,
            tails,
            rule,
            features,
            score,
            trg,
        });
        self.nodes[head].edges.push(id);
        self.viterbi[head] = None;
        id
    }

    /// Recompute every edge score as `weights · features`. Invalidates the
    /// Viterbi cache. An empty weight map zeroes all scores.
    pub fn score_edges(&mut self, weights: &SparseVector) {
        for edge in &mut self.edges {
            edge.score = weights.dot(&edge.features);
        }
        self.reset_viterbi();
    }

    /// Mark all memoised Viterbi scores stale.
    pub fn reset_viterbi(&mut self) {
        for v in &mut self.viterbi {
            *v = None;
        }
    }

    /// Inside Viterbi score of `node`:
    /// `V(n) = max over incoming e of (score(e) + sum of V(tails(e)))`,
    /// with ties resolved toward the lower edge id. A node with no incoming
    /// edges scores negative infinity.
    pub fn viterbi_score(&mut self, node: NodeId) -> f64 {
        if let Some(v) = self.viterbi[node] {
            return v;
        }
        // Post-order over the untouched part of the DAG; tails always
        // resolve before their head is popped a second time.
        let mut stack = vec![(node, false)];
        while let Some((id, expanded)) = stack.pop() {
            if self.viterbi[id].is_some() {
                continue;
            }
            if expanded {
                let mut best = f64::NEG_INFINITY;
                for &eid in &self.nodes[id].edges {
                    let edge = &self.edges[eid];
                    let mut score = edge.score;
                    for &tail in &edge.tails {
                        score += self.viterbi[tail].unwrap_or(f64::NEG_INFINITY);
                    }
                    if score > best {
                        best = score;
                    }
                }
                self.viterbi[id] = Some(best);
            } else {
                stack.push((id, true));
                for &eid in &self.nodes[id].edges {
                    for &tail in &self.edges[eid].tails {
                        if self.viterbi[tail].is_none() {
                            stack.push((tail, false));
                        }
                    }
                }
            }
        }
        self.viterbi[node].unwrap_or(f64::NEG_INFINITY)
    }

    /// Pin a node's Viterbi score without recomputation. Used by composers
    /// that already know the completed score.
    pub(crate) fn set_viterbi_score(&mut self, node: NodeId, score: f64) {
        self.viterbi[node] = Some(score);
    }

    /// Deep-copy `other` into this graph, shifting every id by a fixed
    /// offset. Returns the id of `other`'s root in the combined graph.
    pub fn append(&mut self, other: &HyperGraph) -> NodeId {
        let node_offset = self.nodes.len();
        let edge_offset = self.edges.len();
        for node in &other.nodes {
            self.nodes.push(HyperNode {
                id: node.id + node_offset,
                span: node.span,
                sym: node.sym,
                edges: node.edges.iter().map(|&e| e + edge_offset).collect(),
            });
            self.viterbi.push(None);
        }
        for edge in &other.edges {
            self.edges.push(HyperEdge {
                id: edge.id + edge_offset,
                head: edge.head + node_offset,
                tails: edge.tails.iter().map(|&t| t + node_offset).collect(),
                rule: edge.rule,
                features: edge.features.clone(),
                score: edge.score,
                trg: edge.trg.clone(),
            });
        }
        node_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::CfgData;
    use crate::vocab::{slot_id, Vocab};

    fn leaf_trg(word: WordId) -> CfgDataVector {
        vec![CfgData::new(vec![word], 0, vec![])]
    }

    fn hole_trg(slots: usize) -> CfgDataVector {
        vec![CfgData::new(
            (0..slots).map(slot_id).collect(),
            0,
            vec![0; slots],
        )]
    }

    /// root <- {a (1.0), b (2.0)} with no tails.
    fn two_leaf_graph(vocab: &Vocab) -> HyperGraph {
        let mut hg = HyperGraph::new();
        let root = hg.add_node((0, 1), 0);
        let a = vocab.intern("a").unwrap();
        let b = vocab.intern("b").unwrap();
        hg.add_edge(root, vec![], None, SparseVector::new(), leaf_trg(a), 1.0);
        hg.add_edge(root, vec![], None, SparseVector::new(), leaf_trg(b), 2.0);
        hg
    }

    #[test]
    fn viterbi_takes_the_best_edge() {
        let vocab = Vocab::new();
        let mut hg = two_leaf_graph(&vocab);
        assert_eq!(hg.viterbi_score(0), 2.0);
    }

    #[test]
    fn viterbi_sums_over_tails() {
        let vocab = Vocab::new();
        let a = vocab.intern("a").unwrap();
        let mut hg = HyperGraph::new();
        let root = hg.add_node((0, 2), 0);
        let left = hg.add_node((0, 1), 0);
        let right = hg.add_node((1, 2), 0);
        hg.add_edge(left, vec![], None, SparseVector::new(), leaf_trg(a), 1.5);
        hg.add_edge(right, vec![], None, SparseVector::new(), leaf_trg(a), 0.5);
        hg.add_edge(
            root,
            vec![left, right],
            None,
            SparseVector::new(),
            hole_trg(2),
            0.25,
        );
        assert_eq!(hg.viterbi_score(root), 2.25);
    }

    #[test]
    fn score_edges_matches_dot_product_and_is_idempotent() {
        let vocab = Vocab::new();
        let p = vocab.intern("p").unwrap();
        let mut hg = HyperGraph::new();
        let root = hg.add_node((0, 1), 0);
        let mut feats = SparseVector::new();
        feats.add(p, 2.0);
        let a = vocab.intern("a").unwrap();
        hg.add_edge(root, vec![], None, feats, leaf_trg(a), 0.0);

        let mut weights = SparseVector::new();
        weights.add(p, 1.5);
        hg.score_edges(&weights);
        assert_eq!(hg.edge(0).score, 3.0);
        hg.score_edges(&weights);
        assert_eq!(hg.edge(0).score, 3.0);

        // An empty weight map leaves scores at zero.
        hg.score_edges(&SparseVector::new());
        assert_eq!(hg.edge(0).score, 0.0);
    }

    #[test]
    fn append_shifts_ids_uniformly() {
        let vocab = Vocab::new();
        let sub = two_leaf_graph(&vocab);
        let mut hg = HyperGraph::new();
        hg.add_node((0, 1), 0);
        let root_a = hg.append(&sub);
        let root_b = hg.append(&sub);
        assert_eq!(root_a, 1);
        assert_eq!(root_b, 2);
        assert_eq!(hg.num_edges(), 4);
        // Structure preserved: both copies have two incoming edges whose
        // heads point back at the copied root.
        for root in [root_a, root_b] {
            assert_eq!(hg.node(root).edges.len(), 2);
            for &eid in &hg.node(root).edges {
                assert_eq!(hg.edge(eid).head, root);
                assert!(hg.edge(eid).tails.is_empty());
            }
        }
    }

    #[test]
    fn empty_graph_behaves() {
        let mut hg = HyperGraph::new();
        hg.score_edges(&SparseVector::new());
        assert!(hg.is_empty());
        assert!(hg.nbest(5).is_empty());
    }
}
