//! Incremental LM composition over an existing translation hypergraph.
//!
//! Where the chart decoder folds the LM in while parsing, this composer takes
//! a finished (non-LM) hypergraph and intersects it with exactly one model:
//! per parse node a best-first generator expands (edge, child-rank)
//! combinations, recombining by LM state into output nodes; a final root
//! vertex closes the sentence with `<s> ... </s>` and lands at node 0.
//!
//! The LM feature written on each output edge is back-computed from the edge
//! score, preserving the contract
//! `lm = (edge_score - oov * unk_weight - base_score) / lm_weight`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;

use tracing::warn;

use crate::grammar::CfgData;
use crate::hypergraph::{EdgeId, HyperGraph, NodeId};
use crate::lm::{ChartState, LmData};
use crate::vocab::{slot_id, Vocab, VocabError, WordId};

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("incremental composition supports exactly one language model, got {0}")]
    ModelCount(usize),

    #[error(transparent)]
    Vocab(#[from] VocabError),
}

/// One surviving alternative of a composed vertex.
#[derive(Debug, Clone)]
struct Alt {
    node: NodeId,
    state: ChartState,
    score: f64,
}

pub struct LmComposerIncremental<'a> {
    vocab: &'a Vocab,
    lm: LmData,
    root_sym: WordId,
    /// Maximum alternatives kept per vertex.
    edge_limit: usize,
    /// Maximum generator pops per vertex; `None` is unbounded.
    pop_limit: Option<usize>,
}

impl<'a> LmComposerIncremental<'a> {
    pub fn new(vocab: &'a Vocab, mut lms: Vec<LmData>) -> Result<Self, ComposeError> {
        if lms.len() != 1 {
            return Err(ComposeError::ModelCount(lms.len()));
        }
        let root_sym = vocab.intern("S")?;
        Ok(Self {
            vocab,
            lm: lms.remove(0),
            root_sym,
            edge_limit: 1000,
            pop_limit: None,
        })
    }

    pub fn with_limits(mut self, edge_limit: usize, pop_limit: Option<usize>) -> Self {
        self.edge_limit = edge_limit;
        self.pop_limit = pop_limit;
        self
    }

    /// Intersect `parse` with the model. Returns an empty graph when the
    /// input is empty or nothing survives at the root.
    pub fn transform(&self, parse: &HyperGraph) -> HyperGraph {
        if parse.is_empty() {
            return HyperGraph::new();
        }
        let mut out = HyperGraph::new();
        out.set_words(parse.words().clone());
        let root_span = parse.node(0).span;
        let root = out.add_node(root_span, self.root_sym);
        debug_assert_eq!(root, 0);

        let mut memo: Vec<Option<Rc<Vec<Alt>>>> = vec![None; parse.num_nodes()];
        let alts = self.vertex(parse, &mut out, &mut memo, 0);
        if alts.is_empty() {
            return HyperGraph::new();
        }

        // Root vertex: wrap the top-level alternatives in sentence
        // boundaries.
        for alt in alts.iter() {
            let final_score = self.lm.calc_final_score(&alt.state);
            let mut features = crate::features::SparseVector::new();
            if final_score != 0.0 {
                features.add(self.lm.feature, final_score);
            }
            let sym = out.node(alt.node).sym;
            let trg = vec![CfgData::new(vec![slot_id(0)], self.root_sym, vec![sym])];
            out.add_edge(
                0,
                vec![alt.node],
                None,
                features,
                trg,
                final_score * self.lm.weight,
            );
        }
        out
    }

    /// Compose one parse node, memoised. Returns its ranked alternatives.
    fn vertex(
        &self,
        parse: &HyperGraph,
        out: &mut HyperGraph,
        memo: &mut Vec<Option<Rc<Vec<Alt>>>>,
        id: NodeId,
    ) -> Rc<Vec<Alt>> {
        if let Some(alts) = &memo[id] {
            return Rc::clone(alts);
        }

        // Resolve every child vertex first; an edge with an empty child is
        // discarded.
        struct EdgeCand {
            edge: EdgeId,
            children: Vec<Rc<Vec<Alt>>>,
            oov: i64,
        }
        let mut cands: Vec<EdgeCand> = Vec::new();
        for &eid in &parse.node(id).edges {
            let edge = parse.edge(eid);
            let mut children = Vec::with_capacity(edge.tails.len());
            let mut empty = false;
            for &tail in &edge.tails {
                let alts = self.vertex(parse, out, memo, tail);
                if alts.is_empty() {
                    empty = true;
                    break;
                }
                children.push(alts);
            }
            if empty {
                continue;
            }
            cands.push(EdgeCand {
                edge: eid,
                children,
                oov: 0,
            });
        }

        let mut queue: BinaryHeap<GenItem> = BinaryHeap::new();
        let mut seq = 0u64;
        for (cid, cand) in cands.iter_mut().enumerate() {
            let ranks = vec![0usize; cand.children.len()];
            if let Some((score, state, oov)) =
                self.score_combination(parse, cand.edge, &cand.children, &ranks)
            {
                cand.oov = oov;
                queue.push(GenItem {
                    score,
                    seq,
                    cand: cid,
                    ranks,
                    state,
                });
                seq += 1;
            }
        }

        let mut recomb: HashMap<ChartState, usize> = HashMap::new();
        let mut alts: Vec<Alt> = Vec::new();
        // (tail out-nodes, source edge) pairs already materialised.
        let mut edge_memo: HashMap<(Vec<NodeId>, EdgeId), f64> = HashMap::new();
        let mut num_popped = 0usize;

        loop {
            if self.pop_limit.is_some_and(|l| num_popped >= l) {
                break;
            }
            if recomb.len() >= self.edge_limit {
                break;
            }
            let Some(item) = queue.pop() else { break };
            num_popped += 1;
            let cand = &cands[item.cand];
            let parse_edge = parse.edge(cand.edge);

            let tails: Vec<NodeId> = item
                .ranks
                .iter()
                .enumerate()
                .map(|(slot, &rank)| cand.children[slot][rank].node)
                .collect();
            let children_score: f64 = item
                .ranks
                .iter()
                .enumerate()
                .map(|(slot, &rank)| cand.children[slot][rank].score)
                .sum();
            let own_score = item.score - children_score;

            // Duplicate edges are skipped; a conflicting score means the
            // generator produced inconsistent partials, which is worth a log
            // line but not a failure.
            let memo_key = (tails.clone(), cand.edge);
            match edge_memo.get(&memo_key).copied() {
                Some(prev) if (prev - own_score).abs() < 1e-9 => {}
                Some(prev) => {
                    warn!(
                        edge = cand.edge,
                        prev, new = own_score, "duplicate edge with conflicting score"
                    );
                }
                None => {
                    edge_memo.insert(memo_key, own_score);
                    let head = match recomb.get(&item.state).copied() {
                        Some(idx) => {
                            let head = alts[idx].node;
                            if item.score > alts[idx].score {
                                alts[idx].score = item.score;
                            }
                            head
                        }
                        None => {
                            let node = out.add_node(parse.node(id).span, parse.node(id).sym);
                            recomb.insert(item.state.clone(), alts.len());
                            alts.push(Alt {
                                node,
                                state: item.state.clone(),
                                score: item.score,
                            });
                            node
                        }
                    };
                    let mut features = parse_edge.features.clone();
                    let lm_feat = (own_score
                        - cand.oov as f64 * self.lm.unk_weight
                        - parse_edge.score)
                        / self.lm.weight;
                    if lm_feat != 0.0 {
                        features.add(self.lm.feature, lm_feat);
                    }
                    if cand.oov != 0 {
                        features.add(self.lm.unk_feature, cand.oov as f64);
                    }
                    out.add_edge(
                        head,
                        tails,
                        parse_edge.rule,
                        features,
                        parse_edge.trg.clone(),
                        own_score,
                    );
                }
            }

            // Advance one rank per child slot.
            for slot in 0..item.ranks.len() {
                let mut ranks = item.ranks.clone();
                ranks[slot] += 1;
                if ranks[slot] >= cand.children[slot].len() {
                    continue;
                }
                if let Some((score, state, _)) =
                    self.score_combination(parse, cand.edge, &cand.children, &ranks)
                {
                    queue.push(GenItem {
                        score,
                        seq,
                        cand: item.cand,
                        ranks,
                        state,
                    });
                    seq += 1;
                }
            }
        }

        for alt in &alts {
            out.set_viterbi_score(alt.node, alt.score);
        }
        alts.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.node.cmp(&b.node))
        });
        let alts = Rc::new(alts);
        memo[id] = Some(Rc::clone(&alts));
        alts
    }

    /// Exact score, state and OOV count of one (edge, child ranks)
    /// combination.
    fn score_combination(
        &self,
        parse: &HyperGraph,
        edge: EdgeId,
        children: &[Rc<Vec<Alt>>],
        ranks: &[usize],
    ) -> Option<(f64, ChartState, i64)> {
        let parse_edge = parse.edge(edge);
        let mut child_states: Vec<&ChartState> = Vec::with_capacity(ranks.len());
        let mut below = 0.0;
        for (slot, &rank) in ranks.iter().enumerate() {
            let alt = children[slot].get(rank)?;
            child_states.push(&alt.state);
            below += alt.score;
        }
        let words = &parse_edge.trg.get(self.lm.factor)?.words;
        let ns = self.lm.calc_nonterm_score(self.vocab, words, &child_states);
        let score = below
            + parse_edge.score
            + self.lm.weight * ns.prob
            + self.lm.unk_weight * ns.oov as f64;
        Some((score, ns.state, ns.oov))
    }
}

struct GenItem {
    score: f64,
    seq: u64,
    cand: usize,
    ranks: Vec<usize>,
    state: ChartState,
}

impl PartialEq for GenItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for GenItem {}

impl PartialOrd for GenItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GenItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
