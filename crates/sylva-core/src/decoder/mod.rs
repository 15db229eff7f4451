//! CKY+ chart decoding with integrated language-model scoring.
//!
//! The decoder walks every source span (outer loop right-to-left over span
//! starts, inner loop left-to-right over span ends), matching rule source
//! patterns through the grammar trie. A partial match extends either by the
//! next source terminal or by a completed non-terminal from a sub-span, and
//! only descends while the trie confirms the prefix exists. Matched rules
//! are then combined with ranked child candidates by cube pruning, with
//! recombination on (head labels, LM states).
//!
//! Based on the dot-chart-free CKY+ variant of Sennrich (SSST 2014).

mod chart;
#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::debug;

use crate::features::SparseVector;
use crate::grammar::trie::{RuleFsm, RuleRef};
use crate::grammar::{CfgData, HieroHeadLabels};
use crate::hypergraph::HyperGraph;
use crate::lm::{ChartState, LmData};
use crate::vocab::{slot_id, Vocab, VocabError, WordId};

use chart::{CfgCollection, CfgPath, ChartCell};

/// Target factors carried by the grammar. The rule-table format is
/// single-factor.
const TRG_FACTORS: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("the chart decoder supports exactly one translation model, got {0}")]
    ModelCount(usize),

    #[error("chart cell [{0}, {1}) already populated")]
    CellRepopulated(usize, usize),

    #[error("chart cell [{0}, {1}) queried for a candidate it does not hold")]
    MissingCandidate(usize, usize),

    #[error(transparent)]
    Vocab(#[from] VocabError),
}

/// Search knobs. `None` limits are unbounded.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Maximum cube-pruning pops per span.
    pub pop_limit: Option<usize>,
    /// Maximum distinct recombined nodes per span.
    pub chart_limit: Option<usize>,
    /// Head label required of a full-sentence candidate.
    pub root_symbol: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            pop_limit: None,
            chart_limit: None,
            root_symbol: "S".to_string(),
        }
    }
}

/// Chart decoder over one grammar and any number of language models.
pub struct CfgLmDecoder<'a> {
    vocab: &'a Vocab,
    fsm: &'a RuleFsm,
    lms: Vec<LmData>,
    weights: SparseVector,
    pop_limit: Option<usize>,
    chart_limit: Option<usize>,
    root_symbol: HieroHeadLabels,
    /// Unary rules flattened across the grammar, and the index from child
    /// head labels into them.
    unary_rules: Vec<RuleRef>,
    unary_ids: HashMap<HieroHeadLabels, Vec<usize>>,
}

impl<'a> CfgLmDecoder<'a> {
    pub fn new(
        vocab: &'a Vocab,
        fsms: &[&'a RuleFsm],
        lms: Vec<LmData>,
        weights: SparseVector,
        config: &DecoderConfig,
    ) -> Result<Self, DecodeError> {
        if fsms.len() != 1 {
            return Err(DecodeError::ModelCount(fsms.len()));
        }
        let fsm = fsms[0];
        let root = vocab.intern(&config.root_symbol)?;
        let mut unary_rules = Vec::new();
        let mut unary_ids: HashMap<HieroHeadLabels, Vec<usize>> = HashMap::new();
        for (labels, refs) in fsm.unary_entries() {
            for &rref in refs {
                unary_ids
                    .entry(labels.clone())
                    .or_default()
                    .push(unary_rules.len());
                unary_rules.push(rref);
            }
        }
        Ok(Self {
            vocab,
            fsm,
            lms,
            weights,
            pop_limit: config.pop_limit,
            chart_limit: config.chart_limit,
            root_symbol: HieroHeadLabels::uniform(root, TRG_FACTORS),
            unary_rules,
            unary_ids,
        })
    }

    /// Decode one sentence into an LM-integrated hypergraph. A sentence with
    /// no full-span candidate under the root symbol yields an empty graph.
    pub fn decode(&self, sent: &[WordId]) -> Result<HyperGraph, DecodeError> {
        let n = sent.len();
        if n == 0 {
            return Ok(HyperGraph::new());
        }
        let mut hg = HyperGraph::new();
        hg.set_words(sent.to_vec());
        let root = hg.add_node((0, n), self.root_symbol.0[0]);
        debug_assert_eq!(root, 0);

        let mut cells: Vec<ChartCell> = (0..n * n).map(|_| ChartCell::default()).collect();
        let mut collections: Vec<CfgCollection> =
            (0..n * n).map(|_| CfgCollection::default()).collect();
        let root_path = CfgPath::default();

        for i in (0..n).rev() {
            for j in i..n {
                if i == j {
                    let path = root_path.with_terminal(sent[i]);
                    if let Some(bucket) = self.fsm.lookup(&path.key) {
                        collections[i * n + j].add_rules(&path, self.fsm.bucket_refs(bucket));
                    }
                } else {
                    self.consume(&root_path, sent, n, i, i, j - 1, &cells, &mut collections);
                }
                self.cube_prune(n, i, j, &collections, &mut cells, &mut hg)?;
            }
        }

        let candidates: Vec<chart::StatefulNode> = cells[n - 1]
            .nodes_for(&self.root_symbol)
            .iter()
            .cloned()
            .collect();
        if candidates.is_empty() {
            debug!(len = n, "no candidate under the root symbol");
            return Ok(HyperGraph::new());
        }
        for sn in candidates {
            let mut features = SparseVector::new();
            let mut total = 0.0;
            for (lm_id, lm) in self.lms.iter().enumerate() {
                let score = lm.calc_final_score(&sn.states[lm_id]);
                if score != 0.0 {
                    features.add(lm.feature, score);
                }
                total += score * lm.weight;
            }
            let sym = hg.node(sn.node).sym;
            let trg = vec![
                CfgData::new(vec![slot_id(0)], self.root_symbol.0[0], vec![sym]);
                TRG_FACTORS
            ];
            hg.add_edge(0, vec![sn.node], None, features, trg, total);
        }
        debug!(
            nodes = hg.num_nodes(),
            edges = hg.num_edges(),
            "chart decode complete"
        );
        Ok(hg)
    }

    /// Extend a partial pattern match across the sub-spans starting at `j`
    /// and ending at `k`, branching on the next terminal and on every
    /// completed non-terminal.
    #[allow(clippy::too_many_arguments)]
    fn consume(
        &self,
        path: &CfgPath,
        sent: &[WordId],
        n: usize,
        i: usize,
        j: usize,
        k: usize,
        cells: &[ChartCell],
        collections: &mut [CfgCollection],
    ) {
        let unary = i == j;
        if j == k {
            let next = path.with_terminal(sent[j]);
            if self.fsm.has_prefix(&next.key) {
                self.add_to_chart(&next, sent, n, i, k, unary, cells, collections);
            }
        }
        let labels: Vec<HieroHeadLabels> = cells[j * n + k].labels().cloned().collect();
        for lab in labels {
            let next = path.with_nonterm(&lab, j, k);
            if self.fsm.has_prefix(&next.key) {
                self.add_to_chart(&next, sent, n, i, k, unary, cells, collections);
            }
        }
    }

    /// Deposit exact matches for `[i, j]` and keep extending rightward.
    /// `unary` marks paths of a single element spanning the whole range,
    /// which are handled by the unary index instead.
    #[allow(clippy::too_many_arguments)]
    fn add_to_chart(
        &self,
        path: &CfgPath,
        sent: &[WordId],
        n: usize,
        i: usize,
        j: usize,
        unary: bool,
        cells: &[ChartCell],
        collections: &mut [CfgCollection],
    ) {
        if !unary {
            if let Some(bucket) = self.fsm.lookup(&path.key) {
                collections[i * n + j].add_rules(path, self.fsm.bucket_refs(bucket));
            }
        }
        if self.fsm.has_prefix(&path.key) {
            for k in j + 1..n {
                self.consume(path, sent, n, i, j + 1, k, cells, collections);
            }
        }
    }

    /// Combine the span's collected rules with ranked child candidates,
    /// keeping at most `pop_limit` expansions and `chart_limit` recombined
    /// nodes, then finalise the cell.
    fn cube_prune(
        &self,
        n: usize,
        i: usize,
        j: usize,
        collections: &[CfgCollection],
        cells: &mut [ChartCell],
        hg: &mut HyperGraph,
    ) -> Result<(), DecodeError> {
        let cur = i * n + j;
        debug_assert!(!cells[cur].is_populated());
        let mut queue: BinaryHeap<CubeItem> = BinaryHeap::new();
        let mut seq = 0u64;

        // Seed the queue with each rule's best child combination.
        for (rid, entry) in collections[cur].entries.iter().enumerate() {
            let rule = self.fsm.rule(entry.rule);
            let mut score = self.weights.dot(&rule.features);
            let mut viable = true;
            for (pid, &(a, b)) in entry.spans.iter().enumerate() {
                match cells[a * n + b].hyp_score(hg, &entry.labels[pid], 0) {
                    Some(s) => score += s,
                    None => {
                        viable = false;
                        break;
                    }
                }
            }
            if viable {
                let mut positions = vec![0i64; entry.spans.len() + 1];
                positions[0] = rid as i64;
                queue.push(CubeItem {
                    score,
                    seq,
                    positions,
                });
                seq += 1;
            }
        }

        let mut finished: HashSet<Vec<i64>> = HashSet::new();
        let mut recomb: HashMap<(HieroHeadLabels, Vec<ChartState>), usize> = HashMap::new();
        let unary_path = [(i, j)];
        let mut num_popped = 0usize;

        loop {
            if self.pop_limit.is_some_and(|l| num_popped >= l) {
                break;
            }
            if self.chart_limit.is_some_and(|l| recomb.len() >= l) {
                break;
            }
            let Some(item) = queue.pop() else { break };
            num_popped += 1;
            if !finished.insert(item.positions.clone()) {
                continue;
            }

            // Standard rules index the collection; negative ids are unary
            // rules whose single child is this span itself.
            let (rref, spans) = if item.positions[0] >= 0 {
                let entry = &collections[cur].entries[item.positions[0] as usize];
                (entry.rule, entry.spans.as_slice())
            } else {
                let uid = (-1 - item.positions[0]) as usize;
                (self.unary_rules[uid], unary_path.as_slice())
            };
            let rule = self.fsm.rule(rref);

            let mut tails = Vec::with_capacity(spans.len());
            let mut child_states: Vec<Vec<ChartState>> = Vec::with_capacity(spans.len());
            for (pid, &(a, b)) in spans.iter().enumerate() {
                let sn = cells[a * n + b]
                    .stateful_node(rule.child_head_labels(pid), item.positions[pid + 1] as usize)
                    .ok_or(DecodeError::MissingCandidate(a, b + 1))?;
                tails.push(sn.node);
                child_states.push(sn.states.clone());
            }

            let mut features = rule.features.clone();
            let mut edge_score = self.weights.dot(&rule.features);
            let mut states: Vec<ChartState> = Vec::with_capacity(self.lms.len());
            for (lm_id, lm) in self.lms.iter().enumerate() {
                let refs: Vec<&ChartState> = child_states.iter().map(|cs| &cs[lm_id]).collect();
                let ns = lm.calc_nonterm_score(self.vocab, &rule.trg[lm.factor].words, &refs);
                edge_score += ns.prob * lm.weight + ns.oov as f64 * lm.unk_weight;
                if ns.prob != 0.0 {
                    features.add(lm.feature, ns.prob);
                }
                if ns.oov != 0 {
                    features.add(lm.unk_feature, ns.oov as f64);
                }
                states.push(ns.state);
            }

            let key = (rule.head_labels.clone(), states.clone());
            let head = match recomb.get(&key).copied() {
                Some(node) => node,
                None => {
                    let node = hg.add_node((i, j + 1), rule.src.label);
                    cells[cur].add_stateful_node(rule.head_labels.clone(), node, states);
                    recomb.insert(key, node);
                    node
                }
            };
            hg.add_edge(head, tails, Some(rref), features, rule.trg.clone(), edge_score);

            // Advance each child one rank.
            for (pid, &(a, b)) in spans.iter().enumerate() {
                let pos = item.positions[pid + 1] as usize;
                let lab = rule.child_head_labels(pid);
                let curr = cells[a * n + b].hyp_score(hg, lab, pos);
                let next = cells[a * n + b].hyp_score(hg, lab, pos + 1);
                if let (Some(c), Some(nx)) = (curr, next) {
                    let mut positions = item.positions.clone();
                    positions[pid + 1] += 1;
                    queue.push(CubeItem {
                        score: item.score + (nx - c),
                        seq,
                        positions,
                    });
                    seq += 1;
                }
            }

            // Unary rules rooted in this hypothesis' head labels.
            if let Some(uids) = self.unary_ids.get(&rule.head_labels) {
                for &uid in uids {
                    let urule = self.fsm.rule(self.unary_rules[uid]);
                    queue.push(CubeItem {
                        score: item.score + self.weights.dot(&urule.features),
                        seq,
                        positions: vec![-1 - uid as i64, 0],
                    });
                    seq += 1;
                }
            }
        }

        cells[cur].finalize(hg, (i, j + 1))
    }
}

/// Priority-queue entry; older insertions win score ties so runs are
/// reproducible.
struct CubeItem {
    score: f64,
    seq: u64,
    positions: Vec<i64>,
}

impl PartialEq for CubeItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for CubeItem {}

impl PartialOrd for CubeItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CubeItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
