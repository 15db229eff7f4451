//! Chart cells, rule collections and trie-walk paths for the CKY+ decoder.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::grammar::trie::{push_nonterm, push_terminal, RuleRef};
use crate::grammar::HieroHeadLabels;
use crate::hypergraph::{HyperGraph, NodeId};
use crate::lm::ChartState;
use crate::vocab::WordId;

use super::DecodeError;

/// A chart node plus the LM context it was built under, one state per LM.
#[derive(Debug, Clone)]
pub(crate) struct StatefulNode {
    pub node: NodeId,
    pub states: Vec<ChartState>,
}

/// One chart cell: for each head-label tuple, the nodes recombined under it.
/// After `finalize` the per-label lists are sorted best-first and the cell
/// refuses further population.
#[derive(Debug, Default)]
pub(crate) struct ChartCell {
    // Ordered map so chart iteration during the trie walk is deterministic.
    nodes: BTreeMap<HieroHeadLabels, Vec<StatefulNode>>,
    populated: bool,
}

impl ChartCell {
    pub fn is_populated(&self) -> bool {
        self.populated
    }

    pub fn labels(&self) -> impl Iterator<Item = &HieroHeadLabels> {
        self.nodes.keys()
    }

    pub fn add_stateful_node(
        &mut self,
        labels: HieroHeadLabels,
        node: NodeId,
        states: Vec<ChartState>,
    ) {
        self.nodes
            .entry(labels)
            .or_default()
            .push(StatefulNode { node, states });
    }

    pub fn stateful_node(&self, labels: &HieroHeadLabels, pos: usize) -> Option<&StatefulNode> {
        self.nodes.get(labels).and_then(|list| list.get(pos))
    }

    pub fn nodes_for(&self, labels: &HieroHeadLabels) -> &[StatefulNode] {
        self.nodes.get(labels).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Viterbi score of the pos-th candidate under `labels`, or None when no
    /// such candidate exists.
    pub fn hyp_score(
        &self,
        hg: &mut HyperGraph,
        labels: &HieroHeadLabels,
        pos: usize,
    ) -> Option<f64> {
        self.stateful_node(labels, pos)
            .map(|sn| hg.viterbi_score(sn.node))
    }

    /// Sort every label bucket best-first and mark the cell complete.
    /// Finalising twice is an invariant violation.
    pub fn finalize(&mut self, hg: &mut HyperGraph, span: (usize, usize)) -> Result<(), DecodeError> {
        if self.populated {
            return Err(DecodeError::CellRepopulated(span.0, span.1));
        }
        for list in self.nodes.values_mut() {
            if list.len() > 1 {
                // Stable: equal scores keep their insertion order.
                let mut scored: Vec<(f64, StatefulNode)> = list
                    .drain(..)
                    .map(|sn| (hg.viterbi_score(sn.node), sn))
                    .collect();
                scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                list.extend(scored.into_iter().map(|(_, sn)| sn));
            }
        }
        self.populated = true;
        Ok(())
    }
}

/// Rules collected for a span during the chart walk, each with the child
/// spans and labels consumed while matching its source pattern.
#[derive(Debug, Default)]
pub(crate) struct CfgCollection {
    pub entries: Vec<CollectionEntry>,
}

#[derive(Debug, Clone)]
pub(crate) struct CollectionEntry {
    pub rule: RuleRef,
    pub spans: Rc<Vec<(usize, usize)>>,
    pub labels: Rc<Vec<HieroHeadLabels>>,
}

impl CfgCollection {
    /// Deposit every rule of a matched bucket, sharing one span/label vector.
    pub fn add_rules(&mut self, path: &CfgPath, rules: impl Iterator<Item = RuleRef>) {
        let spans = Rc::new(path.spans.clone());
        let labels = Rc::new(path.labels.clone());
        for rule in rules {
            self.entries.push(CollectionEntry {
                rule,
                spans: Rc::clone(&spans),
                labels: Rc::clone(&labels),
            });
        }
    }
}

/// A partial match of a source pattern: the serialised key so far plus the
/// child spans and labels consumed along the way. Spans are stored with an
/// inclusive end, matching the chart's cell addressing.
#[derive(Debug, Clone, Default)]
pub(crate) struct CfgPath {
    pub key: Vec<u8>,
    pub spans: Vec<(usize, usize)>,
    pub labels: Vec<HieroHeadLabels>,
}

impl CfgPath {
    /// Extend with the terminal at sentence position `j`.
    pub fn with_terminal(&self, word: WordId) -> CfgPath {
        let mut next = self.clone();
        push_terminal(&mut next.key, word);
        next
    }

    /// Extend with a completed non-terminal covering `[j, k]`.
    pub fn with_nonterm(&self, labels: &HieroHeadLabels, j: usize, k: usize) -> CfgPath {
        let mut next = self.clone();
        push_nonterm(&mut next.key, labels);
        next.spans.push((j, k));
        next.labels.push(labels.clone());
        next
    }
}
