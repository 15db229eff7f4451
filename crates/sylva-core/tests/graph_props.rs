//! Property-based tests for hypergraph structural invariants.
//!
//! Random two-level graphs (a root combining a handful of scored leaf
//! nodes) are generated via proptest and checked against the contracts the
//! decoder relies on: n-best ordering, Viterbi agreement, scoring
//! idempotence, and append being a structure-preserving embedding.

use proptest::prelude::*;

use sylva_core::features::SparseVector;
use sylva_core::grammar::CfgData;
use sylva_core::hypergraph::HyperGraph;
use sylva_core::vocab::slot_id;

/// Build a root node over `leaf_scores.len()` leaves, each leaf offering
/// the given alternative scores.
fn build_graph(leaf_scores: &[Vec<f64>]) -> HyperGraph {
    let mut hg = HyperGraph::new();
    let root = hg.add_node((0, leaf_scores.len()), 0);
    let mut tails = Vec::new();
    for (i, scores) in leaf_scores.iter().enumerate() {
        let leaf = hg.add_node((i, i + 1), 1);
        tails.push(leaf);
        for (alt, &score) in scores.iter().enumerate() {
            let word = (i * 10 + alt) as i32;
            let trg = vec![CfgData::new(vec![word], 1, vec![])];
            hg.add_edge(leaf, vec![], None, SparseVector::new(), trg, score);
        }
    }
    let slots: Vec<i32> = (0..leaf_scores.len()).map(slot_id).collect();
    let syms = vec![1; leaf_scores.len()];
    let trg = vec![CfgData::new(slots, 0, syms)];
    hg.add_edge(root, tails, None, SparseVector::new(), trg, 0.0);
    hg
}

fn arb_scores() -> impl Strategy<Value = Vec<Vec<f64>>> {
    prop::collection::vec(
        prop::collection::vec(-10.0f64..10.0, 1..4),
        1..4,
    )
}

proptest! {
    #[test]
    fn nbest_is_sorted_and_bounded(leaf_scores in arb_scores()) {
        let hg = build_graph(&leaf_scores);
        let expected: usize = leaf_scores.iter().map(Vec::len).product();
        let nbest = hg.nbest(64);
        prop_assert_eq!(nbest.len(), expected.min(64));
        for pair in nbest.windows(2) {
            prop_assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn top_derivation_matches_viterbi(leaf_scores in arb_scores()) {
        let mut hg = build_graph(&leaf_scores);
        let nbest = hg.nbest(1);
        prop_assert_eq!(nbest.len(), 1);
        let viterbi = hg.viterbi_score(0);
        prop_assert!((nbest[0].score - viterbi).abs() < 1e-9);
        // Best derivation sums each leaf's best alternative.
        let expected: f64 = leaf_scores
            .iter()
            .map(|s| s.iter().cloned().fold(f64::NEG_INFINITY, f64::max))
            .sum();
        prop_assert!((viterbi - expected).abs() < 1e-9);
    }

    #[test]
    fn rescoring_is_idempotent(leaf_scores in arb_scores()) {
        let mut hg = build_graph(&leaf_scores);
        let weights = SparseVector::new();
        hg.score_edges(&weights);
        let first: Vec<f64> = hg.edges().iter().map(|e| e.score).collect();
        hg.score_edges(&weights);
        let second: Vec<f64> = hg.edges().iter().map(|e| e.score).collect();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn append_embeds_the_subgraph(leaf_scores in arb_scores()) {
        let sub = build_graph(&leaf_scores);
        let mut hg = build_graph(&leaf_scores);
        let nodes_before = hg.num_nodes();
        let edges_before = hg.num_edges();
        let offset = hg.append(&sub);
        prop_assert_eq!(offset, nodes_before);

        // Every copied node keeps its structure, shifted by a fixed offset.
        for node in sub.nodes() {
            let copy = hg.node(node.id + nodes_before);
            prop_assert_eq!(copy.span, node.span);
            prop_assert_eq!(copy.sym, node.sym);
            prop_assert_eq!(copy.edges.len(), node.edges.len());
            for (&ce, &oe) in copy.edges.iter().zip(&node.edges) {
                prop_assert_eq!(ce, oe + edges_before);
                let copy_edge = hg.edge(ce);
                let orig_edge = sub.edge(oe);
                prop_assert_eq!(copy_edge.head, orig_edge.head + nodes_before);
                prop_assert_eq!(copy_edge.tails.len(), orig_edge.tails.len());
                for (&ct, &ot) in copy_edge.tails.iter().zip(&orig_edge.tails) {
                    prop_assert_eq!(ct, ot + nodes_before);
                }
                prop_assert_eq!(copy_edge.score, orig_edge.score);
            }
        }
    }
}
