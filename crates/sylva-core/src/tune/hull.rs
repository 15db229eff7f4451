//! MERT geometry: upper envelopes of derivation score lines.
//!
//! Along a search direction, every derivation's score is a line in the step
//! size `t`. A `MertHull` keeps the upper envelope of a set of such lines;
//! hulls combine with `add` (union of derivation sets) and `multiply`
//! (Minkowski sum, for joining an edge with its children). Back-pointers on
//! each line let the winning derivation be reconstructed per envelope
//! segment.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::features::SparseVector;
use crate::hypergraph::{EdgeId, HyperGraph};
use crate::vocab::{slot_index, Sentence};

/// A derivation's score line `y = m * t + b` with enough structure to
/// rebuild the derivation.
#[derive(Debug)]
pub struct MertLine {
    pub m: f64,
    pub b: f64,
    kind: LineKind,
}

#[derive(Debug)]
enum LineKind {
    /// A bare edge, children not yet attached.
    Edge(EdgeId),
    /// `rest` with one more child hull line attached. Children accumulate
    /// outermost-last, so reconstruction walks `rest` collecting `child`ren.
    Product {
        rest: Rc<MertLine>,
        child: Rc<MertLine>,
    },
}

impl MertLine {
    fn for_edge(m: f64, b: f64, edge: EdgeId) -> Rc<Self> {
        Rc::new(MertLine {
            m,
            b,
            kind: LineKind::Edge(edge),
        })
    }

    fn product(rest: &Rc<MertLine>, child: &Rc<MertLine>) -> Rc<Self> {
        Rc::new(MertLine {
            m: rest.m + child.m,
            b: rest.b + child.b,
            kind: LineKind::Product {
                rest: Rc::clone(rest),
                child: Rc::clone(child),
            },
        })
    }

    /// Rebuild the target words of this line's derivation.
    pub fn construct_translation(&self, hg: &HyperGraph) -> Sentence {
        let mut children: Vec<Sentence> = Vec::new();
        let mut cur = self;
        let edge = loop {
            match &cur.kind {
                LineKind::Product { rest, child } => {
                    children.push(child.construct_translation(hg));
                    cur = rest;
                }
                LineKind::Edge(e) => break *e,
            }
        };
        // Children were collected last-tail-first.
        children.reverse();
        let mut out = Sentence::new();
        if let Some(template) = hg.edge(edge).trg.first() {
            for &w in &template.words {
                if w >= 0 {
                    out.push(w);
                } else {
                    out.extend_from_slice(&children[slot_index(w)]);
                }
            }
        }
        out
    }
}

/// An upper envelope: lines with the left x-coordinate where each becomes
/// maximal, ordered by x.
#[derive(Debug, Default)]
pub struct MertHull {
    segments: Vec<(f64, Rc<MertLine>)>,
}

impl MertHull {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[(f64, Rc<MertLine>)] {
        &self.segments
    }

    /// Union with another hull: the envelope over both derivation sets.
    pub fn add(&mut self, other: &MertHull) {
        if other.is_empty() {
            return;
        }
        let mut lines: Vec<Rc<MertLine>> =
            self.segments.drain(..).map(|(_, l)| l).collect();
        lines.extend(other.segments.iter().map(|(_, l)| Rc::clone(l)));
        self.segments = envelope(lines);
    }

    /// Minkowski sum with another hull: every pair of lines summed, then the
    /// envelope. An empty operand annihilates (no derivation can pass
    /// through a childless alternative).
    pub fn multiply(&mut self, other: &MertHull) {
        if self.is_empty() || other.is_empty() {
            self.segments.clear();
            return;
        }
        let mut lines = Vec::with_capacity(self.segments.len() * other.segments.len());
        for (_, a) in &self.segments {
            for (_, b) in &other.segments {
                lines.push(MertLine::product(a, b));
            }
        }
        self.segments = envelope(lines);
    }
}

/// Compute the upper envelope of a set of lines: sort by slope, sweep,
/// dropping dominated lines and recording intersection points.
fn envelope(mut lines: Vec<Rc<MertLine>>) -> Vec<(f64, Rc<MertLine>)> {
    lines.sort_by(|a, b| {
        a.m.partial_cmp(&b.m)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.b.partial_cmp(&b.b).unwrap_or(Ordering::Equal))
    });
    let mut out: Vec<(f64, Rc<MertLine>)> = Vec::new();
    for line in lines {
        loop {
            let Some((top_x, top)) = out.last() else {
                out.push((f64::NEG_INFINITY, line));
                break;
            };
            if line.m == top.m {
                // Same slope: the later (higher intercept) one wins
                // everywhere, equal intercepts keep the earlier line.
                if line.b <= top.b {
                    break;
                }
                out.pop();
                continue;
            }
            let x = (top.b - line.b) / (line.m - top.m);
            if x <= *top_x {
                out.pop();
            } else {
                out.push((x, line));
                break;
            }
        }
    }
    out
}

/// Maps an edge to its score line under (weights, gradient).
pub struct MertHullWeightFunction {
    weights: SparseVector,
    gradient: SparseVector,
}

impl MertHullWeightFunction {
    pub fn new(weights: SparseVector, gradient: SparseVector) -> Self {
        Self { weights, gradient }
    }

    /// The single-line hull of one edge: slope from the gradient, intercept
    /// from the current weights.
    pub fn line_of(&self, hg: &HyperGraph, edge: EdgeId) -> MertHull {
        let feats = &hg.edge(edge).features;
        let line = MertLine::for_edge(self.gradient.dot(feats), self.weights.dot(feats), edge);
        MertHull {
            segments: vec![(f64::NEG_INFINITY, line)],
        }
    }
}
