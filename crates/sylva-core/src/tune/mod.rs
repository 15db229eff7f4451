//! Tuning support: oracle extraction and MERT line-search geometry.

mod example;
pub mod hull;
pub mod oracle;

pub use example::ForestTuningExample;
pub use hull::{MertHull, MertHullWeightFunction, MertLine};
pub use oracle::{calculate_oracle, OracleError};

use crate::eval::BleuStats;

/// An interval of step sizes along the search direction.
pub type Span = (f64, f64);

/// A span with the evaluation statistics of the derivation winning there.
pub type ScoredSpan = (Span, BleuStats);

/// Ordered scored spans covering the whole line.
pub type ConvexHull = Vec<ScoredSpan>;
