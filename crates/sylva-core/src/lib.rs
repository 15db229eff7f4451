//! Decoding engine for syntax-based statistical machine translation.
//!
//! The pipeline: a source sentence is matched against a synchronous grammar
//! (indexed by a byte-trie over source patterns), producing a weighted
//! hypergraph of partial translations. Language-model scores are folded in
//! either during chart construction (`decoder`, cube pruning) or afterwards
//! over an existing forest (`compose`). Tuning support lives in `tune`
//! (oracle extraction and MERT convex hulls) with BLEU in `eval`.

pub mod compose;
pub mod decoder;
pub mod eval;
pub mod features;
pub mod grammar;
pub mod hypergraph;
pub mod lm;
pub mod tune;
pub mod vocab;

pub use features::SparseVector;
pub use hypergraph::HyperGraph;
pub use vocab::{Vocab, WordId};
