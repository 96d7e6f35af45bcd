//! Query analysis and rewrite: one user statement in, a chunk query
//! specification out.
//!
//! Pass order (fixed):
//! 1. scope resolution ([`scope`])
//! 2. partition classification (also [`scope`], via the metadata cache)
//! 3. spatial predicate extraction ([`spatial`])
//! 4. join rewrite ([`join`])
//! 5. sub-chunking decision ([`pipeline`])
//! 6. aggregation split ([`aggregate`])
//! 7. template finalization ([`pipeline`])
//!
//! Determinism: [`rewrite`] is a pure function of the SQL text and the
//! metadata snapshot; two runs yield identical specifications.

pub mod aggregate;
pub mod chunk_spec;
pub mod context;
pub mod join;
pub mod pipeline;
pub mod scope;
pub mod spatial;

/// Suffix of the per-director overlap table resolved by near-neighbor
/// templates.
pub const OVERLAP_TABLE_SUFFIX: &str = "FullOverlap";

pub use chunk_spec::{ChunkQuerySpec, MergeFixup};
pub use context::AnalysisContext;
pub use pipeline::{rewrite, rewrite_stmt};
