//! Infile merger: assembles streamed per-chunk row batches into a local
//! MySQL result table.
//!
//! Key modules:
//! - [`schema`]: create-table/load-infile SQL forming and row encoding
//! - [`backend`]: the result-database execution seam ([`MySqlBackend`])
//! - [`infile`]: the per-query [`InfileMerger`] with its one-shot create,
//!   at-most-once chunk contributions, poisoning, and fix-up finalize

pub mod backend;
pub mod infile;
pub mod schema;

#[cfg(test)]
mod infile_tests;

pub use backend::{MergeBackend, MySqlBackend};
pub use infile::{FixupSpec, InfileMerger, InfileMergerConfig};
