//! Shared analysis context.

use std::sync::Arc;

use skyq_metadata::MetadataCache;

/// Inputs every rewrite pass can rely on.
///
/// The context is read-only during a rewrite; combined with the metadata
/// snapshot it makes `rewrite` a pure function of its inputs.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    /// Database used for unqualified table references.
    pub default_db: Option<String>,
    /// Process-wide partitioning metadata.
    pub metadata: Arc<MetadataCache>,
    /// Overlap assumed when no participating director declares one.
    pub default_overlap_deg: f64,
}

impl AnalysisContext {
    /// Build a context over a metadata cache.
    pub fn new(metadata: Arc<MetadataCache>, default_db: Option<String>) -> Self {
        Self {
            default_db,
            metadata,
            default_overlap_deg: 0.01667,
        }
    }
}
