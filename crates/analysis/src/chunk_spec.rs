//! The immutable output of query rewrite.
//!
//! A [`ChunkQuerySpec`] carries everything dispatch and merge need: the
//! per-chunk SQL templates, the chunk/sub-chunk work units, the overlap the
//! templates assume, and the aggregation fix-up plan. Substituting any listed
//! work unit into any template yields a legal standalone query whose result
//! schema is identical across chunks.

use serde::{Deserialize, Serialize};
use skyq_common::Result;
use skyq_geom::ChunkSpec;
use skyq_query::{QueryTemplate, TemplateMapping};

/// Aggregation/ordering fix-up applied to the merge table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeFixup {
    /// Select list run against the merge table (may start with `DISTINCT `).
    pub select: String,
    /// `GROUP BY`/`HAVING` tail, empty when not needed.
    pub post: String,
    /// Final ordering, rendered without the `ORDER BY` keyword.
    pub order_by: Option<String>,
    /// Final row limit.
    pub limit: Option<u64>,
}

impl MergeFixup {
    /// Render the `ORDER BY ... LIMIT ...` suffix.
    pub fn order_by_limit(&self) -> String {
        let mut out = String::new();
        if let Some(order_by) = &self.order_by {
            out.push_str("ORDER BY ");
            out.push_str(order_by);
        }
        if let Some(limit) = self.limit {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str("LIMIT ");
            out.push_str(&limit.to_string());
        }
        out
    }
}

/// Immutable chunk query specification produced by the rewrite pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkQuerySpec {
    /// Database every unqualified table reference resolves against.
    pub db: String,
    /// Templates rendered per work unit; multiple templates are combined
    /// with `UNION ALL` inside one chunk job.
    pub templates: Vec<QueryTemplate>,
    /// Work units; empty means a single unchunked sub-job.
    pub chunks: Vec<ChunkSpec>,
    /// Whether templates must be rendered per sub-chunk.
    pub needs_sub_chunks: bool,
    /// Overlap in degrees the templates assume.
    pub overlap_deg: f64,
    /// Fix-up plan; `None` when the merge table is the result table.
    pub fixup: Option<MergeFixup>,
}

impl ChunkQuerySpec {
    /// Whether finalize must run a fix-up statement.
    pub fn needs_fixup(&self) -> bool {
        self.fixup.is_some()
    }

    /// Number of sub-jobs this spec expands into.
    pub fn job_count(&self) -> usize {
        self.chunks.len().max(1)
    }

    /// Render the SQL for one work unit.
    ///
    /// Sub-chunked specs expand into one select per `(template, sub-chunk)`
    /// pair combined with `UNION ALL`; everything else renders the templates
    /// once per chunk.
    pub fn sql_for(&self, chunk: &ChunkSpec) -> Result<String> {
        let mut parts = Vec::new();
        if self.needs_sub_chunks && !chunk.sub_chunk_ids.is_empty() {
            for sub in &chunk.sub_chunk_ids {
                for t in &self.templates {
                    parts.push(t.render(&TemplateMapping::sub_chunk(
                        self.db.clone(),
                        chunk.chunk_id.0,
                        sub.0,
                    ))?);
                }
            }
        } else {
            for t in &self.templates {
                parts.push(t.render(&TemplateMapping::chunk(self.db.clone(), chunk.chunk_id.0))?);
            }
        }
        Ok(parts.join(" UNION ALL "))
    }
}
