//! The rewrite pipeline.
//!
//! Passes run in a fixed order: scope resolution and partition
//! classification, spatial predicate extraction, join rewrite, the
//! sub-chunking decision, aggregation split, template finalization. Join
//! rewrite runs before the sub-chunking decision so match-table foreign keys
//! are available to it. The output is a pure function of the statement and
//! the metadata snapshot.

use skyq_common::{CzarError, Result};
use skyq_geom::{ChunkSpec, Chunker};
use skyq_metadata::TableInfo;
use skyq_query::{parse_select, ChunkTarget, Expr, QueryTemplate, SelectItem, SelectStmt};
use tracing::debug;

use crate::aggregate::{self, SplitOutcome};
use crate::chunk_spec::{ChunkQuerySpec, MergeFixup};
use crate::context::AnalysisContext;
use crate::scope::{self, Binding};
use crate::spatial;
use crate::{join, OVERLAP_TABLE_SUFFIX};

/// Rewrite one SQL string into a chunk query specification.
pub fn rewrite(sql: &str, ctx: &AnalysisContext) -> Result<ChunkQuerySpec> {
    let stmt = parse_select(sql)?;
    rewrite_stmt(stmt, ctx)
}

/// Rewrite an already-parsed statement.
pub fn rewrite_stmt(mut stmt: SelectStmt, ctx: &AnalysisContext) -> Result<ChunkQuerySpec> {
    let bindings = scope::resolve(&mut stmt, ctx)?;

    let any_partitioned = bindings.iter().any(|b| b.info.is_partitioned());
    if !any_partitioned {
        return single_job_spec(&stmt, ctx);
    }

    let constraint = spatial::extract(&mut stmt)?;
    join::rewrite(&mut stmt, &bindings)?;

    let has_director = bindings
        .iter()
        .any(|b| b.info.supports_sub_chunks());
    let needs_sub_chunks = has_director && has_near_neighbor_predicate(&stmt);

    let outcome = aggregate::split(&stmt.select, stmt.distinct)?;

    finalize(stmt, ctx, &bindings, constraint, needs_sub_chunks, outcome)
}

/// A query over unpartitioned tables only (or no tables) short-circuits to a
/// single sub-job executing the statement as written.
fn single_job_spec(stmt: &SelectStmt, ctx: &AnalysisContext) -> Result<ChunkQuerySpec> {
    let db = stmt
        .from
        .as_ref()
        .and_then(|f| f.first.db.clone())
        .or_else(|| ctx.default_db.clone())
        .unwrap_or_default();
    debug!(db = %db, "unpartitioned statement short-circuits to one sub-job");
    Ok(ChunkQuerySpec {
        db,
        templates: vec![stmt.to_template()],
        chunks: Vec::new(),
        needs_sub_chunks: false,
        overlap_deg: 0.0,
        fixup: None,
    })
}

/// Near-neighbor predicates force sub-chunked execution so boundary pairs
/// resolve against the overlap tables.
fn has_near_neighbor_predicate(stmt: &SelectStmt) -> bool {
    let mut found = false;
    let mut probe = stmt.clone();
    probe.walk_exprs_mut(&mut |e| {
        if let Expr::Func { name, .. } = e {
            if name.to_ascii_lowercase().contains("angsep") {
                found = true;
            }
        }
    });
    found
}

fn finalize(
    mut stmt: SelectStmt,
    ctx: &AnalysisContext,
    bindings: &[Binding],
    constraint: spatial::SpatialConstraint,
    needs_sub_chunks: bool,
    outcome: SplitOutcome,
) -> Result<ChunkQuerySpec> {
    // Primary partitioning drives the chunk grid.
    let primary = bindings
        .iter()
        .find_map(|b| b.info.director())
        .expect("partitioned statement has a director-backed table");
    let striping = ctx.metadata.striping(&primary.db)?;
    let chunker = Chunker::new(striping.stripes, striping.sub_stripes);
    let overlap_deg = bindings
        .iter()
        .filter_map(|b| b.info.director())
        .map(|d| d.overlap_deg)
        .fold(0.0_f64, f64::max)
        .max(if needs_sub_chunks {
            ctx.default_overlap_deg
        } else {
            0.0
        });

    // Assign per-chunk rewrite modes.
    if let Some(from) = &mut stmt.from {
        for (i, table) in from.tables_mut().enumerate() {
            table.chunking = match bindings[i].info.as_ref() {
                TableInfo::Director(_) => {
                    if needs_sub_chunks {
                        ChunkTarget::SubChunked
                    } else {
                        ChunkTarget::Chunked
                    }
                }
                TableInfo::Child(_) | TableInfo::Match(_) => ChunkTarget::Chunked,
                TableInfo::Unpartitioned { .. } => ChunkTarget::None,
            };
        }
    }

    // Build the parallel statement: fix-up owns ORDER BY/LIMIT.
    let order_by = std::mem::take(&mut stmt.order_by);
    let limit = stmt.limit.take();
    let fixup = match &outcome {
        SplitOutcome::Decomposed { parallel, fixup } => {
            stmt.select = parallel.clone();
            stmt.distinct = false;
            let having = stmt.having.take();
            Some(MergeFixup {
                select: render_select_list(fixup),
                post: render_post(&stmt.group_by, &having),
                order_by: render_order_by(&order_by),
                limit,
            })
        }
        SplitOutcome::MergeOnly => Some(MergeFixup {
            select: format!(
                "{}{}",
                if stmt.distinct { "DISTINCT " } else { "" },
                render_select_list(&stmt.select)
            ),
            post: render_post(&stmt.group_by, &stmt.having),
            order_by: render_order_by(&order_by),
            limit,
        }),
        SplitOutcome::NoAggregates => {
            if order_by.is_empty() && limit.is_none() {
                None
            } else {
                Some(MergeFixup {
                    select: "*".to_string(),
                    post: String::new(),
                    order_by: render_order_by(&order_by),
                    limit,
                })
            }
        }
    };

    let mut templates = vec![stmt.to_template()];
    if needs_sub_chunks {
        templates.push(overlap_template(&stmt, bindings));
    }

    let chunks = enumerate_chunks(&chunker, &constraint, needs_sub_chunks)?;
    debug!(
        chunks = chunks.len(),
        needs_sub_chunks,
        templates = templates.len(),
        "rewrite finalized"
    );

    Ok(ChunkQuerySpec {
        db: primary.db.clone(),
        templates,
        chunks,
        needs_sub_chunks,
        overlap_deg,
        fixup,
    })
}

/// Second template of a near-neighbor query: directors after the first
/// resolve against their overlap tables so boundary-crossing pairs appear
/// exactly once.
fn overlap_template(stmt: &SelectStmt, bindings: &[Binding]) -> QueryTemplate {
    let mut overlap = stmt.clone();
    let mut seen_director = false;
    if let Some(from) = &mut overlap.from {
        for (i, table) in from.tables_mut().enumerate() {
            if bindings[i].info.supports_sub_chunks() {
                if seen_director {
                    table.table = format!("{}{}", table.table, OVERLAP_TABLE_SUFFIX);
                }
                seen_director = true;
            }
        }
    }
    overlap.to_template()
}

fn enumerate_chunks(
    chunker: &Chunker,
    constraint: &spatial::SpatialConstraint,
    needs_sub_chunks: bool,
) -> Result<Vec<ChunkSpec>> {
    if !constraint.explicit_chunks.is_empty() {
        let mut out = Vec::with_capacity(constraint.explicit_chunks.len());
        for &chunk_id in &constraint.explicit_chunks {
            if chunker.chunk_bounds(chunk_id).is_none() {
                return Err(CzarError::Unsupported(format!(
                    "explicit chunk {chunk_id} is outside the partitioning grid"
                )));
            }
            if needs_sub_chunks {
                let mut subs = chunker.sub_chunks_for(chunk_id, constraint.region.as_ref());
                if subs.is_empty() {
                    subs = chunker.sub_chunks_for(chunk_id, None);
                }
                out.push(ChunkSpec {
                    chunk_id,
                    sub_chunk_ids: subs,
                });
            } else {
                out.push(ChunkSpec::whole(chunk_id));
            }
        }
        return Ok(out);
    }
    Ok(chunker.chunk_specs(constraint.region.as_ref(), needs_sub_chunks))
}

fn render_select_list(items: &[SelectItem]) -> String {
    items
        .iter()
        .map(|item| match &item.alias {
            Some(alias) => format!("{} AS {}", item.expr.to_sql(), alias),
            None => item.expr.to_sql(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn render_post(group_by: &[Expr], having: &Option<Expr>) -> String {
    let mut out = String::new();
    if !group_by.is_empty() {
        out.push_str("GROUP BY ");
        out.push_str(
            &group_by
                .iter()
                .map(|g| g.to_sql())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    if let Some(h) = having {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str("HAVING ");
        out.push_str(&h.to_sql());
    }
    out
}

fn render_order_by(order_by: &[skyq_query::OrderByItem]) -> Option<String> {
    if order_by.is_empty() {
        return None;
    }
    Some(
        order_by
            .iter()
            .map(|o| {
                if o.desc {
                    format!("{} DESC", o.expr.to_sql())
                } else {
                    o.expr.to_sql()
                }
            })
            .collect::<Vec<_>>()
            .join(","),
    )
}
