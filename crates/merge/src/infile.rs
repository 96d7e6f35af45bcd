//! Streamed result merging into the local MySQL merge table.
//!
//! Contract:
//! - the merge table is created exactly once, from the first arriving
//!   schema, under the state mutex and a one-shot flag;
//! - every batch is reconciled against the cached schema before loading;
//! - each `(chunk)` contributes at most one attempt: the first attempt to
//!   deliver a batch claims the chunk, later attempts are discarded;
//! - any fatal condition poisons the merger for the whole user query:
//!   subsequent `merge` calls return without work and `finalize` reports
//!   the recorded cause;
//! - `finalize` materializes the client-visible result table (running the
//!   aggregation fix-up when one is configured) and drops the merge table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use skyq_common::metrics::global_metrics;
use skyq_common::{ChunkId, CzarError, MergeFatal, QueryId, Result};
use skyq_dispatch::{MergeSink, RowBatch, RowSchema};
use tokio::sync::Mutex;
use tonic::async_trait;
use tracing::{debug, info, warn};

use crate::backend::MergeBackend;
use crate::schema::{encode_infile_chunks, form_create_table, reconcile};

/// Fix-up plan as the merger needs it.
#[derive(Debug, Clone, Default)]
pub struct FixupSpec {
    /// Select list run over the merge table.
    pub select: String,
    /// `GROUP BY`/`HAVING` tail (may be empty).
    pub post: String,
    /// `ORDER BY ... LIMIT ...` suffix (may be empty).
    pub order_by_limit: String,
}

/// Merger configuration for one user query.
#[derive(Debug, Clone)]
pub struct InfileMergerConfig {
    /// Owning user query.
    pub query_id: QueryId,
    /// Client-visible result table name.
    pub target_table: String,
    /// Aggregation fix-up; `None` merges straight into the target table.
    pub fixup: Option<FixupSpec>,
    /// Soft cap on one infile buffer; oversized batches split into several
    /// `LOAD DATA` statements.
    pub buffer_bytes: usize,
}

#[derive(Debug, Default)]
struct MergeState {
    need_create: bool,
    schema: Option<RowSchema>,
    claims: HashMap<u32, u32>,
    poison: Option<MergeFatal>,
}

/// Streamed-result merger for one user query.
pub struct InfileMerger {
    config: InfileMergerConfig,
    merge_table: String,
    backend: Arc<dyn MergeBackend>,
    state: Mutex<MergeState>,
    inflight: AtomicU64,
}

impl InfileMerger {
    /// Build a merger. A fix-up-bearing query merges into `<target>_m`;
    /// otherwise the merge table is created directly under the final name.
    pub fn new(config: InfileMergerConfig, backend: Arc<dyn MergeBackend>) -> Self {
        let merge_table = if config.fixup.is_some() {
            format!("{}_m", config.target_table)
        } else {
            config.target_table.clone()
        };
        Self {
            config,
            merge_table,
            backend,
            state: Mutex::new(MergeState {
                need_create: true,
                ..MergeState::default()
            }),
            inflight: AtomicU64::new(0),
        }
    }

    /// Merge table name (the result table itself when no fix-up runs).
    pub fn merge_table(&self) -> &str {
        &self.merge_table
    }

    /// Whether finalize will run an aggregation fix-up.
    pub fn needs_fixup(&self) -> bool {
        self.config.fixup.is_some()
    }

    /// `LOAD DATA` statements currently in flight.
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Merge one validated row batch of `(chunk, attempt)`.
    pub async fn merge_batch(
        &self,
        chunk_id: ChunkId,
        attempt: u32,
        batch: RowBatch,
    ) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.poison.is_some() {
            // Already fatal for this user query; the controller has been
            // signaled through the failing call.
            return Ok(());
        }
        match st.claims.get(&chunk_id.0) {
            Some(owner) if *owner != attempt => {
                debug!(
                    query_id = %self.config.query_id,
                    chunk_id = %chunk_id,
                    attempt,
                    owner,
                    "discarding batch from non-winning attempt"
                );
                return Ok(());
            }
            _ => {
                st.claims.insert(chunk_id.0, attempt);
            }
        }

        if let Some(schema) = &batch.schema {
            match &st.schema {
                Some(cached) => {
                    if let Err(e) = reconcile(cached, schema) {
                        st.poison = Some(MergeFatal::SchemaMismatch(e.to_string()));
                        return Err(e);
                    }
                }
                None => st.schema = Some(schema.clone()),
            }
        }

        if st.need_create {
            let Some(schema) = st.schema.clone() else {
                let e = CzarError::ResultCorrupt(
                    "row batch arrived before any schema".to_string(),
                );
                st.poison = Some(MergeFatal::SchemaMismatch(e.to_string()));
                return Err(e);
            };
            let sql = form_create_table(&self.merge_table, &schema);
            info!(
                query_id = %self.config.query_id,
                table = %self.merge_table,
                "creating merge table"
            );
            if let Err(e) = self.backend.apply(&sql).await {
                st.poison = Some(fatal_of(&e));
                return Err(e);
            }
            st.need_create = false;
        }
        drop(st);

        if batch.rows.is_empty() {
            return Ok(());
        }
        let rows = batch.rows.len() as u64;
        let qid = self.config.query_id.to_string();
        let start = std::time::Instant::now();
        let mut bytes = 0_u64;
        for (part, data) in encode_infile_chunks(&batch, self.config.buffer_bytes)
            .into_iter()
            .enumerate()
        {
            bytes += data.len() as u64;
            let virt_file = format!(
                "virt-{}-{}-{}-{}",
                self.config.query_id, chunk_id, attempt, part
            );
            let inflight = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
            global_metrics().set_merge_inflight_loads(&qid, inflight);
            let result = self
                .backend
                .load_infile(&self.merge_table, &virt_file, data)
                .await;
            let inflight = self.inflight.fetch_sub(1, Ordering::SeqCst) - 1;
            global_metrics().set_merge_inflight_loads(&qid, inflight);

            if let Err(e) = result {
                let mut st = self.state.lock().await;
                if st.poison.is_none() {
                    st.poison = Some(fatal_of(&e));
                }
                return Err(e);
            }
        }
        global_metrics().record_merge_load(&qid, rows, bytes, start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Run the fix-up (when configured) and materialize the result table.
    ///
    /// Returns the client-visible result table name.
    pub async fn finalize(&self) -> Result<String> {
        let mut st = self.state.lock().await;
        if let Some(poison) = &st.poison {
            let poison = poison.clone();
            drop(st);
            self.discard().await;
            return Err(poison.into());
        }
        if st.need_create {
            return Err(
                MergeFatal::CreateTable("no results arrived for the merge table".to_string())
                    .into(),
            );
        }

        let Some(fixup) = &self.config.fixup else {
            // The merge table was created under the final name.
            info!(
                query_id = %self.config.query_id,
                table = %self.merge_table,
                "merge table is the result table"
            );
            return Ok(self.config.target_table.clone());
        };

        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} SELECT {} FROM {}",
            self.config.target_table, fixup.select, self.merge_table
        );
        if !fixup.post.is_empty() {
            sql.push(' ');
            sql.push_str(&fixup.post);
        }
        if !fixup.order_by_limit.is_empty() {
            sql.push(' ');
            sql.push_str(&fixup.order_by_limit);
        }
        info!(query_id = %self.config.query_id, sql = %sql, "running merge fix-up");
        if let Err(e) = self.backend.apply(&sql).await {
            st.poison = Some(fatal_of(&e));
            return Err(e);
        }
        if let Err(e) = self
            .backend
            .apply(&format!("DROP TABLE IF EXISTS {}", self.merge_table))
            .await
        {
            warn!(
                query_id = %self.config.query_id,
                error = %e,
                "failed to drop merge table after fix-up"
            );
        }
        Ok(self.config.target_table.clone())
    }

    /// Drop the merge table. Used on cancellation and failure cleanup; a
    /// partially merged result is never left visible.
    pub async fn discard(&self) {
        let sql = format!("DROP TABLE IF EXISTS {}", self.merge_table);
        if let Err(e) = self.backend.apply(&sql).await {
            warn!(
                query_id = %self.config.query_id,
                table = %self.merge_table,
                error = %e,
                "failed to drop merge table during cleanup"
            );
        }
    }
}

fn fatal_of(e: &CzarError) -> MergeFatal {
    match e {
        CzarError::MergerFatal(f) => f.clone(),
        other => MergeFatal::LoadInfile(other.to_string()),
    }
}

#[async_trait]
impl MergeSink for InfileMerger {
    async fn merge(&self, chunk_id: ChunkId, attempt: u32, batch: RowBatch) -> Result<()> {
        self.merge_batch(chunk_id, attempt, batch).await
    }
}
