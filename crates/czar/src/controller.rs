//! The user-query controller.
//!
//! Binds rewrite, dispatch and merge to one logical query id: assigns the
//! session, creates and write-locks the message table, runs the rewrite
//! pipeline, releases chunk jobs to the executive, awaits completion, runs
//! the merge fix-up, writes queued messages, and unlocks the message table
//! to release the client shim.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use skyq_analysis::{AnalysisContext, ChunkQuerySpec};
use skyq_common::metrics::global_metrics;
use skyq_common::{ChunkId, CzarConfig, CzarError, QueryId, Result, SessionId};
use skyq_dispatch::{
    ChunkTransport, DispatchConfig, Executive, JobInput, MergeSink, QueryOutcome,
};
use skyq_geom::ChunkSpec;
use skyq_merge::{FixupSpec, InfileMerger, InfileMergerConfig, MergeBackend};
use skyq_metadata::MetadataCache;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::message_table::{MessageTable, QueryMessage, Severity};
use crate::user_query::{UserQuery, UserQueryState};

/// Synchronous response of `submit_query`, consumed by the shim.
#[derive(Debug, Clone, Default)]
pub struct SubmitResult {
    /// Non-empty on synchronous rejection.
    pub error_msg: String,
    /// Result table the shim reads once the message table unlocks.
    pub result_table: String,
    /// Message table the shim blocks on.
    pub message_table: String,
    /// Final ordering the shim may re-apply when paging.
    pub order_by: String,
}

struct RunningQuery {
    executive: Arc<Executive>,
    record: Arc<Mutex<UserQuery>>,
    client_id: String,
}

/// The czar: front-end coordinator for all user queries of one process.
pub struct Czar {
    config: CzarConfig,
    metadata: Arc<MetadataCache>,
    transport: Arc<dyn ChunkTransport>,
    backend: Arc<dyn MergeBackend>,
    global_slots: Arc<Semaphore>,
    next_query_id: AtomicU64,
    next_session: AtomicU32,
    running: Mutex<HashMap<u64, RunningQuery>>,
}

impl Czar {
    /// Build a czar over its external collaborators.
    pub fn new(
        config: CzarConfig,
        metadata: Arc<MetadataCache>,
        transport: Arc<dyn ChunkTransport>,
        backend: Arc<dyn MergeBackend>,
    ) -> Arc<Self> {
        let global = config.max_in_flight_global.max(1);
        Arc::new(Self {
            config,
            metadata,
            transport,
            backend,
            global_slots: Arc::new(Semaphore::new(global)),
            next_query_id: AtomicU64::new(1),
            next_session: AtomicU32::new(1),
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Submit one SQL statement.
    ///
    /// Recognized hints: `db` (default database), `resultTable`, `msgTable`,
    /// `clientId`. A non-empty `error_msg` signals synchronous rejection;
    /// otherwise the shim reads `result_table` after the message table
    /// unlocks.
    pub async fn submit_query(
        self: &Arc<Self>,
        sql: &str,
        hints: &HashMap<String, String>,
    ) -> SubmitResult {
        let id = QueryId(self.next_query_id.fetch_add(1, Ordering::SeqCst));
        let session = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst));
        let default_db = hints.get("db").cloned();
        let result_table = hints
            .get("resultTable")
            .cloned()
            .unwrap_or_else(|| format!("result_{id}"));
        let message_table = hints
            .get("msgTable")
            .cloned()
            .unwrap_or_else(|| format!("message_{id}"));
        let client_id = hints.get("clientId").cloned().unwrap_or_default();

        let mut ctx = AnalysisContext::new(Arc::clone(&self.metadata), default_db.clone());
        ctx.default_overlap_deg = self.config.spatial_overlap_deg;
        let spec = match skyq_analysis::rewrite(sql, &ctx) {
            Ok(spec) => spec,
            Err(e) => {
                info!(query_id = %id, error = %e, "rejecting user query");
                return SubmitResult {
                    error_msg: e.to_string(),
                    ..SubmitResult::default()
                };
            }
        };
        let jobs = match build_jobs(&spec) {
            Ok(jobs) => jobs,
            Err(e) => {
                return SubmitResult {
                    error_msg: e.to_string(),
                    ..SubmitResult::default()
                }
            }
        };
        let order_by = spec
            .fixup
            .as_ref()
            .and_then(|f| f.order_by.as_ref())
            .map(|o| format!("ORDER BY {o}"))
            .unwrap_or_default();

        let messages = Arc::new(MessageTable::new(
            message_table.clone(),
            Arc::clone(&self.backend),
        ));
        if let Err(e) = messages.lock().await {
            return SubmitResult {
                error_msg: format!("failed to lock message table: {e}"),
                ..SubmitResult::default()
            };
        }

        let merger = Arc::new(InfileMerger::new(
            InfileMergerConfig {
                query_id: id,
                target_table: result_table.clone(),
                fixup: spec.fixup.as_ref().map(|f| FixupSpec {
                    select: f.select.clone(),
                    post: f.post.clone(),
                    order_by_limit: f.order_by_limit(),
                }),
                buffer_bytes: self.config.merge_buffer_bytes,
            },
            Arc::clone(&self.backend),
        ));
        let executive = Executive::new(
            id,
            session,
            DispatchConfig {
                max_attempts: self.config.max_attempts,
                retry_backoff_base_ms: self.config.retry_backoff_base_ms,
                job_timeout_ms: self.config.job_timeout_ms,
                max_in_flight: self.config.per_query_limit(),
            },
            Arc::clone(&self.transport),
            Arc::clone(&merger) as Arc<dyn MergeSink>,
            Arc::clone(&self.global_slots),
        );

        let record = Arc::new(Mutex::new(UserQuery {
            id,
            sql: sql.to_string(),
            default_db,
            session,
            state: UserQueryState::Pending,
            result_table: result_table.clone(),
            message_table: message_table.clone(),
            error: None,
        }));
        self.running.lock().expect("running queries lock").insert(
            id.0,
            RunningQuery {
                executive: Arc::clone(&executive),
                record: Arc::clone(&record),
                client_id,
            },
        );
        global_metrics().inc_queries_submitted();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive_query(id, jobs, executive, merger, messages, record)
                .await;
        });

        SubmitResult {
            error_msg: String::new(),
            result_table,
            message_table,
            order_by,
        }
    }

    async fn drive_query(
        self: Arc<Self>,
        id: QueryId,
        jobs: Vec<JobInput>,
        executive: Arc<Executive>,
        merger: Arc<InfileMerger>,
        messages: Arc<MessageTable>,
        record: Arc<Mutex<UserQuery>>,
    ) {
        let session = record.lock().expect("query record lock").session;
        set_state(&record, UserQueryState::Dispatching);
        executive.submit(jobs);
        set_state(&record, UserQueryState::Executing);

        let join = executive.join().await;
        let terminal = match join.outcome {
            QueryOutcome::Complete => {
                set_state(&record, UserQueryState::Merging);
                if merger.needs_fixup() {
                    set_state(&record, UserQueryState::Fixup);
                }
                match merger.finalize().await {
                    Ok(table) => {
                        info!(query_id = %id, result_table = %table, "user query complete");
                        messages.queue(QueryMessage {
                            session,
                            severity: Severity::Info,
                            code: 0,
                            message: format!("COMPLETE: result in {table}"),
                        });
                        UserQueryState::Complete
                    }
                    Err(e) => {
                        warn!(query_id = %id, error = %e, "merge finalize failed");
                        record.lock().expect("query record lock").error = Some(e.to_string());
                        messages.queue(QueryMessage {
                            session,
                            severity: Severity::Error,
                            code: 1,
                            message: e.to_string(),
                        });
                        UserQueryState::Failed
                    }
                }
            }
            QueryOutcome::Failed => {
                let cause = join
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown failure".to_string());
                warn!(query_id = %id, error = %cause, "user query failed");
                merger.discard().await;
                record.lock().expect("query record lock").error = Some(cause.clone());
                messages.queue(QueryMessage {
                    session,
                    severity: Severity::Error,
                    code: 1,
                    message: cause,
                });
                UserQueryState::Failed
            }
            QueryOutcome::Cancelled => {
                info!(query_id = %id, "user query cancelled");
                merger.discard().await;
                messages.queue(QueryMessage {
                    session,
                    severity: Severity::Info,
                    code: 0,
                    message: "CANCELLED".to_string(),
                });
                UserQueryState::Cancelled
            }
        };

        set_state(&record, terminal);
        global_metrics().inc_queries_terminal(terminal.as_str());
        if let Err(e) = messages.unlock().await {
            warn!(query_id = %id, error = %e, "failed to unlock message table");
        }
        self.running
            .lock()
            .expect("running queries lock")
            .remove(&id.0);
    }

    /// Map a client kill token onto a running query and cancel it.
    pub async fn kill_query(&self, token: &str, client_id: &str) -> Result<()> {
        let id = parse_kill_token(token)?;
        let executive = {
            let running = self.running.lock().expect("running queries lock");
            let Some(entry) = running.get(&id) else {
                return Err(CzarError::Unsupported(format!(
                    "no running query with id {id}"
                )));
            };
            if !client_id.is_empty()
                && !entry.client_id.is_empty()
                && entry.client_id != client_id
            {
                return Err(CzarError::Unsupported(format!(
                    "query {id} belongs to a different client"
                )));
            }
            Arc::clone(&entry.executive)
        };
        executive.cancel().await;
        Ok(())
    }

    /// Current state of a query, while the controller still owns it.
    pub fn query_state(&self, id: QueryId) -> Option<UserQueryState> {
        self.running
            .lock()
            .expect("running queries lock")
            .get(&id.0)
            .map(|r| r.record.lock().expect("query record lock").state)
    }
}

fn set_state(record: &Arc<Mutex<UserQuery>>, state: UserQueryState) {
    record.lock().expect("query record lock").state = state;
}

/// Expand a chunk query specification into dispatchable jobs.
fn build_jobs(spec: &ChunkQuerySpec) -> Result<Vec<JobInput>> {
    if spec.chunks.is_empty() {
        // Single unchunked sub-job.
        let unit = ChunkSpec::whole(ChunkId(0));
        return Ok(vec![JobInput {
            chunk_id: unit.chunk_id,
            sql: spec.sql_for(&unit)?,
        }]);
    }
    spec.chunks
        .iter()
        .map(|chunk| {
            Ok(JobInput {
                chunk_id: chunk.chunk_id,
                sql: spec.sql_for(chunk)?,
            })
        })
        .collect()
}

/// Parse `KILL <n>`, `KILL QUERY <n>` and `CANCEL <n>` tokens.
pub fn parse_kill_token(token: &str) -> Result<u64> {
    let parts: Vec<&str> = token.split_whitespace().collect();
    let id = match parts.as_slice() {
        [verb, id]
            if verb.eq_ignore_ascii_case("KILL") || verb.eq_ignore_ascii_case("CANCEL") =>
        {
            id
        }
        [verb, noun, id]
            if verb.eq_ignore_ascii_case("KILL") && noun.eq_ignore_ascii_case("QUERY") =>
        {
            id
        }
        _ => {
            return Err(CzarError::Unsupported(format!(
                "unrecognized kill token '{token}'"
            )))
        }
    };
    id.parse::<u64>().map_err(|_| {
        CzarError::Unsupported(format!("kill token '{token}' has no numeric query id"))
    })
}
