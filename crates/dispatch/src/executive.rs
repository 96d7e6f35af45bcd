//! Per-user-query dispatcher.
//!
//! The executive owns every chunk job of one user query: it releases jobs to
//! the transport under per-query and global in-flight bounds, consumes each
//! job's frame stream through a [`FrameValidator`], hands validated batches
//! to the merge sink, and drives the retry/cancel/join lifecycle.
//!
//! Failure policy:
//! - transient transport faults retry with exponential backoff up to
//!   `max_attempts`, then escalate to `WorkerFailure`;
//! - a transient fault after rows were already merged escalates immediately
//!   (merged rows cannot be unloaded, so the attempt must not be repeated);
//! - permanent faults fail the user query, cancel the remaining jobs, and
//!   preserve the first observed error;
//! - cancellation is cooperative: the abort flag is checked at every
//!   callback boundary and in-flight statements are aborted via the
//!   transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use skyq_common::metrics::global_metrics;
use skyq_common::{ChunkId, CzarError, QueryId, Result, SessionId};
use tokio::sync::{watch, Semaphore};
use tonic::async_trait;
use tracing::{debug, info, warn};

use crate::frame::RowBatch;
use crate::job::{ChunkJob, JobState};
use crate::reader::FrameValidator;
use crate::transport::{ChunkRequest, ChunkTransport};

/// Merge-side consumer of validated row batches.
#[async_trait]
pub trait MergeSink: Send + Sync {
    /// Merge one batch of `(chunk, attempt)`. Implementations enforce the
    /// at-most-once-per-chunk contribution rule.
    async fn merge(&self, chunk_id: ChunkId, attempt: u32, batch: RowBatch) -> Result<()>;
}

/// Dispatch tuning derived from the czar configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Max attempts per chunk job.
    pub max_attempts: u32,
    /// Base retry backoff in milliseconds (doubled per attempt).
    pub retry_backoff_base_ms: u64,
    /// Per-job timeout for dispatch and per-frame waits.
    pub job_timeout_ms: u64,
    /// In-flight bound for this user query.
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_base_ms: 250,
            job_timeout_ms: 600_000,
            max_in_flight: 64,
        }
    }
}

/// Terminal disposition of one user query's dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Every job finished and merged.
    Complete,
    /// A permanent failure stopped the query.
    Failed,
    /// The user cancelled the query.
    Cancelled,
}

/// Result of [`Executive::join`].
#[derive(Debug)]
pub struct JoinResult {
    /// Terminal disposition.
    pub outcome: QueryOutcome,
    /// First permanent error, for `Failed` outcomes.
    pub error: Option<CzarError>,
}

/// One chunk job input: the chunk and its substituted SQL.
#[derive(Debug, Clone)]
pub struct JobInput {
    /// Chunk to scan.
    pub chunk_id: ChunkId,
    /// Substituted standalone SQL.
    pub sql: String,
}

/// Per-user-query dispatch coordinator.
pub struct Executive {
    query_id: QueryId,
    session: SessionId,
    config: DispatchConfig,
    transport: Arc<dyn ChunkTransport>,
    sink: Arc<dyn MergeSink>,
    query_slots: Arc<Semaphore>,
    global_slots: Arc<Semaphore>,
    jobs: Mutex<HashMap<ChunkId, ChunkJob>>,
    cancelled: AtomicBool,
    failed: AtomicBool,
    first_error: Mutex<Option<CzarError>>,
    terminal_tx: watch::Sender<usize>,
    terminal_rx: watch::Receiver<usize>,
    total: Mutex<usize>,
}

impl Executive {
    /// Build an executive for one user query.
    pub fn new(
        query_id: QueryId,
        session: SessionId,
        config: DispatchConfig,
        transport: Arc<dyn ChunkTransport>,
        sink: Arc<dyn MergeSink>,
        global_slots: Arc<Semaphore>,
    ) -> Arc<Self> {
        let (terminal_tx, terminal_rx) = watch::channel(0);
        Arc::new(Self {
            query_id,
            session,
            query_slots: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            config,
            transport,
            sink,
            global_slots,
            jobs: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            first_error: Mutex::new(None),
            terminal_tx,
            terminal_rx,
            total: Mutex::new(0),
        })
    }

    fn is_aborted(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.failed.load(Ordering::SeqCst)
    }

    /// Build and release all chunk jobs of one specification.
    pub fn submit(self: &Arc<Self>, inputs: Vec<JobInput>) {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        *self.total.lock().expect("total lock") = inputs.len();
        info!(
            query_id = %self.query_id,
            jobs = inputs.len(),
            "dispatching user query"
        );
        for input in &inputs {
            jobs.insert(input.chunk_id, ChunkJob::new(input.chunk_id, input.sql.clone()));
        }
        drop(jobs);
        self.publish_gauges();
        for input in inputs {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_job(input).await;
            });
        }
    }

    /// Cooperatively cancel the user query.
    pub async fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(query_id = %self.query_id, "cancelling user query");
        let in_flight: Vec<ChunkId> = {
            let jobs = self.jobs.lock().expect("jobs lock");
            jobs.values()
                .filter(|j| matches!(j.state, JobState::Dispatched | JobState::Streaming))
                .map(|j| j.chunk_id)
                .collect()
        };
        for chunk_id in in_flight {
            if let Err(e) = self.transport.cancel(self.query_id, chunk_id).await {
                debug!(
                    query_id = %self.query_id,
                    chunk_id = %chunk_id,
                    error = %e,
                    "transport cancel failed"
                );
            }
        }
    }

    /// Block until every job reaches a terminal state.
    pub async fn join(&self) -> JoinResult {
        let total = *self.total.lock().expect("total lock");
        let mut rx = self.terminal_rx.clone();
        while *rx.borrow() < total {
            if rx.changed().await.is_err() {
                break;
            }
        }
        let error = self.first_error.lock().expect("error lock").take();
        let outcome = if self.failed.load(Ordering::SeqCst) {
            QueryOutcome::Failed
        } else if self.cancelled.load(Ordering::SeqCst) {
            QueryOutcome::Cancelled
        } else {
            QueryOutcome::Complete
        };
        JoinResult { outcome, error }
    }

    /// Snapshot of job states, keyed by chunk.
    pub fn job_states(&self) -> HashMap<ChunkId, JobState> {
        self.jobs
            .lock()
            .expect("jobs lock")
            .iter()
            .map(|(k, v)| (*k, v.state))
            .collect()
    }

    async fn run_job(self: Arc<Self>, input: JobInput) {
        let _query_permit = self
            .query_slots
            .acquire()
            .await
            .expect("query semaphore never closed");
        let _global_permit = self
            .global_slots
            .acquire()
            .await
            .expect("global semaphore never closed");

        if self.is_aborted() {
            self.mark(input.chunk_id, JobState::Cancelled, None);
            self.note_terminal();
            return;
        }

        let start = std::time::Instant::now();
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            self.mark_dispatched(input.chunk_id, attempt);
            if attempt > 1 {
                global_metrics().inc_dispatch_retries(&self.query_id.to_string(), input.chunk_id.0);
            }
            match self.run_attempt(&input, attempt).await {
                Ok(()) => {
                    self.mark(input.chunk_id, JobState::Done, None);
                    break;
                }
                Err(e) if e.is_cancel() => {
                    self.mark(input.chunk_id, JobState::Cancelled, None);
                    break;
                }
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(
                        query_id = %self.query_id,
                        chunk_id = %input.chunk_id,
                        attempt,
                        error = %e,
                        "transient chunk failure, retrying"
                    );
                    self.mark(input.chunk_id, JobState::New, Some(e.to_string()));
                    let backoff = self
                        .config
                        .retry_backoff_base_ms
                        .saturating_mul(1_u64 << (attempt.saturating_sub(1).min(10)));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    if self.is_aborted() {
                        self.mark(input.chunk_id, JobState::Cancelled, None);
                        break;
                    }
                }
                Err(e) => {
                    let e = if e.is_transient() {
                        CzarError::WorkerFailure(format!(
                            "chunk {} exhausted {} attempts: {e}",
                            input.chunk_id, self.config.max_attempts
                        ))
                    } else {
                        e
                    };
                    self.mark(input.chunk_id, JobState::Failed, Some(e.to_string()));
                    self.fail_query(e);
                    break;
                }
            }
        }
        global_metrics().observe_job_seconds(
            &self.query_id.to_string(),
            input.chunk_id.0,
            start.elapsed().as_secs_f64(),
        );
        self.note_terminal();
    }

    async fn run_attempt(&self, input: &JobInput, attempt: u32) -> Result<()> {
        let timeout = Duration::from_millis(self.config.job_timeout_ms.max(1));
        let request = ChunkRequest {
            query_id: self.query_id,
            chunk_id: input.chunk_id,
            attempt,
            sql: input.sql.clone(),
            session: self.session,
        };
        let mut stream = tokio::time::timeout(timeout, self.transport.execute(request))
            .await
            .map_err(|_| {
                CzarError::TransientTransport(format!(
                    "dispatch of chunk {} timed out",
                    input.chunk_id
                ))
            })??;

        let mut validator = FrameValidator::new(self.query_id, input.chunk_id, attempt);
        loop {
            if self.is_aborted() {
                let _ = self.transport.cancel(self.query_id, input.chunk_id).await;
                return Err(CzarError::Cancelled);
            }
            let next = tokio::time::timeout(timeout, stream.next()).await.map_err(|_| {
                harden(
                    CzarError::TransientTransport(format!(
                        "chunk {} stream stalled",
                        input.chunk_id
                    )),
                    validator.accepted(),
                )
            })?;
            match next {
                Some(Ok(bytes)) => {
                    if validator.accepted() == 0 {
                        self.mark(input.chunk_id, JobState::Streaming, None);
                    }
                    if let Some(batch) = validator.accept(&bytes)? {
                        self.sink.merge(input.chunk_id, attempt, batch).await?;
                    }
                    if validator.finished() {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(harden(e, validator.accepted())),
                None => {
                    return Err(harden(
                        CzarError::TransientTransport(format!(
                            "chunk {} stream ended before end-of-stream frame",
                            input.chunk_id
                        )),
                        validator.accepted(),
                    ))
                }
            }
        }
    }

    fn fail_query(&self, error: CzarError) {
        let mut first = self.first_error.lock().expect("error lock");
        if first.is_none() {
            warn!(
                query_id = %self.query_id,
                error = %error,
                "user query failed, cancelling remaining jobs"
            );
            *first = Some(error);
        }
        drop(first);
        self.failed.store(true, Ordering::SeqCst);
    }

    fn mark_dispatched(&self, chunk_id: ChunkId, attempt: u32) {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        if let Some(job) = jobs.get_mut(&chunk_id) {
            job.state = JobState::Dispatched;
            job.attempt = attempt;
        }
        drop(jobs);
        self.publish_gauges();
    }

    fn mark(&self, chunk_id: ChunkId, state: JobState, error: Option<String>) {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        if let Some(job) = jobs.get_mut(&chunk_id) {
            job.state = state;
            if error.is_some() {
                job.last_error = error;
            }
        }
        drop(jobs);
        self.publish_gauges();
    }

    fn publish_gauges(&self) {
        let jobs = self.jobs.lock().expect("jobs lock");
        let queued = jobs.values().filter(|j| j.state == JobState::New).count();
        let running = jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Dispatched | JobState::Streaming))
            .count();
        drop(jobs);
        let id = self.query_id.to_string();
        global_metrics().set_dispatch_queued_jobs(&id, queued as u64);
        global_metrics().set_dispatch_running_jobs(&id, running as u64);
    }

    fn note_terminal(&self) {
        self.terminal_tx.send_modify(|n| *n += 1);
    }
}

/// A transient fault that happens after rows were merged cannot be retried:
/// the partial contribution is already in the merge table.
fn harden(e: CzarError, accepted_frames: u64) -> CzarError {
    if e.is_transient() && accepted_frames > 0 {
        CzarError::WorkerFailure(format!("stream lost after partial merge: {e}"))
    } else {
        e
    }
}
