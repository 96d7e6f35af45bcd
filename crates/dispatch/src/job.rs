//! Per-chunk sub-job records.

use skyq_common::ChunkId;

/// Chunk job lifecycle states tracked by the executive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Built but not yet released to the transport.
    New,
    /// Request handed to the transport.
    Dispatched,
    /// First frame received, results flowing.
    Streaming,
    /// Stream completed and merged.
    Done,
    /// Permanently failed (after retries, or a non-retryable error).
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl JobState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }
}

/// One per-chunk sub-job owned by the executive.
#[derive(Debug, Clone)]
pub struct ChunkJob {
    /// Chunk this job scans.
    pub chunk_id: ChunkId,
    /// Substituted SQL executed on the owning worker.
    pub sql: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Dispatch attempts so far (1-based once dispatched).
    pub attempt: u32,
    /// Last error message observed for this job.
    pub last_error: Option<String>,
}

impl ChunkJob {
    /// A freshly built job.
    pub fn new(chunk_id: ChunkId, sql: String) -> Self {
        Self {
            chunk_id,
            sql,
            state: JobState::New,
            attempt: 0,
            last_error: None,
        }
    }
}
