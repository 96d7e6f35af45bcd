//! The streaming transport seam.
//!
//! The executive hands one [`ChunkRequest`] per dispatch attempt to a
//! [`ChunkTransport`] and receives a stream of encoded result frames. Worker
//! resolution from chunk id is the transport's concern. Implementations map
//! connection-level faults to `TransientTransport` so the executive can
//! retry, and worker-reported statement failures to `WorkerFailure`.

use std::pin::Pin;

use futures::Stream;
use skyq_common::{ChunkId, QueryId, Result, SessionId};
use tonic::async_trait;

/// Request body of one dispatched chunk sub-query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    /// Owning user query.
    pub query_id: QueryId,
    /// Chunk scanned by this sub-query.
    pub chunk_id: ChunkId,
    /// Dispatch attempt (1-based).
    pub attempt: u32,
    /// Substituted SQL.
    pub sql: String,
    /// Session the query runs under.
    pub session: SessionId,
}

/// Stream of encoded result frames for one chunk job attempt.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Streaming transport to the worker fleet.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Dispatch one chunk sub-query and stream back its result frames.
    async fn execute(&self, request: ChunkRequest) -> Result<FrameStream>;

    /// Ask the owning worker to abort an in-flight chunk sub-query.
    async fn cancel(&self, query_id: QueryId, chunk_id: ChunkId) -> Result<()>;
}
