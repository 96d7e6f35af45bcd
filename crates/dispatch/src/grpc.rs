//! gRPC glue for the worker transport and the czar control surface.
//!
//! RPC schema source: `proto/skyq_wire.proto`.
//!
//! Worker-side RPCs (generated under [`v1`]):
//! - `ExecuteChunk` (server stream of result frames)
//! - `CancelChunk`
//!
//! Czar control RPCs consumed by the client-protocol shim:
//! - `SubmitQuery`, `KillQuery`
//!
//! [`GrpcChunkTransport`] is the production [`ChunkTransport`]: it resolves
//! the owning worker from the chunk id through a [`WorkerDirectory`], keeps
//! one cached channel per endpoint, and maps RPC faults onto the czar error
//! taxonomy (connection faults are transient; worker-reported statement
//! errors are permanent).

use std::collections::HashMap;

use futures::StreamExt;
use skyq_common::{ChunkId, CzarError, QueryId, Result};
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tonic::{async_trait, Code, Status};

use crate::transport::{ChunkRequest, ChunkTransport, FrameStream};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("skyq.wire.v1");
}

pub use v1::czar_control_client::CzarControlClient;
pub use v1::czar_control_server::{CzarControl, CzarControlServer};
pub use v1::worker_transport_client::WorkerTransportClient;
pub use v1::worker_transport_server::{WorkerTransport, WorkerTransportServer};

/// Maps chunk ids to worker endpoints.
///
/// Explicit assignments win; unassigned chunks hash onto the endpoint list
/// so a fresh deployment works without a placement map.
#[derive(Debug, Clone, Default)]
pub struct WorkerDirectory {
    endpoints: Vec<String>,
    assignments: HashMap<u32, String>,
}

impl WorkerDirectory {
    /// Directory over a flat endpoint list.
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            assignments: HashMap::new(),
        }
    }

    /// Pin one chunk to an endpoint.
    pub fn assign(&mut self, chunk_id: ChunkId, endpoint: impl Into<String>) {
        self.assignments.insert(chunk_id.0, endpoint.into());
    }

    /// Endpoint owning a chunk.
    pub fn endpoint_for(&self, chunk_id: ChunkId) -> Result<String> {
        if let Some(e) = self.assignments.get(&chunk_id.0) {
            return Ok(e.clone());
        }
        if self.endpoints.is_empty() {
            return Err(CzarError::InvalidConfig(
                "worker directory has no endpoints".to_string(),
            ));
        }
        Ok(self.endpoints[chunk_id.0 as usize % self.endpoints.len()].clone())
    }
}

/// Production transport speaking the worker gRPC service.
pub struct GrpcChunkTransport {
    directory: WorkerDirectory,
    clients: Mutex<HashMap<String, WorkerTransportClient<Channel>>>,
}

impl GrpcChunkTransport {
    /// Build a transport over a worker directory.
    pub fn new(directory: WorkerDirectory) -> Self {
        Self {
            directory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, chunk_id: ChunkId) -> Result<WorkerTransportClient<Channel>> {
        let endpoint = self.directory.endpoint_for(chunk_id)?;
        let mut clients = self.clients.lock().await;
        if let Some(c) = clients.get(&endpoint) {
            return Ok(c.clone());
        }
        let client = WorkerTransportClient::connect(endpoint.clone())
            .await
            .map_err(|e| {
                CzarError::TransientTransport(format!("connect to {endpoint} failed: {e}"))
            })?;
        clients.insert(endpoint, client.clone());
        Ok(client)
    }
}

fn status_to_error(status: Status) -> CzarError {
    match status.code() {
        // A statement the worker rejected will be rejected again; do not retry.
        Code::InvalidArgument | Code::FailedPrecondition | Code::Internal => {
            CzarError::WorkerFailure(status.message().to_string())
        }
        _ => CzarError::TransientTransport(status.message().to_string()),
    }
}

#[async_trait]
impl ChunkTransport for GrpcChunkTransport {
    async fn execute(&self, request: ChunkRequest) -> Result<FrameStream> {
        let mut client = self.client_for(request.chunk_id).await?;
        let task = v1::ChunkTask {
            user_query_id: request.query_id.0,
            chunk_id: request.chunk_id.0,
            attempt: request.attempt,
            sql: request.sql,
            session_id: request.session.0,
        };
        let stream = client
            .execute_chunk(task)
            .await
            .map_err(status_to_error)?
            .into_inner();
        Ok(Box::pin(stream.map(|item| {
            item.map(|chunk| chunk.frame).map_err(status_to_error)
        })))
    }

    async fn cancel(&self, query_id: QueryId, chunk_id: ChunkId) -> Result<()> {
        let mut client = self.client_for(chunk_id).await?;
        client
            .cancel_chunk(v1::CancelChunkRequest {
                user_query_id: query_id.0,
                chunk_id: chunk_id.0,
            })
            .await
            .map_err(status_to_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerDirectory;
    use skyq_common::ChunkId;

    #[test]
    fn assignment_wins_over_hash() {
        let mut dir = WorkerDirectory::new(vec![
            "http://w1:9100".to_string(),
            "http://w2:9100".to_string(),
        ]);
        dir.assign(ChunkId(100), "http://w9:9100");
        assert_eq!(dir.endpoint_for(ChunkId(100)).unwrap(), "http://w9:9100");
        assert_eq!(dir.endpoint_for(ChunkId(101)).unwrap(), "http://w2:9100");
        assert_eq!(dir.endpoint_for(ChunkId(102)).unwrap(), "http://w1:9100");
    }

    #[test]
    fn empty_directory_is_invalid() {
        let dir = WorkerDirectory::default();
        assert!(dir.endpoint_for(ChunkId(1)).is_err());
    }
}
