//! Czar control service spoken by the client-protocol shim.

use std::sync::Arc;

use skyq_dispatch::grpc::{v1, CzarControl};
use tonic::{Request, Response, Status};

use crate::controller::Czar;

/// gRPC surface over a shared [`Czar`].
#[derive(Clone)]
pub struct CzarControlService {
    czar: Arc<Czar>,
}

impl CzarControlService {
    /// Wrap a czar instance.
    pub fn new(czar: Arc<Czar>) -> Self {
        Self { czar }
    }
}

#[tonic::async_trait]
impl CzarControl for CzarControlService {
    async fn submit_query(
        &self,
        request: Request<v1::SubmitQueryRequest>,
    ) -> Result<Response<v1::SubmitQueryResponse>, Status> {
        let req = request.into_inner();
        let result = self.czar.submit_query(&req.sql, &req.hints).await;
        Ok(Response::new(v1::SubmitQueryResponse {
            error_msg: result.error_msg,
            result_table: result.result_table,
            message_table: result.message_table,
            order_by: result.order_by,
        }))
    }

    async fn kill_query(
        &self,
        request: Request<v1::KillQueryRequest>,
    ) -> Result<Response<v1::KillQueryResponse>, Status> {
        let req = request.into_inner();
        let error_msg = match self.czar.kill_query(&req.token, &req.client_id).await {
            Ok(()) => String::new(),
            Err(e) => e.to_string(),
        };
        Ok(Response::new(v1::KillQueryResponse { error_msg }))
    }
}
