//! Queue role gRPC service (internal)
//!
//! Accepts forwarded enqueues from non-owner peers. Raft and cache methods
//! answer Unimplemented here.

use crate::proto::cluster_internal_server::{ClusterInternal, ClusterInternalServer};
use crate::proto::*;
use crate::queue::server::QueueServer;
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct QueueGrpcService {
    server: Arc<QueueServer>,
}

impl QueueGrpcService {
    pub fn new(server: Arc<QueueServer>) -> Self {
        Self { server }
    }

    /// Converts this service into a gRPC server instance.
    pub fn into_server(self) -> ClusterInternalServer<Self> {
        ClusterInternalServer::new(self)
    }
}

#[tonic::async_trait]
impl ClusterInternal for QueueGrpcService {
    async fn queue_forward(
        &self,
        req: Request<QueueForwardRequest>,
    ) -> Result<Response<QueueForwardResponse>, Status> {
        let inner = req.into_inner();
        tracing::debug!(
            "forwarded enqueue for {} from {}",
            inner.queue_name,
            inner.sender
        );

        // The sender already routed; enqueue locally regardless of the ring
        // view so a forward is always a single hop
        match self.server.enqueue_local(&inner.queue_name, inner.payload) {
            Ok(result) => Ok(Response::new(QueueForwardResponse {
                ok: true,
                msg_id: result.msg_id,
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(QueueForwardResponse {
                ok: false,
                msg_id: String::new(),
                error: e.to_string(),
            })),
        }
    }

    async fn request_vote(
        &self,
        _req: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        Err(Status::unimplemented("not a lock node"))
    }

    async fn append_entries(
        &self,
        _req: Request<AppendRequest>,
    ) -> Result<Response<AppendResponse>, Status> {
        Err(Status::unimplemented("not a lock node"))
    }

    async fn lock_forward(
        &self,
        _req: Request<LockForwardRequest>,
    ) -> Result<Response<LockForwardResponse>, Status> {
        Err(Status::unimplemented("not a lock node"))
    }

    async fn cache_read(
        &self,
        _req: Request<CacheReadRequest>,
    ) -> Result<Response<CacheReadResponse>, Status> {
        Err(Status::unimplemented("not a cache node"))
    }

    async fn cache_invalidate(
        &self,
        _req: Request<CacheInvalidateRequest>,
    ) -> Result<Response<CacheInvalidateAck>, Status> {
        Err(Status::unimplemented("not a cache node"))
    }
}
