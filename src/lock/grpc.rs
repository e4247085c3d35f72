//! Lock role gRPC service (internal)
//!
//! Carries Raft traffic between lock peers and the non-leader -> leader
//! write redirect. Queue and cache methods answer Unimplemented here.

use crate::lock::server::{AcquireOutcome, LockServer};
use crate::lock::state::LockMode;
use crate::proto::cluster_internal_server::{ClusterInternal, ClusterInternalServer};
use crate::proto::*;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};

pub struct LockGrpcService {
    server: Arc<LockServer>,
}

impl LockGrpcService {
    pub fn new(server: Arc<LockServer>) -> Self {
        Self { server }
    }

    /// Converts this service into a gRPC server instance.
    pub fn into_server(self) -> ClusterInternalServer<Self> {
        ClusterInternalServer::new(self)
    }
}

#[tonic::async_trait]
impl ClusterInternal for LockGrpcService {
    async fn request_vote(
        &self,
        req: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let domain: crate::raft::rpc::VoteRequest = (&req.into_inner()).into();
        let resp = self.server.raft().handle_request_vote(&domain);
        Ok(Response::new((&resp).into()))
    }

    async fn append_entries(
        &self,
        req: Request<AppendRequest>,
    ) -> Result<Response<AppendResponse>, Status> {
        let domain: crate::raft::rpc::AppendRequest = (&req.into_inner()).into();
        let resp = self.server.raft().handle_append_entries(&domain);
        Ok(Response::new((&resp).into()))
    }

    async fn lock_forward(
        &self,
        req: Request<LockForwardRequest>,
    ) -> Result<Response<LockForwardResponse>, Status> {
        let inner = req.into_inner();

        let reply = match inner.op.as_str() {
            "acquire" => {
                let mode: LockMode = inner.mode.parse().map_err(|e: crate::Error| {
                    Status::invalid_argument(e.to_string())
                })?;
                let wait_timeout = if inner.wait_timeout_ms > 0 {
                    Some(Duration::from_millis(inner.wait_timeout_ms))
                } else {
                    None
                };
                let ttl = if inner.ttl_ms > 0 {
                    Some(Duration::from_millis(inner.ttl_ms))
                } else {
                    None
                };
                match self
                    .server
                    .acquire(&inner.resource, &inner.client_id, mode, wait_timeout, ttl)
                    .await
                {
                    Ok(AcquireOutcome::Granted { lock_id }) => LockForwardResponse {
                        status: "granted".to_string(),
                        message: "lock acquired".to_string(),
                        lock_id,
                        leader_hint: String::new(),
                    },
                    Ok(AcquireOutcome::Waiting { position }) => LockForwardResponse {
                        status: "waiting".to_string(),
                        message: format!("queued at position {}", position),
                        lock_id: String::new(),
                        leader_hint: String::new(),
                    },
                    Ok(AcquireOutcome::Denied { reason }) => LockForwardResponse {
                        status: "denied".to_string(),
                        message: reason,
                        lock_id: String::new(),
                        leader_hint: String::new(),
                    },
                    Err(crate::Error::NotLeader(hint)) => LockForwardResponse {
                        status: "denied".to_string(),
                        message: "not leader".to_string(),
                        lock_id: String::new(),
                        leader_hint: hint,
                    },
                    Err(e) => return Err(e.to_grpc_status()),
                }
            }
            "release" => match self.server.release(&inner.resource, &inner.client_id).await {
                Ok(()) => LockForwardResponse {
                    status: "ok".to_string(),
                    message: "lock released".to_string(),
                    lock_id: String::new(),
                    leader_hint: String::new(),
                },
                Err(crate::Error::NotLeader(hint)) => LockForwardResponse {
                    status: "denied".to_string(),
                    message: "not leader".to_string(),
                    lock_id: String::new(),
                    leader_hint: hint,
                },
                Err(e) => return Err(e.to_grpc_status()),
            },
            other => {
                return Err(Status::invalid_argument(format!(
                    "unknown lock op: {}",
                    other
                )))
            }
        };

        Ok(Response::new(reply))
    }

    async fn queue_forward(
        &self,
        _req: Request<QueueForwardRequest>,
    ) -> Result<Response<QueueForwardResponse>, Status> {
        Err(Status::unimplemented("not a queue node"))
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
