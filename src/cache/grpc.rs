//! Cache role gRPC service and peer fan-out

use crate::cache::server::{CachePeers, CacheServer};
use crate::common::PeerSet;
use crate::proto::cluster_internal_server::{ClusterInternal, ClusterInternalServer};
use crate::proto::*;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Incoming side: answers peer read and invalidate broadcasts
pub struct CacheGrpcService {
    server: Arc<CacheServer>,
}

impl CacheGrpcService {
    pub fn new(server: Arc<CacheServer>) -> Self {
        Self { server }
    }

    /// Converts this service into a gRPC server instance.
    pub fn into_server(self) -> ClusterInternalServer<Self> {
        ClusterInternalServer::new(self)
    }
}

#[tonic::async_trait]
impl ClusterInternal for CacheGrpcService {
    async fn cache_read(
        &self,
        req: Request<CacheReadRequest>,
    ) -> Result<Response<CacheReadResponse>, Status> {
        let inner = req.into_inner();
        tracing::debug!("cache_read for {} from {}", inner.key, inner.sender);

        match self.server.handle_remote_read(&inner.key) {
            Some(value) => Ok(Response::new(CacheReadResponse {
                has_data: true,
                value,
                state: self
                    .server
                    .state_of(&inner.key)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
            })),
            None => Ok(Response::new(CacheReadResponse {
                has_data: false,
                value: Vec::new(),
                state: String::new(),
            })),
        }
    }

    async fn cache_invalidate(
        &self,
        req: Request<CacheInvalidateRequest>,
    ) -> Result<Response<CacheInvalidateAck>, Status> {
        let inner = req.into_inner();
        tracing::debug!("cache_invalidate for {} from {}", inner.key, inner.sender);
        self.server.handle_remote_invalidate(&inner.key);
        Ok(Response::new(CacheInvalidateAck { ok: true }))
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

    async fn queue_forward(
        &self,
        _req: Request<QueueForwardRequest>,
    ) -> Result<Response<QueueForwardResponse>, Status> {
        Err(Status::unimplemented("not a queue node"))
    }
}

/// Outgoing side: concurrent broadcast to every cache peer.
///
/// A peer that fails or times out counts as "no data" on reads and as
/// invalidated on writes; a reachable peer always responds.
pub struct GrpcCachePeers {
    peers: Arc<PeerSet>,
}

impl GrpcCachePeers {
    pub fn new(peers: Arc<PeerSet>) -> Self {
        Self { peers }
    }
}

#[tonic::async_trait]
impl CachePeers for GrpcCachePeers {
    async fn read(&self, key: &str, sender: &str) -> Option<Vec<u8>> {
        let calls = self.peers.iter().map(|peer| {
            let req = CacheReadRequest {
                key: key.to_string(),
                sender: sender.to_string(),
            };
            async move { peer.cache_read(req).await }
        });

        let responses = futures::future::join_all(calls).await;
        responses
            .into_iter()
            .flatten()
            .find(|resp| resp.has_data)
            .map(|resp| resp.value)
    }

    async fn invalidate(&self, key: &str, sender: &str) -> usize {
        let calls = self.peers.iter().map(|peer| {
            let peer_id = peer.peer_id().to_string();
            let req = CacheInvalidateRequest {
                key: key.to_string(),
                sender: sender.to_string(),
            };
            async move { (peer_id, peer.cache_invalidate(req).await) }
        });

        let responses = futures::future::join_all(calls).await;
        let mut acks = 0;
        for (peer_id, result) in responses {
            match result {
                Ok(ack) if ack.ok => acks += 1,
                Ok(_) => {}
                Err(e) => {
                    // Treated as invalidated: a frozen peer rediscovers the
                    // value on its next read broadcast
                    tracing::warn!("invalidate of {} on {} failed: {}", key, peer_id, e);
                }
            }
        }
        acks
    }
}
