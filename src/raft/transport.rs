//! gRPC-backed Raft transport

use crate::common::{PeerSet, Result};
use crate::raft::node::RaftTransport;
use crate::raft::rpc::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use std::sync::Arc;

/// Routes Raft RPCs to peers over the shared `ClusterInternal` channel
pub struct GrpcRaftTransport {
    peers: Arc<PeerSet>,
}

impl GrpcRaftTransport {
    pub fn new(peers: Arc<PeerSet>) -> Self {
        Self { peers }
    }
}

#[tonic::async_trait]
impl RaftTransport for GrpcRaftTransport {
    async fn request_vote(&self, peer_id: &str, req: VoteRequest) -> Result<VoteResponse> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| crate::Error::Internal(format!("unknown peer: {}", peer_id)))?;
        let resp = peer.request_vote((&req).into()).await?;
        Ok((&resp).into())
    }

    async fn append_entries(&self, peer_id: &str, req: AppendRequest) -> Result<AppendResponse> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| crate::Error::Internal(format!("unknown peer: {}", peer_id)))?;
        let resp = peer.append_entries((&req).into()).await?;
        Ok((&resp).into())
    }
}
