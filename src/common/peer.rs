//! Peer RPC client
//!
//! Lazily-connected gRPC channel per peer with a per-call deadline.
//! A failed call drops the cached channel so the next call reconnects;
//! callers see `Timeout` / `ConnectionFailed` and decide whether to retry.

use crate::common::{Error, Result};
use crate::proto::cluster_internal_client::ClusterInternalClient;
use crate::proto::*;
use std::collections::HashMap;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// Client for a single named peer
pub struct PeerClient {
    peer_id: String,
    endpoint: String,
    timeout: Duration,
    client: tokio::sync::Mutex<Option<ClusterInternalClient<Channel>>>,
}

impl PeerClient {
    pub fn new(peer_id: String, endpoint: String, timeout: Duration) -> Self {
        Self {
            peer_id,
            endpoint,
            timeout,
            client: tokio::sync::Mutex::new(None),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn connect(&self) -> Result<ClusterInternalClient<Channel>> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let endpoint = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| Error::InvalidConfig(format!("bad peer endpoint {}: {}", self.endpoint, e)))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);

        let channel = endpoint.connect().await.map_err(|e| {
            Error::ConnectionFailed(format!("{} ({}): {}", self.peer_id, self.endpoint, e))
        })?;

        let client = ClusterInternalClient::new(channel);
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Drop the cached channel; the next call reconnects
    async fn reset(&self) {
        *self.client.lock().await = None;
    }

    async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(ClusterInternalClient<Channel>) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        let client = self.connect().await?;
        match tokio::time::timeout(self.timeout, f(client)).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => {
                if status.code() == tonic::Code::Unavailable {
                    self.reset().await;
                    Err(Error::Unavailable(format!("{}: {}", self.peer_id, status)))
                } else {
                    Err(Error::Grpc(status))
                }
            }
            Err(_) => {
                self.reset().await;
                Err(Error::Timeout(format!("rpc to {}", self.peer_id)))
            }
        }
    }

    pub async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.call(|mut c| async move { c.request_vote(req).await })
            .await
    }

    pub async fn append_entries(&self, req: AppendRequest) -> Result<AppendResponse> {
        self.call(|mut c| async move { c.append_entries(req).await })
            .await
    }

    pub async fn lock_forward(&self, req: LockForwardRequest) -> Result<LockForwardResponse> {
        self.call(|mut c| async move { c.lock_forward(req).await })
            .await
    }

    pub async fn queue_forward(&self, req: QueueForwardRequest) -> Result<QueueForwardResponse> {
        self.call(|mut c| async move { c.queue_forward(req).await })
            .await
    }

    pub async fn cache_read(&self, req: CacheReadRequest) -> Result<CacheReadResponse> {
        self.call(|mut c| async move { c.cache_read(req).await })
            .await
    }

    pub async fn cache_invalidate(
        &self,
        req: CacheInvalidateRequest,
    ) -> Result<CacheInvalidateAck> {
        self.call(|mut c| async move { c.cache_invalidate(req).await })
            .await
    }
}

/// All same-role peers of this node, keyed by peer id
pub struct PeerSet {
    peers: HashMap<String, PeerClient>,
}

impl PeerSet {
    /// Build from parsed `id:host:port` entries
    pub fn new(addrs: &[crate::common::PeerAddr], timeout: Duration) -> Self {
        let peers = addrs
            .iter()
            .map(|addr| {
                (
                    addr.id.clone(),
                    PeerClient::new(addr.id.clone(), addr.endpoint(), timeout),
                )
            })
            .collect();
        Self { peers }
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerClient> {
        self.peers.get(peer_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerClient> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
