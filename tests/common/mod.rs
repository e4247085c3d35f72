//! Shared helpers for in-process cluster tests

#![allow(dead_code)]

use minicoord::common::{Error, Metrics, Result};
use minicoord::lock::LockServer;
use minicoord::raft::rpc::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use minicoord::raft::{RaftNode, RaftTimings, RaftTransport};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Message hub for an in-memory Raft cluster. Nodes register after
/// construction; marking a node down drops its inbound and outbound traffic.
#[derive(Default)]
pub struct MemHub {
    nodes: Mutex<HashMap<String, Arc<RaftNode>>>,
    down: Mutex<HashSet<String>>,
}

impl MemHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: Arc<RaftNode>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node.node_id().to_string(), node);
    }

    pub fn set_down(&self, node_id: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(node_id.to_string());
        } else {
            set.remove(node_id);
        }
    }

    fn is_down(&self, node_id: &str) -> bool {
        self.down.lock().unwrap().contains(node_id)
    }

    fn get(&self, node_id: &str) -> Option<Arc<RaftNode>> {
        self.nodes.lock().unwrap().get(node_id).cloned()
    }
}

/// Per-node transport view onto the hub
pub struct MemTransport {
    hub: Arc<MemHub>,
    from: String,
}

impl MemTransport {
    pub fn new(hub: Arc<MemHub>, from: &str) -> Arc<Self> {
        Arc::new(Self {
            hub,
            from: from.to_string(),
        })
    }
}

#[tonic::async_trait]
impl RaftTransport for MemTransport {
    async fn request_vote(&self, peer_id: &str, req: VoteRequest) -> Result<VoteResponse> {
        if self.hub.is_down(&self.from) || self.hub.is_down(peer_id) {
            return Err(Error::Timeout(format!("rpc to {}", peer_id)));
        }
        let node = self
            .hub
            .get(peer_id)
            .ok_or_else(|| Error::Unavailable(peer_id.to_string()))?;
        Ok(node.handle_request_vote(&req))
    }

    async fn append_entries(&self, peer_id: &str, req: AppendRequest) -> Result<AppendResponse> {
        if self.hub.is_down(&self.from) || self.hub.is_down(peer_id) {
            return Err(Error::Timeout(format!("rpc to {}", peer_id)));
        }
        let node = self
            .hub
            .get(peer_id)
            .ok_or_else(|| Error::Unavailable(peer_id.to_string()))?;
        Ok(node.handle_append_entries(&req))
    }
}

/// Fast timings for tests
pub fn test_timings() -> RaftTimings {
    RaftTimings {
        election_timeout_min: Duration::from_millis(100),
        election_timeout_max: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(30),
    }
}

/// Build and start an n-node Raft cluster over the hub
pub fn raft_cluster(
    hub: &Arc<MemHub>,
    n: usize,
    data_root: &std::path::Path,
) -> Vec<Arc<RaftNode>> {
    let ids: Vec<String> = (1..=n).map(|i| format!("node-{}", i)).collect();
    let mut nodes = Vec::with_capacity(n);

    for id in &ids {
        let peers: Vec<String> = ids.iter().filter(|p| *p != id).cloned().collect();
        let transport = MemTransport::new(hub.clone(), id);
        let (node, _rx) = RaftNode::new(
            id.clone(),
            peers,
            test_timings(),
            data_root.join(id),
            transport,
        )
        .unwrap();
        hub.register(node.clone());
        nodes.push(node);
    }
    for node in &nodes {
        node.start();
    }
    nodes
}

/// Build and start an n-node lock cluster over the hub
pub fn lock_cluster(
    hub: &Arc<MemHub>,
    n: usize,
    data_root: &std::path::Path,
) -> Vec<Arc<LockServer>> {
    let ids: Vec<String> = (1..=n).map(|i| format!("lock-{}", i)).collect();
    let mut servers = Vec::with_capacity(n);

    for id in &ids {
        let peers: Vec<String> = ids.iter().filter(|p| *p != id).cloned().collect();
        let transport = MemTransport::new(hub.clone(), id);
        let (node, commit_rx) = RaftNode::new(
            id.clone(),
            peers,
            test_timings(),
            data_root.join(id),
            transport,
        )
        .unwrap();
        hub.register(node.clone());
        node.start();

        servers.push(LockServer::start(
            id.clone(),
            node,
            commit_rx,
            Duration::from_secs(3),
            Arc::new(Metrics::new()),
        ));
    }
    servers
}

/// Poll until some node is leader, returning its index
pub async fn wait_for_leader(nodes: &[Arc<RaftNode>], timeout: Duration) -> Option<usize> {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        for (i, node) in nodes.iter().enumerate() {
            if node.is_leader() {
                return Some(i);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

/// Poll until some lock server's Raft node is leader, returning its index
pub async fn wait_for_lock_leader(
    servers: &[Arc<LockServer>],
    timeout: Duration,
) -> Option<usize> {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        for (i, server) in servers.iter().enumerate() {
            if server.raft().is_leader() {
                return Some(i);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}
