//! Raft consensus node
//!
//! Single-leader replicated log driving a pluggable state machine. The node
//! owns three concerns:
//! - leader election with randomized timeouts
//! - log replication with per-follower next/match tracking
//! - a commit stream: committed entries are handed to the state machine in
//!   log order, exactly once per index
//!
//! The node is transport-agnostic: peer calls go through [`RaftTransport`],
//! implemented over gRPC in production and in-memory in tests.

use crate::common::{Error, Result};
use crate::raft::rpc::{AppendRequest, AppendResponse, LogEntry, VoteRequest, VoteResponse};
use crate::raft::storage::{RaftMeta, RaftStorage};
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

/// Raft role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Election and heartbeat timings
#[derive(Debug, Clone)]
pub struct RaftTimings {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
}

impl RaftTimings {
    pub fn from_config(config: &crate::common::Config) -> Self {
        Self {
            election_timeout_min: config.election_timeout_min(),
            election_timeout_max: config.election_timeout_max(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

impl Default for RaftTimings {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

/// A committed log entry handed to the state machine
#[derive(Debug, Clone)]
pub struct CommittedEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

/// Peer transport used for RequestVote / AppendEntries
///
/// Implementations enforce the per-call deadline; a call that cannot be
/// delivered resolves to an error, never hangs.
#[tonic::async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(&self, peer_id: &str, req: VoteRequest) -> Result<VoteResponse>;
    async fn append_entries(&self, peer_id: &str, req: AppendRequest) -> Result<AppendResponse>;
}

/// Point-in-time view for health/status endpoints
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub role: RaftRole,
    pub term: u64,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub partition_detected: bool,
}

struct RaftInner {
    role: RaftRole,
    current_term: u64,
    voted_for: Option<String>,
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<String>,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    last_leader_contact: Instant,
    election_timeout: Duration,
    last_quorum_contact: Instant,
}

impl RaftInner {
    fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }
}

/// Raft consensus node
pub struct RaftNode {
    node_id: String,
    peers: Vec<String>,
    timings: RaftTimings,
    inner: Mutex<RaftInner>,
    storage: Mutex<RaftStorage>,
    transport: Arc<dyn RaftTransport>,
    commit_tx: mpsc::UnboundedSender<CommittedEntry>,
    replicate_notify: Notify,
    running: AtomicBool,
}

impl RaftNode {
    /// Create a node, recovering term/vote/log from `data_dir`.
    ///
    /// Returns the node and the commit stream the state machine consumes.
    pub fn new(
        node_id: String,
        peers: Vec<String>,
        timings: RaftTimings,
        data_dir: impl AsRef<Path>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CommittedEntry>)> {
        let (storage, meta, log) = RaftStorage::open(data_dir)?;
        let (commit_tx, commit_rx) = mpsc::unbounded_channel();

        let timeout = Self::draw_timeout(&timings);
        let inner = RaftInner {
            role: RaftRole::Follower,
            current_term: meta.current_term,
            voted_for: meta.voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_leader_contact: Instant::now(),
            election_timeout: timeout,
            last_quorum_contact: Instant::now(),
        };

        let node = Arc::new(Self {
            node_id,
            peers,
            timings,
            inner: Mutex::new(inner),
            storage: Mutex::new(storage),
            transport,
            commit_tx,
            replicate_notify: Notify::new(),
            running: AtomicBool::new(false),
        });
        Ok((node, commit_rx))
    }

    /// Spawn the election timer and replication tasks
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);

        let node = self.clone();
        tokio::spawn(async move { node.run_election_timer().await });

        let node = self.clone();
        tokio::spawn(async move { node.run_replication().await });
    }

    /// Stop background tasks (the node still answers incoming RPCs)
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.replicate_notify.notify_one();
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.lock().unwrap().role == RaftRole::Leader
    }

    pub fn role(&self) -> RaftRole {
        self.inner.lock().unwrap().role
    }

    pub fn term(&self) -> u64 {
        self.inner.lock().unwrap().current_term
    }

    pub fn leader_id(&self) -> Option<String> {
        self.inner.lock().unwrap().leader_id.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.lock().unwrap().commit_index
    }

    pub fn status(&self) -> RaftStatus {
        let inner = self.inner.lock().unwrap();
        RaftStatus {
            role: inner.role,
            term: inner.current_term,
            leader_id: inner.leader_id.clone(),
            commit_index: inner.commit_index,
            last_applied: inner.last_applied,
            last_log_index: inner.last_log_index(),
            partition_detected: self.partition_detected_locked(&inner),
        }
    }

    /// A leader that lost its majority, or a follower that lost its leader
    pub fn partition_detected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        self.partition_detected_locked(&inner)
    }

    fn partition_detected_locked(&self, inner: &RaftInner) -> bool {
        match inner.role {
            RaftRole::Leader => {
                inner.last_quorum_contact.elapsed() > self.timings.election_timeout_max
            }
            _ => {
                inner.leader_id.is_none()
                    && inner.last_leader_contact.elapsed() > self.timings.election_timeout_max * 2
            }
        }
    }

    /// Propose a command for replication.
    ///
    /// Appends to the local log and returns `(term, index)`; the entry is
    /// committed only once a majority has replicated it, observed through
    /// the commit stream. Non-leaders fail with `NotLeader` and a hint.
    pub fn propose(&self, command: Vec<u8>) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.role != RaftRole::Leader {
            let hint = inner
                .leader_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::NotLeader(hint));
        }

        let term = inner.current_term;
        let index = inner.last_log_index() + 1;
        let entry = LogEntry {
            term,
            index,
            data: command,
        };

        self.storage.lock().unwrap().append(&entry)?;
        inner.log.push(entry);

        // A single-node cluster has its majority immediately
        self.advance_commit_locked(&mut inner);
        drop(inner);

        self.replicate_notify.notify_one();
        Ok((term, index))
    }

    // === Incoming RPC handlers (called by the gRPC service and tests) ===

    /// Handle a RequestVote RPC
    pub fn handle_request_vote(&self, req: &VoteRequest) -> VoteResponse {
        let mut inner = self.inner.lock().unwrap();

        if req.term > inner.current_term {
            self.step_down_locked(&mut inner, req.term);
        }

        let up_to_date = req.last_log_term > inner.last_log_term()
            || (req.last_log_term == inner.last_log_term()
                && req.last_log_index >= inner.last_log_index());

        let grant = req.term == inner.current_term
            && (inner.voted_for.is_none()
                || inner.voted_for.as_deref() == Some(req.candidate_id.as_str()))
            && up_to_date;

        if grant {
            inner.voted_for = Some(req.candidate_id.clone());
            inner.last_leader_contact = Instant::now();
            self.persist_meta_locked(&inner);
            tracing::debug!(
                "granted vote to {} for term {}",
                req.candidate_id,
                req.term
            );
        }

        VoteResponse {
            term: inner.current_term,
            vote_granted: grant,
        }
    }

    /// Handle an AppendEntries RPC (replication or heartbeat)
    pub fn handle_append_entries(&self, req: &AppendRequest) -> AppendResponse {
        let mut inner = self.inner.lock().unwrap();

        if req.term < inner.current_term {
            return AppendResponse {
                term: inner.current_term,
                success: false,
                conflict_index: 0,
            };
        }

        if req.term > inner.current_term || inner.role != RaftRole::Follower {
            self.step_down_locked(&mut inner, req.term);
        }
        inner.leader_id = Some(req.leader_id.clone());
        inner.last_leader_contact = Instant::now();

        // Consistency check on the entry preceding the slice
        if req.prev_log_index > 0 {
            if req.prev_log_index > inner.last_log_index() {
                return AppendResponse {
                    term: inner.current_term,
                    success: false,
                    conflict_index: inner.last_log_index() + 1,
                };
            }
            let local_term = inner.log[(req.prev_log_index - 1) as usize].term;
            if local_term != req.prev_log_term {
                // Back off to the first entry of the conflicting term
                let mut conflict = req.prev_log_index;
                while conflict > 1 && inner.log[(conflict - 2) as usize].term == local_term {
                    conflict -= 1;
                }
                return AppendResponse {
                    term: inner.current_term,
                    success: false,
                    conflict_index: conflict,
                };
            }
        }

        // Append the slice, truncating a conflicting tail first
        for entry in &req.entries {
            if entry.index <= inner.last_log_index() {
                if inner.log[(entry.index - 1) as usize].term == entry.term {
                    continue;
                }
                if let Err(e) = self.storage.lock().unwrap().truncate_from(entry.index) {
                    tracing::error!("failed to truncate raft.log at {}: {}", entry.index, e);
                    return AppendResponse {
                        term: inner.current_term,
                        success: false,
                        conflict_index: entry.index,
                    };
                }
                inner.log.truncate((entry.index - 1) as usize);
            }
            if let Err(e) = self.storage.lock().unwrap().append(entry) {
                tracing::error!("failed to append raft.log entry {}: {}", entry.index, e);
                return AppendResponse {
                    term: inner.current_term,
                    success: false,
                    conflict_index: entry.index,
                };
            }
            inner.log.push(entry.clone());
        }

        // Follower commit: min(leaderCommit, index of last new entry)
        let last_new = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > inner.commit_index {
            inner.commit_index = req.leader_commit.min(last_new.max(inner.commit_index));
            self.emit_committed_locked(&mut inner);
        }

        AppendResponse {
            term: inner.current_term,
            success: true,
            conflict_index: 0,
        }
    }

    // === Background tasks ===

    async fn run_election_timer(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;

            let timed_out = {
                let inner = self.inner.lock().unwrap();
                inner.role != RaftRole::Leader
                    && inner.last_leader_contact.elapsed() >= inner.election_timeout
            };
            if timed_out {
                self.campaign().await;
            }
        }
    }

    async fn run_replication(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.replicate_notify.notified() => {}
                _ = tokio::time::sleep(self.timings.heartbeat_interval) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if self.is_leader() {
                self.broadcast_append().await;
            }
        }
    }

    /// Start an election for the next term
    pub async fn campaign(&self) {
        let (term, last_log_index, last_log_term) = {
            let mut inner = self.inner.lock().unwrap();
            inner.role = RaftRole::Candidate;
            inner.current_term += 1;
            inner.voted_for = Some(self.node_id.clone());
            inner.leader_id = None;
            inner.last_leader_contact = Instant::now();
            inner.election_timeout = Self::draw_timeout(&self.timings);
            self.persist_meta_locked(&inner);
            (
                inner.current_term,
                inner.last_log_index(),
                inner.last_log_term(),
            )
        };
        tracing::info!("starting election for term {}", term);

        let req = VoteRequest {
            term,
            candidate_id: self.node_id.clone(),
            last_log_index,
            last_log_term,
        };

        let calls = self.peers.iter().map(|peer| {
            let transport = self.transport.clone();
            let peer = peer.clone();
            let req = req.clone();
            async move { transport.request_vote(&peer, req).await }
        });
        let results = futures::future::join_all(calls).await;

        let mut votes = 1usize;
        let mut max_term = term;
        for result in results.into_iter().flatten() {
            if result.vote_granted {
                votes += 1;
            }
            max_term = max_term.max(result.term);
        }

        let mut inner = self.inner.lock().unwrap();
        if max_term > inner.current_term {
            self.step_down_locked(&mut inner, max_term);
            return;
        }
        if inner.role != RaftRole::Candidate || inner.current_term != term {
            // A valid leader appeared while we were collecting votes
            return;
        }

        if votes >= self.majority() {
            tracing::info!("won election for term {} with {} votes", term, votes);
            inner.role = RaftRole::Leader;
            inner.leader_id = Some(self.node_id.clone());
            let next = inner.last_log_index() + 1;
            for peer in &self.peers {
                inner.next_index.insert(peer.clone(), next);
                inner.match_index.insert(peer.clone(), 0);
            }
            inner.last_quorum_contact = Instant::now();
            self.advance_commit_locked(&mut inner);
            drop(inner);
            self.replicate_notify.notify_one();
        } else {
            inner.role = RaftRole::Follower;
            inner.election_timeout = Self::draw_timeout(&self.timings);
            inner.last_leader_contact = Instant::now();
        }
    }

    async fn broadcast_append(&self) {
        struct Outgoing {
            peer: String,
            prev: u64,
            sent: u64,
            req: AppendRequest,
        }

        let batch: Vec<Outgoing> = {
            let inner = self.inner.lock().unwrap();
            if inner.role != RaftRole::Leader {
                return;
            }
            self.peers
                .iter()
                .map(|peer| {
                    let next = inner.next_index.get(peer).copied().unwrap_or(1).max(1);
                    let prev = next - 1;
                    let prev_term = if prev == 0 {
                        0
                    } else {
                        inner.log[(prev - 1) as usize].term
                    };
                    let entries: Vec<LogEntry> = inner.log[(next - 1) as usize..].to_vec();
                    Outgoing {
                        peer: peer.clone(),
                        prev,
                        sent: entries.len() as u64,
                        req: AppendRequest {
                            term: inner.current_term,
                            leader_id: self.node_id.clone(),
                            prev_log_index: prev,
                            prev_log_term: prev_term,
                            entries,
                            leader_commit: inner.commit_index,
                        },
                    }
                })
                .collect()
        };

        let calls = batch.into_iter().map(|out| {
            let transport = self.transport.clone();
            async move {
                let result = transport.append_entries(&out.peer, out.req).await;
                (out.peer, out.prev, out.sent, result)
            }
        });
        let results = futures::future::join_all(calls).await;

        let mut inner = self.inner.lock().unwrap();
        if inner.role != RaftRole::Leader {
            return;
        }

        let mut reachable = 1usize;
        for (peer, prev, sent, result) in results {
            match result {
                Ok(resp) => {
                    reachable += 1;
                    if resp.term > inner.current_term {
                        self.step_down_locked(&mut inner, resp.term);
                        return;
                    }
                    if resp.success {
                        let matched = prev + sent;
                        inner.match_index.insert(peer.clone(), matched);
                        inner.next_index.insert(peer, matched + 1);
                    } else {
                        let next = inner.next_index.get(&peer).copied().unwrap_or(1);
                        let backed = next.saturating_sub(1).max(1);
                        let target = if resp.conflict_index > 0 {
                            resp.conflict_index.min(backed)
                        } else {
                            backed
                        };
                        inner.next_index.insert(peer, target.max(1));
                    }
                }
                Err(e) => {
                    tracing::debug!("append_entries to {} failed: {}", peer, e);
                }
            }
        }

        if reachable >= self.majority() {
            inner.last_quorum_contact = Instant::now();
        } else if inner.last_quorum_contact.elapsed() > self.timings.election_timeout_max {
            // Can't reach a majority: step down so the minority side stops
            // accepting writes
            tracing::warn!(
                "leader {} lost contact with majority, stepping down",
                self.node_id
            );
            let term = inner.current_term;
            self.step_down_locked(&mut inner, term);
            inner.leader_id = None;
            return;
        }

        self.advance_commit_locked(&mut inner);
    }

    // === Internals ===

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn draw_timeout(timings: &RaftTimings) -> Duration {
        let min = timings.election_timeout_min.as_millis() as u64;
        let max = timings.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    fn step_down_locked(&self, inner: &mut MutexGuard<'_, RaftInner>, term: u64) {
        let term_changed = term > inner.current_term;
        inner.role = RaftRole::Follower;
        if term_changed {
            inner.current_term = term;
            inner.voted_for = None;
            inner.leader_id = None;
            self.persist_meta_locked(inner);
        }
        inner.last_leader_contact = Instant::now();
        inner.election_timeout = Self::draw_timeout(&self.timings);
    }

    fn persist_meta_locked(&self, inner: &RaftInner) {
        let meta = RaftMeta {
            current_term: inner.current_term,
            voted_for: inner.voted_for.clone(),
        };
        if let Err(e) = self.storage.lock().unwrap().save_meta(&meta) {
            tracing::error!("failed to persist raft.meta: {}", e);
        }
    }

    /// Leader commit rule: largest N replicated on a majority with
    /// `log[N].term == current_term`
    fn advance_commit_locked(&self, inner: &mut MutexGuard<'_, RaftInner>) {
        if inner.role != RaftRole::Leader {
            return;
        }
        let mut new_commit = inner.commit_index;
        let mut n = inner.commit_index + 1;
        while n <= inner.last_log_index() {
            if inner.log[(n - 1) as usize].term == inner.current_term {
                let replicas = 1 + self
                    .peers
                    .iter()
                    .filter(|p| inner.match_index.get(*p).copied().unwrap_or(0) >= n)
                    .count();
                if replicas >= self.majority() {
                    new_commit = n;
                }
            }
            n += 1;
        }
        if new_commit > inner.commit_index {
            inner.commit_index = new_commit;
            self.emit_committed_locked(inner);
        }
    }

    /// Hand (last_applied, commit_index] to the commit stream in order
    fn emit_committed_locked(&self, inner: &mut MutexGuard<'_, RaftInner>) {
        while inner.last_applied < inner.commit_index {
            let index = inner.last_applied + 1;
            let entry = &inner.log[(index - 1) as usize];
            let committed = CommittedEntry {
                term: entry.term,
                index,
                command: entry.data.clone(),
            };
            if self.commit_tx.send(committed).is_err() {
                tracing::warn!("commit stream receiver dropped");
            }
            inner.last_applied = index;
        }
    }
}
