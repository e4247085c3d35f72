//! Lock service
//!
//! The leader accepts client writes, validates against the committed table
//! plus in-flight grants, proposes through Raft and answers once the entry
//! applies. Wait queues are leader-volatile: only grants mutate replicated
//! state, so a request that never commits anything cannot survive failover
//! as a ghost holder.

use crate::common::{validate_key, Error, Metrics, Result};
use crate::lock::deadlock::WaitForGraph;
use crate::lock::state::{ApplyEvent, LockCommand, LockMode, LockTable};
use crate::raft::{CommittedEntry, RaftNode};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Client-visible acquire outcome
#[derive(Debug)]
pub enum AcquireOutcome {
    Granted { lock_id: String },
    Waiting { position: usize },
    Denied { reason: String },
}

/// Snapshot of one resource for the status surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct LockStatusView {
    pub resource: String,
    pub mode: Option<String>,
    pub holders: Vec<String>,
    pub acquired_at_ms: Option<u64>,
    pub queue_len: usize,
}

enum WaitSignal {
    Granted,
    Aborted,
}

struct Waiter {
    client_id: String,
    mode: LockMode,
    enqueued_at_ms: u64,
    ttl_ms: Option<u64>,
    tx: Option<oneshot::Sender<WaitSignal>>,
}

struct PendingPropose {
    term: u64,
    tx: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct InflightGrant {
    mode: Option<LockMode>,
    clients: HashSet<String>,
}

/// Engine state behind one mutex; never held across a suspension point
#[derive(Default)]
struct LockState {
    table: LockTable,
    wait_queues: HashMap<String, VecDeque<Waiter>>,
    /// client -> resource it waits on (a client waits on at most one)
    waiting_client: HashMap<String, String>,
    /// Proposed-but-not-yet-applied grants, counted during validation
    inflight: HashMap<String, InflightGrant>,
    /// Raft log index -> caller waiting for that entry to apply
    pending: HashMap<u64, PendingPropose>,
    deadlocks_detected: u64,
}

impl LockState {
    fn record_inflight(&mut self, resource: &str, client_id: &str, mode: LockMode) {
        let slot = self.inflight.entry(resource.to_string()).or_default();
        slot.mode = Some(match (slot.mode, mode) {
            (Some(LockMode::Exclusive), _) | (_, LockMode::Exclusive) => LockMode::Exclusive,
            _ => LockMode::Shared,
        });
        slot.clients.insert(client_id.to_string());
    }

    fn clear_inflight(&mut self, resource: &str, client_id: &str) {
        if let Some(slot) = self.inflight.get_mut(resource) {
            slot.clients.remove(client_id);
            if slot.clients.is_empty() {
                self.inflight.remove(resource);
            }
        }
    }
}

/// Lock service built on a Raft node
pub struct LockServer {
    node_id: String,
    raft: Arc<RaftNode>,
    state: Arc<Mutex<LockState>>,
    propose_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl LockServer {
    /// Wire the server to a Raft commit stream and spawn its background
    /// tasks (applier and lock-expiry sweeper).
    pub fn start(
        node_id: String,
        raft: Arc<RaftNode>,
        commit_rx: mpsc::UnboundedReceiver<CommittedEntry>,
        propose_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            node_id,
            raft,
            state: Arc::new(Mutex::new(LockState::default())),
            propose_timeout,
            metrics,
        });

        let applier = server.clone();
        tokio::spawn(async move { applier.run_apply(commit_rx).await });

        let sweeper = server.clone();
        tokio::spawn(async move { sweeper.run_expiry_sweeper().await });

        server
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    fn leader_hint(&self) -> String {
        self.raft
            .leader_id()
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Acquire a shared or exclusive lock.
    ///
    /// Grants immediately when compatible; otherwise the request joins the
    /// FIFO wait queue. With a wait timeout the caller blocks until grant,
    /// abort or timeout; without one the request stays queued and `Waiting`
    /// is returned right away.
    pub async fn acquire(
        &self,
        resource: &str,
        client_id: &str,
        mode: LockMode,
        wait_timeout: Option<Duration>,
        ttl: Option<Duration>,
    ) -> Result<AcquireOutcome> {
        validate_key(resource)?;
        if client_id.is_empty() {
            return Err(Error::InvalidArgument("client_id cannot be empty".into()));
        }
        if !self.raft.is_leader() {
            return Err(Error::NotLeader(self.leader_hint()));
        }

        let now_ms = crate::common::timestamp_now_millis();
        let ttl_ms = ttl.map(|t| t.as_millis() as u64);

        enum Action {
            AlreadyHeld,
            Propose(LockCommand),
            Wait(oneshot::Receiver<WaitSignal>, usize),
            WaitDetached(usize),
        }

        let (action, victims) = {
            let mut st = self.state.lock().unwrap();

            if st.table.already_holds(resource, client_id, mode) {
                (Action::AlreadyHeld, Vec::new())
            } else if let Some(waiting_on) = st.waiting_client.get(client_id) {
                let waiting_on = waiting_on.clone();
                return Err(Error::AlreadyWaiting {
                    client_id: client_id.to_string(),
                    resource: waiting_on,
                });
            } else if self.can_grant_locked(&st, resource, client_id, mode) {
                st.record_inflight(resource, client_id, mode);
                let cmd = LockCommand::Acquire {
                    resource: resource.to_string(),
                    client_id: client_id.to_string(),
                    mode,
                    granted_at_ms: now_ms,
                    ttl_ms,
                };
                (Action::Propose(cmd), Vec::new())
            } else {
                let (tx, rx) = if wait_timeout.is_some() {
                    let (tx, rx) = oneshot::channel();
                    (Some(tx), Some(rx))
                } else {
                    (None, None)
                };
                let queue = st.wait_queues.entry(resource.to_string()).or_default();
                queue.push_back(Waiter {
                    client_id: client_id.to_string(),
                    mode,
                    enqueued_at_ms: now_ms,
                    ttl_ms,
                    tx,
                });
                let position = queue.len();
                st.waiting_client
                    .insert(client_id.to_string(), resource.to_string());

                // A new wait edge can close a cycle
                let victims = self.detect_deadlocks_locked(&mut st);
                let action = match rx {
                    Some(rx) => Action::Wait(rx, position),
                    None => Action::WaitDetached(position),
                };
                (action, victims)
            }
        };

        for victim in victims {
            self.spawn_abort(victim);
        }

        match action {
            Action::AlreadyHeld => Ok(AcquireOutcome::Granted {
                lock_id: lock_id(resource, client_id),
            }),
            Action::Propose(cmd) => match self.propose_and_wait(&cmd).await {
                Ok(()) => {
                    self.metrics.counter("minicoord_lock_grants_total").inc();
                    Ok(AcquireOutcome::Granted {
                        lock_id: lock_id(resource, client_id),
                    })
                }
                Err(e) => {
                    self.state
                        .lock()
                        .unwrap()
                        .clear_inflight(resource, client_id);
                    Err(e)
                }
            },
            Action::WaitDetached(position) => Ok(AcquireOutcome::Waiting { position }),
            Action::Wait(mut rx, _position) => {
                let timeout = wait_timeout.unwrap_or(self.propose_timeout);
                match tokio::time::timeout(timeout, &mut rx).await {
                    Ok(Ok(WaitSignal::Granted)) => Ok(AcquireOutcome::Granted {
                        lock_id: lock_id(resource, client_id),
                    }),
                    Ok(Ok(WaitSignal::Aborted)) => Ok(AcquireOutcome::Denied {
                        reason: "aborted as deadlock victim".to_string(),
                    }),
                    Ok(Err(_)) => Err(Error::Unavailable("lock grant failed".into())),
                    Err(_) => {
                        // Timed-out waiters leave the queue; a grant already
                        // in flight still completes, so wait for it briefly
                        let still_queued = {
                            let mut st = self.state.lock().unwrap();
                            self.remove_waiter_locked(&mut st, client_id).is_some()
                        };
                        if still_queued {
                            Ok(AcquireOutcome::Denied {
                                reason: "wait timeout".to_string(),
                            })
                        } else {
                            match tokio::time::timeout(self.propose_timeout, &mut rx).await {
                                Ok(Ok(WaitSignal::Granted)) => Ok(AcquireOutcome::Granted {
                                    lock_id: lock_id(resource, client_id),
                                }),
                                _ => Err(Error::Unavailable("lock grant failed".into())),
                            }
                        }
                    }
                }
            }
        }
    }

    /// Release a lock. Releasing a lock not held is a no-op success.
    pub async fn release(&self, resource: &str, client_id: &str) -> Result<()> {
        validate_key(resource)?;
        if !self.raft.is_leader() {
            return Err(Error::NotLeader(self.leader_hint()));
        }

        let held = {
            let st = self.state.lock().unwrap();
            st.table.is_holder(resource, client_id)
        };
        if !held {
            return Ok(());
        }

        let cmd = LockCommand::Release {
            resource: resource.to_string(),
            client_id: client_id.to_string(),
        };
        self.propose_and_wait(&cmd).await?;
        self.metrics.counter("minicoord_lock_releases_total").inc();
        Ok(())
    }

    /// Status of one resource
    pub fn status(&self, resource: &str) -> LockStatusView {
        let st = self.state.lock().unwrap();
        let queue_len = st
            .wait_queues
            .get(resource)
            .map(|q| q.len())
            .unwrap_or(0);
        match st.table.get(resource) {
            Some(entry) => LockStatusView {
                resource: resource.to_string(),
                mode: Some(entry.mode.to_string()),
                holders: entry.holders.iter().cloned().collect(),
                acquired_at_ms: Some(entry.acquired_at_ms),
                queue_len,
            },
            None => LockStatusView {
                resource: resource.to_string(),
                mode: None,
                holders: Vec::new(),
                acquired_at_ms: None,
                queue_len,
            },
        }
    }

    /// Status of every held lock
    pub fn all_locks(&self) -> Vec<LockStatusView> {
        let st = self.state.lock().unwrap();
        let mut views: Vec<LockStatusView> = st
            .table
            .iter()
            .map(|(resource, entry)| LockStatusView {
                resource: resource.clone(),
                mode: Some(entry.mode.to_string()),
                holders: entry.holders.iter().cloned().collect(),
                acquired_at_ms: Some(entry.acquired_at_ms),
                queue_len: st.wait_queues.get(resource).map(|q| q.len()).unwrap_or(0),
            })
            .collect();
        views.sort_by(|a, b| a.resource.cmp(&b.resource));
        views
    }

    pub fn deadlocks_detected(&self) -> u64 {
        self.state.lock().unwrap().deadlocks_detected
    }

    // === Internals ===

    fn can_grant_locked(
        &self,
        st: &LockState,
        resource: &str,
        client_id: &str,
        mode: LockMode,
    ) -> bool {
        if let Some(slot) = st.inflight.get(resource) {
            let both_shared = mode == LockMode::Shared && slot.mode == Some(LockMode::Shared);
            if !both_shared {
                return false;
            }
        }
        if !st.table.grantable(resource, client_id, mode) {
            return false;
        }
        true
    }

    /// Propose a command and wait until the resulting entry applies
    async fn propose_and_wait(&self, cmd: &LockCommand) -> Result<()> {
        Self::propose_on(&self.raft, &self.state, self.propose_timeout, cmd).await
    }

    async fn propose_on(
        raft: &Arc<RaftNode>,
        state: &Arc<Mutex<LockState>>,
        propose_timeout: Duration,
        cmd: &LockCommand,
    ) -> Result<()> {
        let data = cmd.encode()?;
        let (tx, rx) = oneshot::channel();

        // Register under the state lock so the applier cannot race past the
        // index before the pending entry exists
        let index = {
            let mut st = state.lock().unwrap();
            let (term, index) = raft.propose(data)?;
            st.pending.insert(index, PendingPropose { term, tx });
            index
        };

        match tokio::time::timeout(propose_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Unavailable("proposal abandoned".into())),
            Err(_) => {
                state.lock().unwrap().pending.remove(&index);
                Err(Error::ConsensusTimeout)
            }
        }
    }

    async fn run_apply(self: Arc<Self>, mut commit_rx: mpsc::UnboundedReceiver<CommittedEntry>) {
        while let Some(entry) = commit_rx.recv().await {
            let cmd = match LockCommand::decode(&entry.command) {
                Ok(cmd) => cmd,
                Err(e) => {
                    tracing::error!("skipping undecodable log entry {}: {}", entry.index, e);
                    continue;
                }
            };

            let (grants, victims) = {
                let mut st = self.state.lock().unwrap();

                if let Some(pending) = st.pending.remove(&entry.index) {
                    let result = if pending.term == entry.term {
                        Ok(())
                    } else {
                        Err(Error::Unavailable("entry superseded by new leader".into()))
                    };
                    let _ = pending.tx.send(result);
                }

                let events = st.table.apply(&cmd);
                let mut grants = Vec::new();
                for event in events {
                    match event {
                        ApplyEvent::Granted {
                            resource,
                            client_id,
                        } => {
                            st.clear_inflight(&resource, &client_id);
                            tracing::info!(
                                "lock granted: {} to {} (index {})",
                                resource,
                                client_id,
                                entry.index
                            );
                        }
                        ApplyEvent::Freed { resource } => {
                            if self.raft.is_leader() {
                                grants.extend(self.drain_waiters_locked(&mut st, &resource));
                            }
                        }
                        ApplyEvent::ClientAborted { client_id, freed } => {
                            tracing::warn!(
                                "client {} aborted, released {:?}",
                                client_id,
                                freed
                            );
                            if let Some(waiter) = self.remove_waiter_locked(&mut st, &client_id) {
                                if let Some(tx) = waiter.tx {
                                    let _ = tx.send(WaitSignal::Aborted);
                                }
                            }
                        }
                    }
                }

                let victims = if self.raft.is_leader() {
                    self.detect_deadlocks_locked(&mut st)
                } else {
                    Vec::new()
                };
                (grants, victims)
            };

            for (cmd, tx) in grants {
                self.spawn_grant(cmd, tx);
            }
            for victim in victims {
                self.spawn_abort(victim);
            }
        }
    }

    /// Greedy FIFO drain of a freed resource's wait queue.
    ///
    /// Grants the front waiter and, while the grants stay mutually
    /// compatible, keeps going (a run of shared readers drains together).
    fn drain_waiters_locked(
        &self,
        st: &mut MutexGuard<'_, LockState>,
        resource: &str,
    ) -> Vec<(LockCommand, Option<oneshot::Sender<WaitSignal>>)> {
        let mut grants = Vec::new();
        loop {
            let front = match st.wait_queues.get(resource).and_then(|q| q.front()) {
                Some(waiter) => (waiter.client_id.clone(), waiter.mode),
                None => break,
            };
            if !self.can_grant_locked(st, resource, &front.0, front.1) {
                break;
            }

            let waiter = st
                .wait_queues
                .get_mut(resource)
                .and_then(|q| q.pop_front())
                .expect("front waiter vanished under the state lock");
            st.waiting_client.remove(&waiter.client_id);
            st.record_inflight(resource, &waiter.client_id, waiter.mode);

            let cmd = LockCommand::Acquire {
                resource: resource.to_string(),
                client_id: waiter.client_id,
                mode: waiter.mode,
                granted_at_ms: crate::common::timestamp_now_millis(),
                ttl_ms: waiter.ttl_ms,
            };
            grants.push((cmd, waiter.tx));
        }

        if st
            .wait_queues
            .get(resource)
            .map(|q| q.is_empty())
            .unwrap_or(false)
        {
            st.wait_queues.remove(resource);
        }
        grants
    }

    fn spawn_grant(&self, cmd: LockCommand, tx: Option<oneshot::Sender<WaitSignal>>) {
        let raft = self.raft.clone();
        let state = self.state.clone();
        let metrics = self.metrics.clone();
        let propose_timeout = self.propose_timeout;
        tokio::spawn(async move {
            match Self::propose_on(&raft, &state, propose_timeout, &cmd).await {
                Ok(()) => {
                    metrics.counter("minicoord_lock_grants_total").inc();
                    if let Some(tx) = tx {
                        let _ = tx.send(WaitSignal::Granted);
                    }
                }
                Err(e) => {
                    tracing::warn!("waiter grant failed: {}", e);
                    if let LockCommand::Acquire {
                        resource,
                        client_id,
                        ..
                    } = &cmd
                    {
                        state.lock().unwrap().clear_inflight(resource, client_id);
                    }
                }
            }
        });
    }

    fn spawn_abort(&self, victim: String) {
        let raft = self.raft.clone();
        let state = self.state.clone();
        let propose_timeout = self.propose_timeout;
        tokio::spawn(async move {
            let cmd = LockCommand::AbortClient {
                client_id: victim.clone(),
            };
            if let Err(e) = Self::propose_on(&raft, &state, propose_timeout, &cmd).await {
                tracing::warn!("abort of deadlock victim {} failed: {}", victim, e);
            }
        });
    }

    /// Build the wait-for graph and abort victims until it is acyclic.
    /// Runs on the leader only; resolution flows through Raft.
    fn detect_deadlocks_locked(&self, st: &mut MutexGuard<'_, LockState>) -> Vec<String> {
        if st.wait_queues.is_empty() {
            return Vec::new();
        }

        let mut graph = WaitForGraph::new();
        for (resource, queue) in st.wait_queues.iter() {
            let Some(entry) = st.table.get(resource) else {
                continue;
            };
            for waiter in queue {
                for holder in &entry.holders {
                    graph.add_edge(&waiter.client_id, holder, waiter.enqueued_at_ms);
                }
            }
        }

        let victims = graph.select_victims();
        for victim in &victims {
            st.deadlocks_detected += 1;
            self.metrics.counter("minicoord_deadlocks_total").inc();
            if let Some(waiter) = self.remove_waiter_locked(st, victim) {
                if let Some(tx) = waiter.tx {
                    let _ = tx.send(WaitSignal::Aborted);
                }
            }
        }
        victims
    }

    /// Remove a client's queued request, returning it if it was queued
    fn remove_waiter_locked(
        &self,
        st: &mut MutexGuard<'_, LockState>,
        client_id: &str,
    ) -> Option<Waiter> {
        let resource = st.waiting_client.remove(client_id)?;
        let queue = st.wait_queues.get_mut(&resource)?;
        let pos = queue.iter().position(|w| w.client_id == client_id)?;
        let waiter = queue.remove(pos);
        if queue.is_empty() {
            st.wait_queues.remove(&resource);
        }
        waiter
    }

    async fn run_expiry_sweeper(self: Arc<Self>) {
        loop {
            tokio::time::sleep(EXPIRY_SWEEP_INTERVAL).await;
            if !self.raft.is_leader() {
                continue;
            }

            let now_ms = crate::common::timestamp_now_millis();
            let expired = {
                let st = self.state.lock().unwrap();
                st.table.expired_resources(now_ms)
            };
            for resource in expired {
                tracing::info!("lock ttl expired: {}", resource);
                let cmd = LockCommand::Expire {
                    resource: resource.clone(),
                };
                if let Err(e) = self.propose_and_wait(&cmd).await {
                    tracing::warn!("expire of {} failed: {}", resource, e);
                }
            }
        }
    }
}

fn lock_id(resource: &str, client_id: &str) -> String {
    format!("{}:{}", resource, client_id)
}
