//! Queue service: consistent-hash routing over local WAL-backed engines
//!
//! Enqueues route to the queue's ring owner with a single hop; dequeues and
//! acks are owner-local. No consensus here: durability is the WAL, and
//! delivery is at-least-once.

use crate::common::{validate_key, ConsistentHashRing, Error, Metrics, PeerSet, Result};
use crate::proto::QueueForwardRequest;
use crate::queue::engine::{Delivered, QueueEngine, QueueStatusView};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const REDELIVERY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts per forward target before falling back to the next clockwise
/// owner (availability over strict hash locality)
const FORWARD_ATTEMPTS: usize = 3;

/// How many distinct ring owners to try for a forwarded enqueue
const FORWARD_TARGETS: usize = 2;

pub struct EnqueueResult {
    pub msg_id: String,
    pub owner: String,
}

/// Queue node: ring routing plus the local engine
pub struct QueueServer {
    node_id: String,
    ring: ConsistentHashRing,
    engine: Arc<Mutex<QueueEngine>>,
    peers: Arc<PeerSet>,
    metrics: Arc<Metrics>,
}

impl QueueServer {
    /// Build the server and spawn the redelivery sweeper
    pub fn start(
        node_id: String,
        ring: ConsistentHashRing,
        engine: QueueEngine,
        peers: Arc<PeerSet>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            node_id,
            ring,
            engine: Arc::new(Mutex::new(engine)),
            peers,
            metrics,
        });

        let sweeper = server.clone();
        tokio::spawn(async move { sweeper.run_redelivery_sweeper().await });

        server
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn ring(&self) -> &ConsistentHashRing {
        &self.ring
    }

    /// Enqueue, forwarding to the ring owner when that is another node.
    ///
    /// Forwards retry with backoff; after `FORWARD_ATTEMPTS` failures the
    /// next clockwise owner is tried instead.
    pub async fn enqueue(&self, queue_name: &str, payload: Vec<u8>) -> Result<EnqueueResult> {
        validate_key(queue_name)?;

        let owner = self
            .ring
            .owner(queue_name)
            .ok_or(Error::EmptyRing)?
            .to_string();

        if owner == self.node_id {
            return self.enqueue_local(queue_name, payload);
        }

        let mut last_err = Error::Unavailable(format!("owner {} unreachable", owner));
        for target in self.ring.successors(queue_name).into_iter().take(FORWARD_TARGETS) {
            if target == self.node_id {
                // Clockwise fallback landed on us
                return self.enqueue_local(queue_name, payload);
            }
            let Some(peer) = self.peers.get(&target) else {
                continue;
            };

            // Single-hop forward with a short doubling pause between
            // attempts; after FORWARD_ATTEMPTS the next clockwise owner
            // gets its turn
            let mut pause = Duration::from_millis(50);
            for attempt in 1..=FORWARD_ATTEMPTS {
                let req = QueueForwardRequest {
                    queue_name: queue_name.to_string(),
                    payload: payload.clone(),
                    sender: self.node_id.clone(),
                };
                match peer.queue_forward(req).await {
                    Ok(resp) if resp.ok => {
                        self.metrics.counter("minicoord_enqueue_forwards_total").inc();
                        return Ok(EnqueueResult {
                            msg_id: resp.msg_id,
                            owner: target,
                        });
                    }
                    Ok(resp) => {
                        // The owner answered and said no; retrying will not help
                        return Err(Error::Internal(format!(
                            "forwarded enqueue rejected by {}: {}",
                            target, resp.error
                        )));
                    }
                    Err(e) if e.is_retryable() && attempt < FORWARD_ATTEMPTS => {
                        tracing::warn!(
                            "enqueue forward to {} failed (attempt {}/{}): {}",
                            target,
                            attempt,
                            FORWARD_ATTEMPTS,
                            e
                        );
                        tokio::time::sleep(pause).await;
                        pause *= 2;
                    }
                    Err(e) => {
                        tracing::warn!("enqueue forward to {} gave up: {}", target, e);
                        last_err = e;
                        break;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Enqueue on this node, unconditionally (the forwarder decided)
    pub fn enqueue_local(&self, queue_name: &str, payload: Vec<u8>) -> Result<EnqueueResult> {
        let msg_id = self.engine.lock().unwrap().enqueue(queue_name, payload)?;
        self.metrics.counter("minicoord_enqueues_total").inc();
        tracing::info!("message {} enqueued to {}", msg_id, queue_name);
        Ok(EnqueueResult {
            msg_id,
            owner: self.node_id.clone(),
        })
    }

    /// Dequeue from a locally-owned queue. Non-owners answer `WrongNode`
    /// with the owner as a routing hint.
    pub fn dequeue(&self, queue_name: &str) -> Result<Option<Delivered>> {
        validate_key(queue_name)?;

        let owner = self
            .ring
            .owner(queue_name)
            .ok_or(Error::EmptyRing)?
            .to_string();
        if owner != self.node_id {
            return Err(Error::WrongNode(owner));
        }

        let delivered = self.engine.lock().unwrap().dequeue(queue_name)?;
        if let Some(d) = &delivered {
            self.metrics.counter("minicoord_dequeues_total").inc();
            tracing::info!("message {} dequeued from {}", d.message.msg_id, queue_name);
        }
        Ok(delivered)
    }

    /// Acknowledge an in-flight message delivered by this node
    pub fn ack(&self, msg_id: &str) -> Result<bool> {
        let found = self.engine.lock().unwrap().ack(msg_id)?;
        if found {
            self.metrics.counter("minicoord_acks_total").inc();
        }
        Ok(found)
    }

    /// Depth of one queue, answered by its owner
    pub fn status(&self, queue_name: &str) -> Result<QueueStatusView> {
        let owner = self
            .ring
            .owner(queue_name)
            .ok_or(Error::EmptyRing)?
            .to_string();
        if owner != self.node_id {
            return Err(Error::WrongNode(owner));
        }
        Ok(self.engine.lock().unwrap().status(queue_name))
    }

    /// Every queue hosted on this node
    pub fn all_queues(&self) -> Vec<QueueStatusView> {
        self.engine.lock().unwrap().all_queues()
    }

    pub fn is_poisoned(&self) -> bool {
        self.engine.lock().unwrap().is_poisoned()
    }

    async fn run_redelivery_sweeper(self: Arc<Self>) {
        loop {
            tokio::time::sleep(REDELIVERY_SWEEP_INTERVAL).await;
            let now_ms = crate::common::timestamp_now_millis();
            let swept = {
                let mut engine = self.engine.lock().unwrap();
                engine.sweep_redeliveries(now_ms)
            };
            match swept {
                Ok(redelivered) if !redelivered.is_empty() => {
                    self.metrics
                        .counter("minicoord_redeliveries_total")
                        .add(redelivered.len() as u64);
                    tracing::info!("redelivered {} expired messages", redelivered.len());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("redelivery sweep failed: {}", e);
                }
            }
        }
    }
}
