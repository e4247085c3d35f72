//! Queue engine: ready queues, in-flight tracking, WAL-backed recovery
//!
//! Every state change is logged before it becomes visible. Delivery is
//! at-least-once: a dequeued message hides until its visibility deadline,
//! then the sweeper puts it back at the head of its queue.

use crate::common::{Error, Result};
use crate::queue::wal::{QueueMessage, Wal, WalRecord};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

/// A dequeued-but-unacked message
#[derive(Debug, Clone)]
pub struct InFlight {
    pub message: QueueMessage,
    pub delivered_at_ms: u64,
    pub visibility_deadline_ms: u64,
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivered {
    pub message: QueueMessage,
    pub delivered_at_ms: u64,
}

/// Per-queue depth for the status surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatusView {
    pub queue_name: String,
    pub ready: usize,
    pub in_flight: usize,
}

/// Single-node queue state behind the WAL
pub struct QueueEngine {
    node_id: String,
    wal: Wal,
    queues: HashMap<String, VecDeque<QueueMessage>>,
    in_flight: HashMap<String, InFlight>,
    next_seq: u64,
    visibility_timeout_ms: u64,
    /// Set on a WAL write failure; enqueues refuse until recovery
    poisoned: bool,
}

impl QueueEngine {
    /// Open the engine, replaying the WAL to rebuild queue state.
    ///
    /// Replay is idempotent; records referencing unknown msg_ids (a torn
    /// trailing write, an ack for a long-gone message) are skipped.
    pub fn open(
        wal_path: impl AsRef<Path>,
        node_id: String,
        visibility_timeout_ms: u64,
    ) -> Result<Self> {
        let mut queues: HashMap<String, VecDeque<QueueMessage>> = HashMap::new();
        let mut in_flight: HashMap<String, InFlight> = HashMap::new();
        // msg_id -> queue_name, for dequeue/redeliver records
        let mut locations: HashMap<String, String> = HashMap::new();
        let mut next_seq = 0u64;
        let now_ms = crate::common::timestamp_now_millis();

        let prefix = format!("{}-", node_id);
        Wal::replay(wal_path.as_ref(), |record| {
            match record {
                WalRecord::Enqueue(msg) => {
                    if let Some(seq) = msg.msg_id.strip_prefix(&prefix) {
                        if let Ok(seq) = seq.parse::<u64>() {
                            next_seq = next_seq.max(seq + 1);
                        }
                    }
                    locations.insert(msg.msg_id.clone(), msg.queue_name.clone());
                    queues.entry(msg.queue_name.clone()).or_default().push_back(msg);
                }
                WalRecord::Dequeue { msg_id } => {
                    let Some(queue_name) = locations.get(&msg_id) else {
                        return Ok(());
                    };
                    let Some(queue) = queues.get_mut(queue_name) else {
                        return Ok(());
                    };
                    if let Some(pos) = queue.iter().position(|m| m.msg_id == msg_id) {
                        let mut msg = queue.remove(pos).unwrap();
                        msg.attempt_count += 1;
                        in_flight.insert(
                            msg_id,
                            InFlight {
                                message: msg,
                                delivered_at_ms: now_ms,
                                visibility_deadline_ms: now_ms + visibility_timeout_ms,
                            },
                        );
                    }
                }
                WalRecord::Ack { msg_id } => {
                    in_flight.remove(&msg_id);
                }
                WalRecord::Redeliver { msg_id } => {
                    if let Some(entry) = in_flight.remove(&msg_id) {
                        queues
                            .entry(entry.message.queue_name.clone())
                            .or_default()
                            .push_front(entry.message);
                    }
                }
            }
            Ok(())
        })?;

        let recovered: usize = queues.values().map(|q| q.len()).sum();
        if recovered > 0 || !in_flight.is_empty() {
            tracing::info!(
                "WAL recovery: {} ready messages, {} in flight",
                recovered,
                in_flight.len()
            );
        }

        let wal = Wal::open(wal_path)?;
        Ok(Self {
            node_id,
            wal,
            queues,
            in_flight,
            next_seq,
            visibility_timeout_ms,
            poisoned: false,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Append a fresh message to a queue, durably, returning its msg_id
    pub fn enqueue(&mut self, queue_name: &str, payload: Vec<u8>) -> Result<String> {
        if self.poisoned {
            return Err(Error::Wal(
                "WAL write previously failed; enqueues refused until recovery".into(),
            ));
        }

        let msg_id = format!("{}-{}", self.node_id, self.next_seq);
        let msg = QueueMessage {
            msg_id: msg_id.clone(),
            queue_name: queue_name.to_string(),
            payload,
            enqueued_at_ms: crate::common::timestamp_now_millis(),
            attempt_count: 0,
        };

        if let Err(e) = self.wal.append(&WalRecord::Enqueue(msg.clone())) {
            self.poisoned = true;
            return Err(e);
        }

        self.next_seq += 1;
        self.queues
            .entry(queue_name.to_string())
            .or_default()
            .push_back(msg);
        Ok(msg_id)
    }

    /// Pop the head of a queue into the in-flight table
    pub fn dequeue(&mut self, queue_name: &str) -> Result<Option<Delivered>> {
        let head_id = match self.queues.get(queue_name).and_then(|q| q.front()) {
            Some(msg) => msg.msg_id.clone(),
            None => return Ok(None),
        };

        if let Err(e) = self.wal.append(&WalRecord::Dequeue {
            msg_id: head_id.clone(),
        }) {
            self.poisoned = true;
            return Err(e);
        }

        let mut msg = self
            .queues
            .get_mut(queue_name)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| Error::Internal("queue head vanished".into()))?;
        msg.attempt_count += 1;

        let now_ms = crate::common::timestamp_now_millis();
        let delivered = Delivered {
            message: msg.clone(),
            delivered_at_ms: now_ms,
        };
        self.in_flight.insert(
            head_id,
            InFlight {
                message: msg,
                delivered_at_ms: now_ms,
                visibility_deadline_ms: now_ms + self.visibility_timeout_ms,
            },
        );
        Ok(Some(delivered))
    }

    /// Acknowledge an in-flight message. Unknown ids report `false`; the
    /// caller cannot distinguish a double-ack from an unknown id, so it is
    /// not an error.
    pub fn ack(&mut self, msg_id: &str) -> Result<bool> {
        if !self.in_flight.contains_key(msg_id) {
            return Ok(false);
        }

        if let Err(e) = self.wal.append(&WalRecord::Ack {
            msg_id: msg_id.to_string(),
        }) {
            self.poisoned = true;
            return Err(e);
        }

        self.in_flight.remove(msg_id);
        Ok(true)
    }

    /// Move messages past their visibility deadline back to the head of
    /// their queue. Returns the redelivered ids.
    pub fn sweep_redeliveries(&mut self, now_ms: u64) -> Result<Vec<String>> {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visibility_deadline_ms <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();

        let mut redelivered = Vec::new();
        for msg_id in expired {
            if let Err(e) = self.wal.append(&WalRecord::Redeliver {
                msg_id: msg_id.clone(),
            }) {
                self.poisoned = true;
                return Err(e);
            }
            if let Some(entry) = self.in_flight.remove(&msg_id) {
                self.queues
                    .entry(entry.message.queue_name.clone())
                    .or_default()
                    .push_front(entry.message);
            }
            redelivered.push(msg_id);
        }
        Ok(redelivered)
    }

    pub fn status(&self, queue_name: &str) -> QueueStatusView {
        QueueStatusView {
            queue_name: queue_name.to_string(),
            ready: self.queues.get(queue_name).map(|q| q.len()).unwrap_or(0),
            in_flight: self
                .in_flight
                .values()
                .filter(|e| e.message.queue_name == queue_name)
                .count(),
        }
    }

    pub fn all_queues(&self) -> Vec<QueueStatusView> {
        let mut names: Vec<&String> = self.queues.keys().collect();
        names.sort();
        let mut views: Vec<QueueStatusView> = names
            .into_iter()
            .map(|name| self.status(name))
            .collect();
        // Queues that only have in-flight messages still show up
        let mut extra: Vec<&String> = self
            .in_flight
            .values()
            .map(|e| &e.message.queue_name)
            .filter(|name| !self.queues.contains_key(*name))
            .collect();
        extra.sort();
        extra.dedup();
        for name in extra {
            views.push(self.status(name));
        }
        views
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const VIS_MS: u64 = 30_000;

    fn open(dir: &Path) -> QueueEngine {
        QueueEngine::open(dir.join("node-1.wal"), "node-1".to_string(), VIS_MS).unwrap()
    }

    #[test]
    fn test_enqueue_dequeue_ack() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());

        let id = engine.enqueue("orders", b"m1".to_vec()).unwrap();
        assert_eq!(id, "node-1-0");
        assert_eq!(engine.status("orders").ready, 1);

        let delivered = engine.dequeue("orders").unwrap().unwrap();
        assert_eq!(delivered.message.msg_id, "node-1-0");
        assert_eq!(delivered.message.attempt_count, 1);
        assert_eq!(engine.status("orders").ready, 0);
        assert_eq!(engine.status("orders").in_flight, 1);

        assert!(engine.ack("node-1-0").unwrap());
        assert_eq!(engine.in_flight_len(), 0);

        // Double ack reports false, not an error
        assert!(!engine.ack("node-1-0").unwrap());
    }

    #[test]
    fn test_fifo_order() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());

        for i in 0..3 {
            engine
                .enqueue("orders", format!("m{}", i).into_bytes())
                .unwrap();
        }
        for i in 0..3 {
            let delivered = engine.dequeue("orders").unwrap().unwrap();
            assert_eq!(delivered.message.payload, format!("m{}", i).into_bytes());
        }
        assert!(engine.dequeue("orders").unwrap().is_none());
    }

    #[test]
    fn test_redelivery_to_head_with_attempt_count() {
        let dir = tempdir().unwrap();
        let mut engine =
            QueueEngine::open(dir.path().join("n.wal"), "node-1".to_string(), 0).unwrap();

        engine.enqueue("q", b"first".to_vec()).unwrap();
        engine.enqueue("q", b"second".to_vec()).unwrap();

        let d1 = engine.dequeue("q").unwrap().unwrap();
        assert_eq!(d1.message.attempt_count, 1);

        // Visibility timeout of zero: instantly redeliverable
        let now = crate::common::timestamp_now_millis();
        let redelivered = engine.sweep_redeliveries(now + 1).unwrap();
        assert_eq!(redelivered, vec![d1.message.msg_id.clone()]);

        // Redelivered message goes to the head, ahead of "second"
        let d2 = engine.dequeue("q").unwrap().unwrap();
        assert_eq!(d2.message.payload, b"first".to_vec());
        assert_eq!(d2.message.attempt_count, 2);
    }

    #[test]
    fn test_recovery_replays_wal() {
        let dir = tempdir().unwrap();
        {
            let mut engine = open(dir.path());
            engine.enqueue("orders", b"m1".to_vec()).unwrap();
            engine.enqueue("orders", b"m2".to_vec()).unwrap();
            engine.enqueue("orders", b"m3".to_vec()).unwrap();
        }

        let mut engine = open(dir.path());
        assert_eq!(engine.status("orders").ready, 3);

        // Order preserved across the restart, and new ids do not collide
        let id = engine.enqueue("orders", b"m4".to_vec()).unwrap();
        assert_eq!(id, "node-1-3");
        for expected in [b"m1".as_ref(), b"m2".as_ref(), b"m3".as_ref()] {
            let delivered = engine.dequeue("orders").unwrap().unwrap();
            assert_eq!(delivered.message.payload, expected);
        }
    }

    #[test]
    fn test_recovery_restores_in_flight() {
        let dir = tempdir().unwrap();
        {
            let mut engine = open(dir.path());
            engine.enqueue("orders", b"m1".to_vec()).unwrap();
            engine.enqueue("orders", b"m2".to_vec()).unwrap();
            engine.dequeue("orders").unwrap();
        }

        let engine = open(dir.path());
        assert_eq!(engine.status("orders").ready, 1);
        assert_eq!(engine.status("orders").in_flight, 1);
    }

    #[test]
    fn test_recovery_drops_acked() {
        let dir = tempdir().unwrap();
        {
            let mut engine = open(dir.path());
            engine.enqueue("orders", b"m1".to_vec()).unwrap();
            let d = engine.dequeue("orders").unwrap().unwrap();
            engine.ack(&d.message.msg_id).unwrap();
        }

        let engine = open(dir.path());
        assert_eq!(engine.status("orders").ready, 0);
        assert_eq!(engine.in_flight_len(), 0);
    }

    #[test]
    fn test_replay_is_idempotent_against_unknown_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node-1.wal");
        {
            use crate::queue::wal::{Wal, WalRecord};
            let mut wal = Wal::open(&path).unwrap();
            // Ack and dequeue for a message that was never enqueued
            wal.append(&WalRecord::Ack {
                msg_id: "ghost-1".to_string(),
            })
            .unwrap();
            wal.append(&WalRecord::Dequeue {
                msg_id: "ghost-2".to_string(),
            })
            .unwrap();
        }

        let engine = QueueEngine::open(&path, "node-1".to_string(), VIS_MS).unwrap();
        assert_eq!(engine.in_flight_len(), 0);
    }
}
