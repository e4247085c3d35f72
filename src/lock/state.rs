//! Replicated lock table state machine
//!
//! Driven exclusively by Raft-committed commands. Apply is deterministic and
//! idempotent so every replica that applies the same log prefix holds the
//! same table.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

impl std::str::FromStr for LockMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "shared" => Ok(LockMode::Shared),
            "exclusive" => Ok(LockMode::Exclusive),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown lock mode: {}",
                other
            ))),
        }
    }
}

/// Lock-state mutation carried in a Raft log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockCommand {
    Acquire {
        resource: String,
        client_id: String,
        mode: LockMode,
        granted_at_ms: u64,
        ttl_ms: Option<u64>,
    },
    Release {
        resource: String,
        client_id: String,
    },
    /// Internal: TTL expiry, treated like a release of the whole entry
    Expire {
        resource: String,
    },
    /// Deadlock victim: drop the client from every holder set
    AbortClient {
        client_id: String,
    },
}

impl LockCommand {
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| crate::Error::Internal(format!("encode lock command: {}", e)))
    }

    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| crate::Error::Corrupted(format!("decode lock command: {}", e)))
    }
}

/// One held lock: mode, holders, grant time, optional ttl
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub mode: LockMode,
    pub holders: BTreeSet<String>,
    pub acquired_at_ms: u64,
    pub ttl_ms: Option<u64>,
}

impl LockEntry {
    /// Has this entry outlived its ttl?
    pub fn expired(&self, now_ms: u64) -> bool {
        match self.ttl_ms {
            Some(ttl) => self.acquired_at_ms.saturating_add(ttl) < now_ms,
            None => false,
        }
    }
}

/// State transition observed while applying a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyEvent {
    /// `client_id` now holds `resource`
    Granted { resource: String, client_id: String },
    /// `resource` lost holders and may admit waiters
    Freed { resource: String },
    /// The victim's held locks were released (resources listed in `freed`)
    ClientAborted {
        client_id: String,
        freed: Vec<String>,
    },
}

/// The replicated lock table
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<String, LockEntry>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed command, returning the observable transitions.
    ///
    /// Incompatible grants are ignored with a warning: the leader validates
    /// before proposing, so hitting that path means a validation bug, and
    /// replicas must stay deterministic rather than diverge.
    pub fn apply(&mut self, command: &LockCommand) -> Vec<ApplyEvent> {
        match command {
            LockCommand::Acquire {
                resource,
                client_id,
                mode,
                granted_at_ms,
                ttl_ms,
            } => self.apply_acquire(resource, client_id, *mode, *granted_at_ms, *ttl_ms),
            LockCommand::Release {
                resource,
                client_id,
            } => self.apply_release(resource, client_id),
            LockCommand::Expire { resource } => self.apply_expire(resource),
            LockCommand::AbortClient { client_id } => self.apply_abort(client_id),
        }
    }

    fn apply_acquire(
        &mut self,
        resource: &str,
        client_id: &str,
        mode: LockMode,
        granted_at_ms: u64,
        ttl_ms: Option<u64>,
    ) -> Vec<ApplyEvent> {
        match self.locks.get_mut(resource) {
            None => {
                let mut holders = BTreeSet::new();
                holders.insert(client_id.to_string());
                self.locks.insert(
                    resource.to_string(),
                    LockEntry {
                        mode,
                        holders,
                        acquired_at_ms: granted_at_ms,
                        ttl_ms,
                    },
                );
                vec![ApplyEvent::Granted {
                    resource: resource.to_string(),
                    client_id: client_id.to_string(),
                }]
            }
            Some(entry) => {
                if entry.holders.contains(client_id) {
                    // Duplicate acquire of held-or-stronger mode is a no-op
                    return vec![];
                }
                if mode == LockMode::Shared && entry.mode == LockMode::Shared {
                    entry.holders.insert(client_id.to_string());
                    vec![ApplyEvent::Granted {
                        resource: resource.to_string(),
                        client_id: client_id.to_string(),
                    }]
                } else {
                    tracing::warn!(
                        "ignoring incompatible grant: {} wants {} on {} held {}",
                        client_id,
                        mode,
                        resource,
                        entry.mode
                    );
                    vec![]
                }
            }
        }
    }

    fn apply_release(&mut self, resource: &str, client_id: &str) -> Vec<ApplyEvent> {
        let Some(entry) = self.locks.get_mut(resource) else {
            return vec![];
        };
        if !entry.holders.remove(client_id) {
            return vec![];
        }
        if entry.holders.is_empty() {
            self.locks.remove(resource);
            vec![ApplyEvent::Freed {
                resource: resource.to_string(),
            }]
        } else {
            vec![]
        }
    }

    fn apply_expire(&mut self, resource: &str) -> Vec<ApplyEvent> {
        if self.locks.remove(resource).is_some() {
            vec![ApplyEvent::Freed {
                resource: resource.to_string(),
            }]
        } else {
            vec![]
        }
    }

    fn apply_abort(&mut self, client_id: &str) -> Vec<ApplyEvent> {
        let mut freed = Vec::new();
        self.locks.retain(|resource, entry| {
            if entry.holders.remove(client_id) && entry.holders.is_empty() {
                freed.push(resource.clone());
                false
            } else {
                true
            }
        });
        freed.sort();

        let mut events = vec![ApplyEvent::ClientAborted {
            client_id: client_id.to_string(),
            freed: freed.clone(),
        }];
        events.extend(
            freed
                .into_iter()
                .map(|resource| ApplyEvent::Freed { resource }),
        );
        events
    }

    /// Can `client_id` be granted `mode` on `resource` right now?
    pub fn grantable(&self, resource: &str, client_id: &str, mode: LockMode) -> bool {
        match self.locks.get(resource) {
            None => true,
            Some(entry) => {
                if entry.holders.contains(client_id) {
                    // Held-or-stronger check happens in `already_holds`
                    return entry.mode == mode || entry.mode == LockMode::Exclusive;
                }
                mode == LockMode::Shared && entry.mode == LockMode::Shared
            }
        }
    }

    /// Does the client already hold the requested (or a stronger) mode?
    pub fn already_holds(&self, resource: &str, client_id: &str, mode: LockMode) -> bool {
        match self.locks.get(resource) {
            Some(entry) if entry.holders.contains(client_id) => {
                entry.mode == mode || entry.mode == LockMode::Exclusive
            }
            _ => false,
        }
    }

    pub fn is_holder(&self, resource: &str, client_id: &str) -> bool {
        self.locks
            .get(resource)
            .map(|entry| entry.holders.contains(client_id))
            .unwrap_or(false)
    }

    pub fn get(&self, resource: &str) -> Option<&LockEntry> {
        self.locks.get(resource)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LockEntry)> {
        self.locks.iter()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Resources whose ttl elapsed before `now_ms`
    pub fn expired_resources(&self, now_ms: u64) -> Vec<String> {
        let mut expired: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, entry)| entry.expired(now_ms))
            .map(|(resource, _)| resource.clone())
            .collect();
        expired.sort();
        expired
    }

    /// Debug-time invariants (asserted by tests under randomized load)
    #[cfg(test)]
    pub fn check_invariants(&self) {
        for (resource, entry) in &self.locks {
            assert!(
                !entry.holders.is_empty(),
                "resource {} has an empty holder set",
                resource
            );
            if entry.mode == LockMode::Exclusive {
                assert_eq!(
                    entry.holders.len(),
                    1,
                    "exclusive resource {} has {} holders",
                    resource,
                    entry.holders.len()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquire(resource: &str, client: &str, mode: LockMode) -> LockCommand {
        LockCommand::Acquire {
            resource: resource.to_string(),
            client_id: client.to_string(),
            mode,
            granted_at_ms: 1000,
            ttl_ms: None,
        }
    }

    fn release(resource: &str, client: &str) -> LockCommand {
        LockCommand::Release {
            resource: resource.to_string(),
            client_id: client.to_string(),
        }
    }

    #[test]
    fn test_command_roundtrip() {
        let cmd = acquire("r", "c1", LockMode::Exclusive);
        let decoded = LockCommand::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_exclusive_grant_and_release() {
        let mut table = LockTable::new();

        let events = table.apply(&acquire("r", "c1", LockMode::Exclusive));
        assert_eq!(
            events,
            vec![ApplyEvent::Granted {
                resource: "r".to_string(),
                client_id: "c1".to_string()
            }]
        );
        assert!(table.is_holder("r", "c1"));
        table.check_invariants();

        let events = table.apply(&release("r", "c1"));
        assert_eq!(
            events,
            vec![ApplyEvent::Freed {
                resource: "r".to_string()
            }]
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_shared_holders_coexist() {
        let mut table = LockTable::new();
        table.apply(&acquire("r", "c1", LockMode::Shared));
        table.apply(&acquire("r", "c2", LockMode::Shared));

        let entry = table.get("r").unwrap();
        assert_eq!(entry.mode, LockMode::Shared);
        assert_eq!(entry.holders.len(), 2);
        table.check_invariants();

        // Entry survives until the last reader releases
        table.apply(&release("r", "c1"));
        assert!(table.get("r").is_some());
        table.apply(&release("r", "c2"));
        assert!(table.get("r").is_none());
    }

    #[test]
    fn test_grantable() {
        let mut table = LockTable::new();
        assert!(table.grantable("r", "c1", LockMode::Exclusive));

        table.apply(&acquire("r", "c1", LockMode::Shared));
        assert!(table.grantable("r", "c2", LockMode::Shared));
        assert!(!table.grantable("r", "c2", LockMode::Exclusive));

        table.apply(&acquire("x", "c1", LockMode::Exclusive));
        assert!(!table.grantable("x", "c2", LockMode::Shared));
    }

    #[test]
    fn test_duplicate_acquire_is_noop() {
        let mut table = LockTable::new();
        table.apply(&acquire("r", "c1", LockMode::Exclusive));
        let events = table.apply(&acquire("r", "c1", LockMode::Exclusive));
        assert!(events.is_empty());
        assert!(table.already_holds("r", "c1", LockMode::Exclusive));
        // Exclusive covers a shared request too
        assert!(table.already_holds("r", "c1", LockMode::Shared));
        table.check_invariants();
    }

    #[test]
    fn test_duplicate_release_is_noop() {
        let mut table = LockTable::new();
        let events = table.apply(&release("r", "nobody"));
        assert!(events.is_empty());
    }

    #[test]
    fn test_incompatible_grant_ignored() {
        let mut table = LockTable::new();
        table.apply(&acquire("r", "c1", LockMode::Exclusive));
        let events = table.apply(&acquire("r", "c2", LockMode::Exclusive));
        assert!(events.is_empty());
        assert_eq!(table.get("r").unwrap().holders.len(), 1);
        table.check_invariants();
    }

    #[test]
    fn test_abort_client_releases_everything() {
        let mut table = LockTable::new();
        table.apply(&acquire("a", "c1", LockMode::Exclusive));
        table.apply(&acquire("b", "c1", LockMode::Shared));
        table.apply(&acquire("b", "c2", LockMode::Shared));

        let events = table.apply(&LockCommand::AbortClient {
            client_id: "c1".to_string(),
        });

        // `a` freed entirely; `b` keeps c2
        assert!(events.contains(&ApplyEvent::Freed {
            resource: "a".to_string()
        }));
        assert!(table.get("a").is_none());
        assert_eq!(table.get("b").unwrap().holders.len(), 1);
        table.check_invariants();
    }

    #[test]
    fn test_expiry() {
        let mut table = LockTable::new();
        table.apply(&LockCommand::Acquire {
            resource: "r".to_string(),
            client_id: "c1".to_string(),
            mode: LockMode::Exclusive,
            granted_at_ms: 1000,
            ttl_ms: Some(500),
        });

        assert!(table.expired_resources(1400).is_empty());
        assert_eq!(table.expired_resources(2000), vec!["r".to_string()]);

        let events = table.apply(&LockCommand::Expire {
            resource: "r".to_string(),
        });
        assert_eq!(
            events,
            vec![ApplyEvent::Freed {
                resource: "r".to_string()
            }]
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_replay_determinism() {
        let commands = vec![
            acquire("a", "c1", LockMode::Exclusive),
            acquire("b", "c2", LockMode::Shared),
            acquire("b", "c3", LockMode::Shared),
            release("a", "c1"),
            acquire("a", "c2", LockMode::Exclusive),
            LockCommand::AbortClient {
                client_id: "c2".to_string(),
            },
        ];

        let mut first = LockTable::new();
        let mut second = LockTable::new();
        for cmd in &commands {
            first.apply(cmd);
        }
        for cmd in &commands {
            second.apply(cmd);
        }

        let collect = |t: &LockTable| {
            let mut v: Vec<(String, LockEntry)> =
                t.iter().map(|(k, e)| (k.clone(), e.clone())).collect();
            v.sort_by(|a, b| a.0.cmp(&b.0));
            v
        };
        assert_eq!(collect(&first), collect(&second));
        first.check_invariants();
    }
}
