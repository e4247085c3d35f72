//! Cache service: MESI coherence over broadcast RPC
//!
//! Reads that miss locally broadcast to the ensemble; writes broadcast an
//! invalidate and install Modified once every reachable peer has answered.
//! A timed-out peer is treated as invalidated: its view is frozen during
//! the partition and rediscovers the value on its next read. Writes to the
//! same key serialize on a per-key async lock.

use crate::common::{validate_key, Metrics, Result};
use crate::cache::engine::{CacheMetricsView, Evicted, LineState, MesiCache};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Peer fan-out used by the cache server.
///
/// Implementations enforce the RPC deadline and treat timed-out peers as
/// answered (reads: no data; invalidates: invalidated).
#[tonic::async_trait]
pub trait CachePeers: Send + Sync + 'static {
    /// Broadcast a read request; the first peer holding data wins
    async fn read(&self, key: &str, sender: &str) -> Option<Vec<u8>>;
    /// Broadcast an invalidate; returns the number of explicit acks
    async fn invalidate(&self, key: &str, sender: &str) -> usize;
}

/// Optional external store receiving write-backs and serving fill reads
pub trait BackingStore: Send + Sync + 'static {
    fn load(&self, key: &str) -> Option<Vec<u8>>;
    fn store(&self, key: &str, value: &[u8]);
}

/// In-memory backing store (tests and single-process deployments)
#[derive(Default)]
pub struct MemoryBackingStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackingStore for MemoryBackingStore {
    fn load(&self, key: &str) -> Option<Vec<u8>> {
        self.map.lock().unwrap().get(key).cloned()
    }

    fn store(&self, key: &str, value: &[u8]) {
        self.map.lock().unwrap().insert(key.to_string(), value.to_vec());
    }
}

/// Result of a cache read
#[derive(Debug)]
pub struct GetResult {
    pub value: Option<Vec<u8>>,
    pub state: Option<LineState>,
}

/// Cache node
pub struct CacheServer {
    node_id: String,
    engine: Mutex<MesiCache>,
    peers: Arc<dyn CachePeers>,
    backing: Option<Arc<dyn BackingStore>>,
    /// Serializes writes per key across the broadcast step
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metrics: Arc<Metrics>,
}

impl CacheServer {
    pub fn new(
        node_id: String,
        capacity: usize,
        peers: Arc<dyn CachePeers>,
        backing: Option<Arc<dyn BackingStore>>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            engine: Mutex::new(MesiCache::new(capacity)),
            peers,
            backing,
            key_locks: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Read a key: local hit, else peer broadcast (installs Shared), else
    /// backing-store fill (installs Exclusive), else miss.
    pub async fn get(&self, key: &str) -> Result<GetResult> {
        validate_key(key)?;

        if let Some((value, state)) = self.engine.lock().unwrap().local_get(key) {
            self.metrics.counter("minicoord_cache_hits_total").inc();
            return Ok(GetResult {
                value: Some(value),
                state: Some(state),
            });
        }
        self.metrics.counter("minicoord_cache_misses_total").inc();

        if let Some(value) = self.peers.read(key, &self.node_id).await {
            tracing::info!("fetched {} from a peer, cached as S", key);
            self.install(key, value.clone(), LineState::Shared);
            return Ok(GetResult {
                value: Some(value),
                state: Some(LineState::Shared),
            });
        }

        if let Some(backing) = &self.backing {
            if let Some(value) = backing.load(key) {
                tracing::info!("fetched {} from the backing store, cached as E", key);
                self.install(key, value.clone(), LineState::Exclusive);
                return Ok(GetResult {
                    value: Some(value),
                    state: Some(LineState::Exclusive),
                });
            }
        }

        Ok(GetResult {
            value: None,
            state: None,
        })
    }

    /// Write a key: invalidate everywhere, then install Modified locally
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;

        let key_lock = self.key_lock(key);
        let _guard = key_lock.lock().await;

        let acks = self.peers.invalidate(key, &self.node_id).await;
        tracing::debug!("invalidate of {} acked by {} peers", key, acks);

        self.install(key, value, LineState::Modified);
        self.metrics.counter("minicoord_cache_puts_total").inc();
        Ok(())
    }

    /// Drop a key from the ensemble: invalidate peers, write back if dirty
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let key_lock = self.key_lock(key);
        let _guard = key_lock.lock().await;

        let present = self.engine.lock().unwrap().state_of(key).is_some();
        if !present {
            return Ok(false);
        }

        self.peers.invalidate(key, &self.node_id).await;

        let removed = self.engine.lock().unwrap().remove(key);
        if let Some((value, true)) = removed {
            self.write_back(key, &value);
        }
        tracing::info!("deleted {} from cache", key);
        Ok(true)
    }

    /// A peer read broadcast reached this node
    pub fn handle_remote_read(&self, key: &str) -> Option<Vec<u8>> {
        let result = self.engine.lock().unwrap().on_remote_read(key);
        match result {
            Some((value, needs_write_back)) => {
                if needs_write_back {
                    self.write_back(key, &value);
                }
                Some(value)
            }
            None => None,
        }
    }

    /// A peer invalidate broadcast reached this node
    pub fn handle_remote_invalidate(&self, key: &str) {
        let write_back = self.engine.lock().unwrap().on_remote_invalidate(key);
        if let Some(value) = write_back {
            self.write_back(key, &value);
        }
    }

    pub fn state_of(&self, key: &str) -> Option<LineState> {
        self.engine.lock().unwrap().state_of(key)
    }

    pub fn metrics_view(&self) -> CacheMetricsView {
        self.engine.lock().unwrap().metrics_view()
    }

    // === Internals ===

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn install(&self, key: &str, value: Vec<u8>, state: LineState) {
        let evicted = self.engine.lock().unwrap().install(key, value, state);
        if let Some(evicted) = evicted {
            self.metrics.counter("minicoord_cache_evictions_total").inc();
            self.handle_eviction(evicted);
        }
    }

    fn handle_eviction(&self, evicted: Evicted) {
        if evicted.was_modified {
            self.write_back(&evicted.key, &evicted.value);
        }
    }

    /// Flush a dirty value to the backing store, or drop it when none is
    /// configured (the documented durability limit of the cache)
    fn write_back(&self, key: &str, value: &[u8]) {
        match &self.backing {
            Some(backing) => {
                backing.store(key, value);
                tracing::info!("wrote back {} to the backing store", key);
            }
            None => {
                tracing::warn!("dropping modified line {} (no backing store configured)", key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Peerless ensemble: every broadcast comes back empty
    struct NoPeers;

    #[tonic::async_trait]
    impl CachePeers for NoPeers {
        async fn read(&self, _key: &str, _sender: &str) -> Option<Vec<u8>> {
            None
        }

        async fn invalidate(&self, _key: &str, _sender: &str) -> usize {
            0
        }
    }

    fn server(backing: Option<Arc<dyn BackingStore>>) -> Arc<CacheServer> {
        CacheServer::new(
            "cache-1".to_string(),
            4,
            Arc::new(NoPeers),
            backing,
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn test_put_then_get_same_node() {
        let server = server(None);
        server.put("k", b"1".to_vec()).await.unwrap();

        let result = server.get("k").await.unwrap();
        assert_eq!(result.value, Some(b"1".to_vec()));
        assert_eq!(result.state, Some(LineState::Modified));
    }

    #[tokio::test]
    async fn test_miss_without_peers_or_backing() {
        let server = server(None);
        let result = server.get("absent").await.unwrap();
        assert!(result.value.is_none());
        assert!(result.state.is_none());
    }

    #[tokio::test]
    async fn test_backing_store_fill_installs_exclusive() {
        let backing = Arc::new(MemoryBackingStore::new());
        backing.store("k", b"warm");
        let server = server(Some(backing));

        let result = server.get("k").await.unwrap();
        assert_eq!(result.value, Some(b"warm".to_vec()));
        assert_eq!(result.state, Some(LineState::Exclusive));
    }

    #[tokio::test]
    async fn test_eviction_writes_back_dirty_line() {
        let backing = Arc::new(MemoryBackingStore::new());
        let server = CacheServer::new(
            "cache-1".to_string(),
            1,
            Arc::new(NoPeers),
            Some(backing.clone()),
            Arc::new(Metrics::new()),
        );

        server.put("a", b"dirty".to_vec()).await.unwrap();
        server.put("b", b"2".to_vec()).await.unwrap();

        // `a` was evicted in state M and written back
        assert!(server.state_of("a").is_none());
        assert_eq!(backing.load("a"), Some(b"dirty".to_vec()));
    }

    #[tokio::test]
    async fn test_delete() {
        let server = server(None);
        server.put("k", b"1".to_vec()).await.unwrap();
        assert!(server.delete("k").await.unwrap());
        assert!(server.state_of("k").is_none());
        // Deleting an absent key reports false
        assert!(!server.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_invalidate_then_local_read_misses() {
        let server = server(None);
        server.put("k", b"1".to_vec()).await.unwrap();
        server.handle_remote_invalidate("k");

        assert_eq!(server.state_of("k"), Some(LineState::Invalid));
        let result = server.get("k").await.unwrap();
        assert!(result.value.is_none());
    }
}
