//! MESI cache lines with LRU eviction
//!
//! Pure state: all peer I/O lives in the server. Lines carry one of the four
//! MESI states; Invalid lines are retained for capacity bookkeeping but
//! never serve reads. Recency is a monotonic tick bumped on local access.

use std::collections::HashMap;

/// MESI line state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Modified,
    Exclusive,
    Shared,
    Invalid,
}

impl LineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineState::Modified => "M",
            LineState::Exclusive => "E",
            LineState::Shared => "S",
            LineState::Invalid => "I",
        }
    }
}

impl std::fmt::Display for LineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One cached line
#[derive(Debug, Clone)]
pub struct CacheLine {
    pub value: Vec<u8>,
    pub state: LineState,
    /// Recency tick; larger is fresher
    last_access: u64,
    pub last_modified_ms: u64,
}

/// A line pushed out by capacity pressure
#[derive(Debug)]
pub struct Evicted {
    pub key: String,
    pub value: Vec<u8>,
    pub was_modified: bool,
}

/// Counters and per-state line counts for the metrics surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheMetricsView {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
    pub evictions: u64,
    pub modified: usize,
    pub exclusive: usize,
    pub shared: usize,
    pub invalid: usize,
}

/// Per-node MESI cache
pub struct MesiCache {
    lines: HashMap<String, CacheLine>,
    capacity: usize,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl MesiCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Local read. M/E/S hit and promote in LRU; I and absent miss.
    pub fn local_get(&mut self, key: &str) -> Option<(Vec<u8>, LineState)> {
        let tick = self.tick + 1;
        match self.lines.get_mut(key) {
            Some(line) if line.state != LineState::Invalid => {
                self.tick = tick;
                line.last_access = tick;
                self.hits += 1;
                Some((line.value.clone(), line.state))
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Install or replace a line, evicting the LRU line when a new key
    /// would exceed capacity. The caller handles write-back of an evicted
    /// Modified line.
    pub fn install(&mut self, key: &str, value: Vec<u8>, state: LineState) -> Option<Evicted> {
        let evicted = if !self.lines.contains_key(key) && self.lines.len() >= self.capacity {
            self.evict_lru()
        } else {
            None
        };

        let tick = self.next_tick();
        let now_ms = crate::common::timestamp_now_millis();
        let last_modified_ms = if state == LineState::Modified {
            now_ms
        } else {
            self.lines
                .get(key)
                .map(|l| l.last_modified_ms)
                .unwrap_or(now_ms)
        };

        self.lines.insert(
            key.to_string(),
            CacheLine {
                value,
                state,
                last_access: tick,
                last_modified_ms,
            },
        );
        evicted
    }

    fn evict_lru(&mut self) -> Option<Evicted> {
        let victim = self
            .lines
            .iter()
            .min_by_key(|(_, line)| line.last_access)
            .map(|(key, _)| key.clone())?;

        let line = self.lines.remove(&victim)?;
        self.evictions += 1;
        tracing::info!(
            "evicted {} (state: {}, total evictions: {})",
            victim,
            line.state,
            self.evictions
        );
        Some(Evicted {
            key: victim,
            value: line.value,
            was_modified: line.state == LineState::Modified,
        })
    }

    /// A peer is reading this key. M and E demote to S; the returned flag
    /// says whether the line needs write-back (it was M).
    pub fn on_remote_read(&mut self, key: &str) -> Option<(Vec<u8>, bool)> {
        let line = self.lines.get_mut(key)?;
        match line.state {
            LineState::Modified => {
                line.state = LineState::Shared;
                tracing::info!("remote read of {}: M -> S", key);
                Some((line.value.clone(), true))
            }
            LineState::Exclusive => {
                line.state = LineState::Shared;
                tracing::info!("remote read of {}: E -> S", key);
                Some((line.value.clone(), false))
            }
            LineState::Shared => Some((line.value.clone(), false)),
            LineState::Invalid => None,
        }
    }

    /// A peer is writing this key. Any valid line drops to I; a Modified
    /// line's value is returned for write-back.
    pub fn on_remote_invalidate(&mut self, key: &str) -> Option<Vec<u8>> {
        let line = self.lines.get_mut(key)?;
        if line.state == LineState::Invalid {
            return None;
        }
        let write_back = if line.state == LineState::Modified {
            Some(line.value.clone())
        } else {
            None
        };
        tracing::info!("invalidated {}: {} -> I", key, line.state);
        line.state = LineState::Invalid;
        write_back
    }

    /// Drop a line entirely, returning its value and whether it was M
    pub fn remove(&mut self, key: &str) -> Option<(Vec<u8>, bool)> {
        let line = self.lines.remove(key)?;
        Some((line.value, line.state == LineState::Modified))
    }

    pub fn state_of(&self, key: &str) -> Option<LineState> {
        self.lines.get(key).map(|l| l.state)
    }

    pub fn line(&self, key: &str) -> Option<&CacheLine> {
        self.lines.get(key)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn metrics_view(&self) -> CacheMetricsView {
        let total = self.hits + self.misses;
        let mut counts = [0usize; 4];
        for line in self.lines.values() {
            let idx = match line.state {
                LineState::Modified => 0,
                LineState::Exclusive => 1,
                LineState::Shared => 2,
                LineState::Invalid => 3,
            };
            counts[idx] += 1;
        }
        CacheMetricsView {
            hits: self.hits,
            misses: self.misses,
            hit_rate: if total > 0 {
                self.hits as f64 / total as f64
            } else {
                0.0
            },
            size: self.lines.len(),
            capacity: self.capacity,
            evictions: self.evictions,
            modified: counts[0],
            exclusive: counts[1],
            shared: counts[2],
            invalid: counts[3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_then_install_then_hit() {
        let mut cache = MesiCache::new(10);
        assert!(cache.local_get("k").is_none());

        cache.install("k", b"v".to_vec(), LineState::Exclusive);
        let (value, state) = cache.local_get("k").unwrap();
        assert_eq!(value, b"v");
        assert_eq!(state, LineState::Exclusive);

        let view = cache.metrics_view();
        assert_eq!(view.hits, 1);
        assert_eq!(view.misses, 1);
    }

    #[test]
    fn test_invalid_line_does_not_serve_reads() {
        let mut cache = MesiCache::new(10);
        cache.install("k", b"v".to_vec(), LineState::Modified);
        cache.on_remote_invalidate("k");

        // Line retained for bookkeeping, state I, no read served
        assert_eq!(cache.state_of("k"), Some(LineState::Invalid));
        assert!(cache.local_get("k").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remote_read_demotes_m_with_write_back() {
        let mut cache = MesiCache::new(10);
        cache.install("k", b"v".to_vec(), LineState::Modified);

        let (value, needs_write_back) = cache.on_remote_read("k").unwrap();
        assert_eq!(value, b"v");
        assert!(needs_write_back);
        assert_eq!(cache.state_of("k"), Some(LineState::Shared));

        // Second remote read: S stays S, no write-back
        let (_, needs_write_back) = cache.on_remote_read("k").unwrap();
        assert!(!needs_write_back);
    }

    #[test]
    fn test_remote_read_demotes_e_without_write_back() {
        let mut cache = MesiCache::new(10);
        cache.install("k", b"v".to_vec(), LineState::Exclusive);

        let (_, needs_write_back) = cache.on_remote_read("k").unwrap();
        assert!(!needs_write_back);
        assert_eq!(cache.state_of("k"), Some(LineState::Shared));
    }

    #[test]
    fn test_invalidate_returns_modified_value() {
        let mut cache = MesiCache::new(10);
        cache.install("m", b"dirty".to_vec(), LineState::Modified);
        cache.install("s", b"clean".to_vec(), LineState::Shared);

        assert_eq!(cache.on_remote_invalidate("m"), Some(b"dirty".to_vec()));
        assert_eq!(cache.on_remote_invalidate("s"), None);
        assert_eq!(cache.state_of("s"), Some(LineState::Invalid));

        // Invalidating an already-invalid line is a no-op
        assert_eq!(cache.on_remote_invalidate("m"), None);
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = MesiCache::new(2);
        cache.install("a", b"1".to_vec(), LineState::Exclusive);
        cache.install("b", b"2".to_vec(), LineState::Exclusive);

        // Touch a so b becomes the LRU line
        cache.local_get("a");

        let evicted = cache.install("c", b"3".to_vec(), LineState::Exclusive);
        let evicted = evicted.unwrap();
        assert_eq!(evicted.key, "b");
        assert!(!evicted.was_modified);
        assert_eq!(cache.len(), 2);
        assert!(cache.line("a").is_some());
        assert!(cache.line("c").is_some());
    }

    #[test]
    fn test_eviction_flags_modified_line() {
        let mut cache = MesiCache::new(1);
        cache.install("a", b"dirty".to_vec(), LineState::Modified);
        let evicted = cache.install("b", b"2".to_vec(), LineState::Shared).unwrap();
        assert_eq!(evicted.key, "a");
        assert!(evicted.was_modified);
        assert_eq!(evicted.value, b"dirty");
    }

    #[test]
    fn test_reinstall_existing_key_does_not_evict() {
        let mut cache = MesiCache::new(2);
        cache.install("a", b"1".to_vec(), LineState::Shared);
        cache.install("b", b"2".to_vec(), LineState::Shared);
        assert!(cache.install("a", b"1b".to_vec(), LineState::Modified).is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.state_of("a"), Some(LineState::Modified));
    }

    #[test]
    fn test_metrics_state_distribution() {
        let mut cache = MesiCache::new(10);
        cache.install("m", b"1".to_vec(), LineState::Modified);
        cache.install("e", b"2".to_vec(), LineState::Exclusive);
        cache.install("s", b"3".to_vec(), LineState::Shared);
        cache.on_remote_invalidate("s");

        let view = cache.metrics_view();
        assert_eq!(view.modified, 1);
        assert_eq!(view.exclusive, 1);
        assert_eq!(view.shared, 0);
        assert_eq!(view.invalid, 1);
    }
}
