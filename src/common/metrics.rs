//! Metrics collection
//!
//! Prometheus-compatible counters and latency histograms, rendered as text
//! by the per-role `/metrics` endpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Default latency bucket upper bounds in milliseconds, powers of four
/// from sub-millisecond RPCs up to multi-second consensus stalls
const LATENCY_BOUNDS_MS: [f64; 8] = [0.25, 1.0, 4.0, 16.0, 64.0, 256.0, 1024.0, 4096.0];

/// Monotonic event counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// One histogram bucket: everything at or below `upper_ms` lands here
#[derive(Debug)]
struct Bucket {
    upper_ms: f64,
    hits: AtomicU64,
}

/// Latency histogram over fixed bucket bounds.
///
/// Values are recorded in milliseconds; the running sum is kept as integer
/// microseconds so `observe` stays lock-free.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<Bucket>,
    overflow: AtomicU64,
    total_micros: AtomicU64,
    samples: AtomicU64,
}

/// Point-in-time view used for rendering
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// Cumulative (upper bound, count) pairs, ending with +Inf
    pub cumulative: Vec<(f64, u64)>,
    pub sum_ms: f64,
    pub count: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_bounds(&LATENCY_BOUNDS_MS)
    }

    pub fn with_bounds(bounds_ms: &[f64]) -> Self {
        Self {
            buckets: bounds_ms
                .iter()
                .map(|&upper_ms| Bucket {
                    upper_ms,
                    hits: AtomicU64::new(0),
                })
                .collect(),
            overflow: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Record one value (milliseconds)
    pub fn observe(&self, value_ms: f64) {
        let cell = self
            .buckets
            .iter()
            .find(|bucket| value_ms <= bucket.upper_ms)
            .map(|bucket| &bucket.hits)
            .unwrap_or(&self.overflow);
        cell.fetch_add(1, Ordering::Relaxed);

        self.total_micros
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = Vec::with_capacity(self.buckets.len() + 1);
        let mut seen = 0u64;
        for bucket in &self.buckets {
            seen += bucket.hits.load(Ordering::Relaxed);
            cumulative.push((bucket.upper_ms, seen));
        }
        seen += self.overflow.load(Ordering::Relaxed);
        cumulative.push((f64::INFINITY, seen));

        HistogramSnapshot {
            cumulative,
            sum_ms: self.total_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            count: self.samples.load(Ordering::Relaxed),
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Named counters and histograms for one node
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<HashMap<String, Arc<Counter>>>,
    histograms: Mutex<HashMap<String, Arc<Histogram>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut counters = self.counters.lock().unwrap();
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Counter::new()))
            .clone()
    }

    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        let mut histograms = self.histograms.lock().unwrap();
        histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::new()))
            .clone()
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let mut out = String::new();

        let counters = self.counters.lock().unwrap();
        let mut names: Vec<_> = counters.keys().collect();
        names.sort();
        for name in names {
            out += &format!("# TYPE {} counter\n", name);
            out += &format!("{} {}\n", name, counters[name].get());
        }
        drop(counters);

        let histograms = self.histograms.lock().unwrap();
        let mut names: Vec<_> = histograms.keys().collect();
        names.sort();
        for name in names {
            let snapshot = histograms[name].snapshot();
            out += &format!("# TYPE {} histogram\n", name);
            for (upper_ms, count) in &snapshot.cumulative {
                if upper_ms.is_infinite() {
                    out += &format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, count);
                } else {
                    out += &format!("{}_bucket{{le=\"{}\"}} {}\n", name, upper_ms, count);
                }
            }
            out += &format!("{}_sum {}\n", name, snapshot.sum_ms);
            out += &format!("{}_count {}\n", name, snapshot.count);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_histogram_buckets() {
        let histogram = Histogram::new();
        histogram.observe(0.1);
        histogram.observe(30.0);
        histogram.observe(99_999.0);

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count, 3);
        // Smallest bucket (<= 0.25ms) holds the first observation
        assert_eq!(snapshot.cumulative[0], (0.25, 1));
        // +Inf holds everything, including the over-range sample
        assert_eq!(snapshot.cumulative.last().unwrap().1, 3);
    }

    #[test]
    fn test_histogram_cumulative_is_monotonic() {
        let histogram = Histogram::with_bounds(&[1.0, 10.0, 100.0]);
        for value in [0.5, 0.7, 5.0, 50.0, 500.0] {
            histogram.observe(value);
        }

        let snapshot = histogram.snapshot();
        assert_eq!(
            snapshot.cumulative,
            vec![(1.0, 2), (10.0, 3), (100.0, 4), (f64::INFINITY, 5)]
        );
    }

    #[test]
    fn test_render_contains_metrics() {
        let metrics = Metrics::new();
        metrics.counter("minicoord_lock_grants_total").inc();
        metrics.histogram("minicoord_acquire_ms").observe(3.0);

        let text = metrics.render();
        assert!(text.contains("minicoord_lock_grants_total 1"));
        assert!(text.contains("minicoord_acquire_ms_count 1"));
        assert!(text.contains("le=\"+Inf\""));
    }
}
