//! In-process metrics for the path-query subsystem
//!
//! Lightweight atomic registry, no exporter: counters are labelled cells in
//! a concurrent map, histograms use fixed exponential buckets starting at
//! 0.1 ms. Everything is cheap enough to record on the query hot path and
//! lock-free to read, so tests and operators can snapshot at any time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::Serialize;

/// Exponential duration buckets in seconds, from 0.1 ms to ~6.5 s.
const DURATION_BUCKETS: [f64; 17] = [
    0.0001, 0.0002, 0.0004, 0.0008, 0.0016, 0.0032, 0.0064, 0.0128, 0.0256, 0.0512, 0.1024,
    0.2048, 0.4096, 0.8192, 1.6384, 3.2768, 6.5536,
];

/// Power-of-two buckets for per-query segment counts.
const SEGMENT_BUCKETS: [f64; 12] = [
    1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0,
];

/// Fixed-bucket histogram with atomic cells. The final implicit bucket is
/// +Inf, mirrored by the last slot of `counts`.
pub struct Histogram {
    bounds: &'static [f64],
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    total: AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            sum_micros: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        let slot = self
            .bounds
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.bounds.len());
        self.counts[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            count: self.total.load(Ordering::Relaxed),
            sum_micros: self.sum_micros.load(Ordering::Relaxed),
            buckets: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

/// Read-only view of a histogram for snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum_micros: u64,
    pub buckets: Vec<u64>,
}

/// Metric registry for the path-query subsystem.
pub struct PathQueryMetrics {
    /// `path_query_total{result, agg_func}`
    query_total: DashMap<(String, String), AtomicU64>,
    /// `path_query_errors_total{error_type}`
    errors_total: DashMap<String, AtomicU64>,
    /// `path_query_cache_hits_total{cache_type}`
    cache_hits_total: DashMap<String, AtomicU64>,
    /// `path_query_cache_misses_total{cache_type}`
    cache_misses_total: DashMap<String, AtomicU64>,
    /// `path_query_duration_seconds{agg_func}`
    query_duration: DashMap<String, Histogram>,
    /// `segment_tree_query_duration_seconds`
    segment_tree_duration: Histogram,
    /// `path_query_segment_count`
    segment_count: Histogram,
}

impl PathQueryMetrics {
    fn new() -> Self {
        Self {
            query_total: DashMap::new(),
            errors_total: DashMap::new(),
            cache_hits_total: DashMap::new(),
            cache_misses_total: DashMap::new(),
            query_duration: DashMap::new(),
            segment_tree_duration: Histogram::new(&DURATION_BUCKETS),
            segment_count: Histogram::new(&SEGMENT_BUCKETS),
        }
    }

    fn bump(map: &DashMap<String, AtomicU64>, label: &str) {
        map.entry(label.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self, result: &str, agg_func: &str) {
        self.query_total
            .entry((result.to_string(), agg_func.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, error_type: &str) {
        Self::bump(&self.errors_total, error_type);
    }

    pub fn record_cache_hit(&self, cache_type: &str) {
        Self::bump(&self.cache_hits_total, cache_type);
    }

    pub fn record_cache_miss(&self, cache_type: &str) {
        Self::bump(&self.cache_misses_total, cache_type);
    }

    pub fn observe_query_duration(&self, agg_func: &str, duration: Duration) {
        self.query_duration
            .entry(agg_func.to_string())
            .or_insert_with(|| Histogram::new(&DURATION_BUCKETS))
            .observe(duration.as_secs_f64());
    }

    pub fn observe_segment_tree_duration(&self, duration: Duration) {
        self.segment_tree_duration.observe(duration.as_secs_f64());
    }

    pub fn observe_segment_count(&self, segments: usize) {
        self.segment_count.observe(segments as f64);
    }

    /// Consistent-enough snapshot for tests and debugging; individual cells
    /// are read atomically, the set of labels is whatever exists right now.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            query_total: self
                .query_total
                .iter()
                .map(|e| {
                    let (result, agg) = e.key().clone();
                    (format!("{result}/{agg}"), e.value().load(Ordering::Relaxed))
                })
                .collect(),
            errors_total: self
                .errors_total
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            cache_hits_total: self
                .cache_hits_total
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            cache_misses_total: self
                .cache_misses_total
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            query_duration: self
                .query_duration
                .iter()
                .map(|e| (e.key().clone(), e.value().summary()))
                .collect(),
            segment_tree_duration: self.segment_tree_duration.summary(),
            segment_count: self.segment_count.summary(),
        }
    }
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub query_total: HashMap<String, u64>,
    pub errors_total: HashMap<String, u64>,
    pub cache_hits_total: HashMap<String, u64>,
    pub cache_misses_total: HashMap<String, u64>,
    pub query_duration: HashMap<String, HistogramSummary>,
    pub segment_tree_duration: HistogramSummary,
    pub segment_count: HistogramSummary,
}

static REGISTRY: Lazy<PathQueryMetrics> = Lazy::new(PathQueryMetrics::new);

/// The process-wide path-query metric registry.
pub fn path_query_metrics() -> &'static PathQueryMetrics {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label() {
        let metrics = PathQueryMetrics::new();
        metrics.record_query("success", "sum");
        metrics.record_query("success", "sum");
        metrics.record_query("error", "min");
        metrics.record_cache_hit("lca");
        metrics.record_cache_miss("query");
        metrics.record_error("cross_tree");

        let snap = metrics.snapshot();
        assert_eq!(snap.query_total["success/sum"], 2);
        assert_eq!(snap.query_total["error/min"], 1);
        assert_eq!(snap.cache_hits_total["lca"], 1);
        assert_eq!(snap.cache_misses_total["query"], 1);
        assert_eq!(snap.errors_total["cross_tree"], 1);
    }

    #[test]
    fn histogram_buckets_capture_values() {
        let metrics = PathQueryMetrics::new();
        metrics.observe_query_duration("sum", Duration::from_micros(50)); // < 0.1 ms
        metrics.observe_query_duration("sum", Duration::from_millis(10));
        metrics.observe_query_duration("sum", Duration::from_secs(60)); // overflow bucket
        metrics.observe_segment_count(3);

        let snap = metrics.snapshot();
        let hist = &snap.query_duration["sum"];
        assert_eq!(hist.count, 3);
        assert_eq!(hist.buckets[0], 1);
        assert_eq!(*hist.buckets.last().unwrap(), 1);
        assert_eq!(snap.segment_count.count, 1);
        // 3 segments lands in the `<= 4` bucket.
        assert_eq!(snap.segment_count.buckets[2], 1);
    }
}
