//! Metrics collection for the model cache
//!
//! Counters are plain atomics so the download workers can update them without
//! locking. A snapshot can be rendered in Prometheus text format.

use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector shared by every request of a cache
#[derive(Debug, Default)]
pub struct CacheMetrics {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    purges: AtomicU64,
    bytes_from_network: AtomicU64,
    bytes_from_cache: AtomicU64,
    chunks_stored: AtomicU64,
    store_errors: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub purges: u64,
    pub bytes_from_network: u64,
    pub bytes_from_cache: u64,
    pub chunks_stored: u64,
    pub store_errors: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A complete manifest was replayed from the store
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// The object had to come from the network
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A corrupted or superseded entry was purged
    pub fn record_purge(&self) {
        self.purges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_from_network(&self, bytes: u64) {
        self.bytes_from_network.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_from_cache(&self, bytes: u64) {
        self.bytes_from_cache.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_chunk_stored(&self) {
        self.chunks_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are loaded independently, so a snapshot taken during a download
    /// may not be perfectly consistent across counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            purges: self.purges.load(Ordering::Relaxed),
            bytes_from_network: self.bytes_from_network.load(Ordering::Relaxed),
            bytes_from_cache: self.bytes_from_cache.load(Ordering::Relaxed),
            chunks_stored: self.chunks_stored.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Render the current counters in Prometheus text exposition format
    pub fn render_prometheus(&self) -> Result<String, prometheus::Error> {
        self.snapshot().render_prometheus()
    }
}

impl MetricsSnapshot {
    /// Cache hit rate as a percentage (0.0 to 100.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }

    fn render_prometheus(&self) -> Result<String, prometheus::Error> {
        let registry = Registry::new();
        let values = [
            ("model_cache_requests_total", "Object requests started", self.requests),
            ("model_cache_hits_total", "Requests served by cache replay", self.cache_hits),
            ("model_cache_misses_total", "Requests served from the network", self.cache_misses),
            ("model_cache_purges_total", "Corrupted or stale entries purged", self.purges),
            ("model_cache_network_bytes_total", "Bytes downloaded", self.bytes_from_network),
            ("model_cache_cache_bytes_total", "Bytes replayed from the store", self.bytes_from_cache),
            ("model_cache_chunks_stored_total", "Chunks written to the store", self.chunks_stored),
            ("model_cache_store_errors_total", "Store operations that failed", self.store_errors),
            ("model_cache_completed_total", "Requests that completed", self.completed),
            ("model_cache_failed_total", "Requests that failed", self.failed),
            ("model_cache_cancelled_total", "Requests cancelled by the consumer", self.cancelled),
        ];

        for (name, help, value) in values {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.record_request();
        metrics.record_cache_miss();
        metrics.record_bytes_from_network(1024);
        metrics.record_chunk_stored();
        metrics.record_completed();

        let stats = metrics.snapshot();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.bytes_from_network, 1024);
        assert_eq!(stats.chunks_stored, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.snapshot().cache_hit_rate(), 0.0);

        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        assert_eq!(metrics.snapshot().cache_hit_rate(), 75.0);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(CacheMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_bytes_from_cache(10);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.snapshot().bytes_from_cache, 8000);
    }

    #[test]
    fn test_render_prometheus() {
        let metrics = CacheMetrics::new();
        metrics.record_cache_hit();
        metrics.record_store_error();

        let text = metrics.render_prometheus().unwrap();
        assert!(text.contains("model_cache_hits_total 1"));
        assert!(text.contains("model_cache_store_errors_total 1"));
        assert!(text.contains("# HELP model_cache_requests_total"));
        assert!(text.contains("# TYPE model_cache_hits_total counter"));
        assert!(!text.contains("gauge"));
    }
}
