//! Metrics collection and monitoring for the evidence cache
//!
//! Prometheus counters and gauges registered once in the default registry.
//! The cache keeps its own exact counters in `CacheStatsAggregator`; these
//! mirror them for scraping.

use crate::core::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::time::Instant;
use tracing::error;

/// Cache read/eviction metrics
pub struct CacheMetrics {
    /// Reads that found a live document, by collection
    pub hits: IntCounterVec,
    /// Reads that found nothing, by collection
    pub misses: IntCounterVec,
    /// Documents evicted by TTL, capacity or quota, by collection
    pub evictions: IntCounterVec,
    /// Approximate bytes held, by collection
    pub bytes: IntGaugeVec,
    /// Stored documents, by collection
    pub documents: IntGaugeVec,
}

/// Write-behind queue metrics
pub struct SyncMetrics {
    /// Operations acknowledged by the backend
    pub completed: IntCounter,
    /// Operations dropped after exhausting retries or being rejected
    pub dropped: IntCounter,
    /// Individual failed backend attempts
    pub failed_attempts: IntCounter,
    /// Operations waiting in the queue
    pub queue_depth: IntGauge,
    /// Backend request latency in seconds
    pub request_duration: Histogram,
}

/// Realtime channel metrics
pub struct RealtimeMetrics {
    /// Transport connect attempts, by transport
    pub connect_attempts: IntCounterVec,
    /// Backoff rounds entered after every transport failed
    pub reconnects: IntCounter,
    /// Parsed events dispatched to handlers
    pub events_received: IntCounter,
    /// Messages dropped as malformed
    pub malformed_messages: IntCounter,
}

/// Centralized metrics collection for all components
pub struct Metrics {
    /// Cache metrics
    pub cache: CacheMetrics,
    /// Sync queue metrics
    pub sync: SyncMetrics,
    /// Realtime channel metrics
    pub realtime: RealtimeMetrics,
}

static INSTANCE: Lazy<Option<Metrics>> = Lazy::new(|| match Metrics::new() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        error!("Failed to register metrics: {}", e);
        None
    }
});

impl Metrics {
    /// Create and register a metrics instance
    fn new() -> Result<Self> {
        Ok(Self {
            cache: CacheMetrics::new()?,
            sync: SyncMetrics::new()?,
            realtime: RealtimeMetrics::new()?,
        })
    }

    /// The global metrics instance, if registration succeeded
    pub fn global() -> Option<&'static Metrics> {
        INSTANCE.as_ref()
    }
}

impl CacheMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            hits: register_int_counter_vec!("evs_cache_hits_total", "Total cache hits", &["collection"])?,
            misses: register_int_counter_vec!("evs_cache_misses_total", "Total cache misses", &["collection"])?,
            evictions: register_int_counter_vec!(
                "evs_cache_evictions_total",
                "Total documents evicted",
                &["collection"]
            )?,
            bytes: register_int_gauge_vec!(
                "evs_cache_bytes",
                "Approximate bytes held per collection",
                &["collection"]
            )?,
            documents: register_int_gauge_vec!(
                "evs_cache_documents",
                "Documents held per collection",
                &["collection"]
            )?,
        })
    }
}

impl SyncMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            completed: register_int_counter!(
                "evs_sync_operations_completed_total",
                "Sync operations acknowledged by the backend"
            )?,
            dropped: register_int_counter!(
                "evs_sync_operations_dropped_total",
                "Sync operations dropped after retries or rejection"
            )?,
            failed_attempts: register_int_counter!(
                "evs_sync_failed_attempts_total",
                "Failed backend write attempts"
            )?,
            queue_depth: register_int_gauge!("evs_sync_queue_depth", "Operations waiting in the sync queue")?,
            request_duration: register_histogram!(
                "evs_sync_request_duration_seconds",
                "Duration of backend sync requests in seconds",
                vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
            )?,
        })
    }
}

impl RealtimeMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            connect_attempts: register_int_counter_vec!(
                "evs_realtime_connect_attempts_total",
                "Transport connect attempts",
                &["transport"]
            )?,
            reconnects: register_int_counter!(
                "evs_realtime_reconnect_rounds_total",
                "Backoff rounds entered by the realtime channel"
            )?,
            events_received: register_int_counter!(
                "evs_realtime_events_total",
                "Realtime events dispatched"
            )?,
            malformed_messages: register_int_counter!(
                "evs_realtime_malformed_total",
                "Realtime messages dropped as malformed"
            )?,
        })
    }
}

/// Timer for measuring operation duration with automatic histogram recording
pub struct Timer {
    start: Instant,
    histogram: Option<Histogram>,
}

impl Timer {
    /// Start a new timer
    pub fn start(histogram: Option<Histogram>) -> Self {
        Self { start: Instant::now(), histogram }
    }

    /// Record the elapsed time and consume the timer
    pub fn finish(self) {
        if let Some(histogram) = self.histogram {
            histogram.observe(self.start.elapsed().as_secs_f64());
        }
    }
}

/// Initialize the metrics registry by creating the global metrics instance
pub fn init_registry() {
    let _ = Metrics::global();
}

/// Collect and return all metrics as a Prometheus-formatted string
pub fn collect_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
