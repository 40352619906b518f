//! Hit/miss/eviction accounting across collections.
//!
//! Counters are atomics so reads and writes from many tasks never contend on a
//! lock; per-collection counters live in a `DashMap`. Every counter is also
//! mirrored into the global Prometheus registry.

use crate::cache::collection::CollectionStats;
use crate::core::Timestamp;
use crate::system::metrics::Metrics;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Coarse rating derived from the hit rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Hit rate above 0.8
    Excellent,
    /// Hit rate above 0.6
    Good,
    /// Hit rate above 0.4
    Fair,
    /// Anything lower
    Poor,
}

impl Health {
    /// Rate a hit rate in `[0, 1]`
    pub fn from_hit_rate(rate: f64) -> Self {
        if rate > 0.8 {
            Health::Excellent
        } else if rate > 0.6 {
            Health::Good
        } else if rate > 0.4 {
            Health::Fair
        } else {
            Health::Poor
        }
    }
}

/// `hits / (hits + misses)`, or 0 with no accesses
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

#[derive(Default)]
struct CollectionCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    footprint: parking_lot::Mutex<CollectionStats>,
}

/// Point-in-time view of one collection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSnapshot {
    /// Hits against this collection
    pub hits: u64,
    /// Misses against this collection
    pub misses: u64,
    /// Documents evicted from this collection
    pub evictions: u64,
    /// Size and recency as last reported
    #[serde(flatten)]
    pub footprint: CollectionStats,
}

/// Point-in-time view of all cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsSnapshot {
    /// Reads that found a live document
    pub hits: u64,
    /// Reads that found nothing
    pub misses: u64,
    /// Documents removed by TTL, capacity or quota
    pub evictions: u64,
    /// Operations acknowledged by the backend
    pub sync_operations_completed: u64,
    /// Operations given up on
    pub sync_operations_dropped: u64,
    /// Time of the most recent acknowledgement
    pub last_sync_at: Option<Timestamp>,
    /// Derived hit rate
    pub hit_rate: f64,
    /// Rating of the hit rate
    pub health: Health,
    /// Per-collection breakdown, keyed by name
    pub collections: BTreeMap<String, CollectionSnapshot>,
}

/// Aggregates cache and sync counters
#[derive(Default)]
pub struct CacheStatsAggregator {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sync_completed: AtomicU64,
    sync_dropped: AtomicU64,
    // 0 means never synced
    last_sync_at: AtomicU64,
    per_collection: DashMap<String, CollectionCounters>,
}

impl CacheStatsAggregator {
    /// Create an aggregator with every counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a read that found a live document in `collection`
    pub fn record_hit(&self, collection: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.counters(collection, |c| c.hits.fetch_add(1, Ordering::Relaxed));
        if let Some(metrics) = Metrics::global() {
            metrics.cache.hits.with_label_values(&[collection]).inc();
        }
    }

    /// Count a read that found nothing in `collection`
    pub fn record_miss(&self, collection: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.counters(collection, |c| c.misses.fetch_add(1, Ordering::Relaxed));
        if let Some(metrics) = Metrics::global() {
            metrics.cache.misses.with_label_values(&[collection]).inc();
        }
    }

    /// Add `count` evictions; zero is ignored
    pub fn record_eviction(&self, collection: &str, count: usize) {
        if count == 0 {
            return;
        }
        let count = count as u64;
        self.evictions.fetch_add(count, Ordering::Relaxed);
        self.counters(collection, |c| c.evictions.fetch_add(count, Ordering::Relaxed));
        if let Some(metrics) = Metrics::global() {
            metrics.cache.evictions.with_label_values(&[collection]).inc_by(count);
        }
    }

    /// Count an acknowledged operation and stamp the sync time
    pub fn record_sync_completed(&self, now: Timestamp) {
        self.sync_completed.fetch_add(1, Ordering::Relaxed);
        self.last_sync_at.fetch_max(now.max(1), Ordering::Relaxed);
        if let Some(metrics) = Metrics::global() {
            metrics.sync.completed.inc();
        }
    }

    /// Count an operation the queue gave up on
    pub fn record_sync_dropped(&self) {
        self.sync_dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = Metrics::global() {
            metrics.sync.dropped.inc();
        }
    }

    /// Replace the last reported footprint of a collection
    pub fn update_footprint(&self, collection: &str, footprint: CollectionStats) {
        self.counters(collection, |c| *c.footprint.lock() = footprint);
        if let Some(metrics) = Metrics::global() {
            metrics.cache.bytes.with_label_values(&[collection]).set(footprint.approx_bytes as i64);
            metrics.cache.documents.with_label_values(&[collection]).set(footprint.document_count as i64);
        }
    }

    /// Acknowledged operations so far
    pub fn sync_completed(&self) -> u64 {
        self.sync_completed.load(Ordering::Relaxed)
    }

    /// Dropped operations so far
    pub fn sync_dropped(&self) -> u64 {
        self.sync_dropped.load(Ordering::Relaxed)
    }

    /// Copy every counter into a serializable snapshot
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let rate = hit_rate(hits, misses);
        let last_sync_at = match self.last_sync_at.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        };

        let collections = self
            .per_collection
            .iter()
            .map(|entry| {
                let c = entry.value();
                let snapshot = CollectionSnapshot {
                    hits: c.hits.load(Ordering::Relaxed),
                    misses: c.misses.load(Ordering::Relaxed),
                    evictions: c.evictions.load(Ordering::Relaxed),
                    footprint: *c.footprint.lock(),
                };
                (entry.key().clone(), snapshot)
            })
            .collect();

        CacheStatsSnapshot {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            sync_operations_completed: self.sync_completed(),
            sync_operations_dropped: self.sync_dropped(),
            last_sync_at,
            hit_rate: rate,
            health: Health::from_hit_rate(rate),
            collections,
        }
    }

    fn counters<R>(&self, collection: &str, f: impl FnOnce(&CollectionCounters) -> R) -> R {
        if let Some(existing) = self.per_collection.get(collection) {
            return f(existing.value());
        }
        let entry = self.per_collection.entry(collection.to_string()).or_default();
        f(entry.value())
    }
}
