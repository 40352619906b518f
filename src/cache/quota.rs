//! Global byte-budget enforcement.
//!
//! Memory accounting is approximate (serialized-size estimates), so the
//! enforcer is a coarse, LRU-biased sweep: while the total is over budget it
//! evicts the least recently accessed tenth of the largest collection and
//! recomputes. It never fails and never waits.

use crate::cache::collection::DocumentCollection;
use crate::cache::document::Payload;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Share of a collection evicted per pass, as a divisor (10 = 10%)
pub const EVICTION_FRACTION_DIVISOR: usize = 10;

/// A collection the enforcer can shrink
pub trait Evictable {
    /// Collection name
    fn name(&self) -> &str;
    /// Serialized-size estimate of all documents
    fn approx_bytes(&self) -> usize;
    /// Stored documents
    fn document_count(&self) -> usize;
    /// Evict up to `n` least recently accessed documents; returns how many went
    fn evict_least_recent(&mut self, n: usize) -> usize;
}

impl<T: Payload> Evictable for DocumentCollection<T> {
    fn name(&self) -> &str {
        DocumentCollection::name(self)
    }

    fn approx_bytes(&self) -> usize {
        DocumentCollection::approx_bytes(self)
    }

    fn document_count(&self) -> usize {
        self.len()
    }

    fn evict_least_recent(&mut self, n: usize) -> usize {
        DocumentCollection::evict_least_recent(self, n)
    }
}

/// Outcome of one enforcement run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    /// Total estimate before enforcement
    pub bytes_before: usize,
    /// Total estimate after enforcement
    pub bytes_after: usize,
    /// Evicted documents per collection
    pub evictions: BTreeMap<String, usize>,
    /// Whether the total ended at or under the budget
    pub within_budget: bool,
}

impl QuotaReport {
    /// Evicted documents across all collections
    pub fn total_evicted(&self) -> usize {
        self.evictions.values().sum()
    }
}

/// Keeps the aggregate footprint of all collections under a byte budget
#[derive(Debug, Default, Clone, Copy)]
pub struct QuotaEnforcer;

impl QuotaEnforcer {
    /// Create an enforcer
    pub fn new() -> Self {
        Self
    }

    /// Evict until the total is at most `budget_bytes` or nothing is left to evict
    pub fn enforce(&self, collections: &mut [&mut dyn Evictable], budget_bytes: usize) -> QuotaReport {
        let mut report = QuotaReport {
            bytes_before: total_bytes(collections),
            ..Default::default()
        };
        let mut current = report.bytes_before;

        while current > budget_bytes {
            collections.sort_by(|a, b| b.approx_bytes().cmp(&a.approx_bytes()));

            let Some(target) = collections.iter_mut().find(|c| c.document_count() > 0) else {
                debug!(current, budget_bytes, "over budget with nothing left to evict");
                break;
            };

            let batch = (target.document_count() / EVICTION_FRACTION_DIVISOR).max(1);
            let evicted = target.evict_least_recent(batch);
            if evicted == 0 {
                break;
            }
            *report.evictions.entry(target.name().to_string()).or_default() += evicted;

            current = total_bytes(collections);
        }

        report.bytes_after = current;
        report.within_budget = current <= budget_bytes;

        if report.total_evicted() > 0 {
            info!(
                evicted = report.total_evicted(),
                bytes_before = report.bytes_before,
                bytes_after = report.bytes_after,
                budget_bytes,
                "quota enforcement evicted documents"
            );
        }
        report
    }
}

fn total_bytes(collections: &[&mut dyn Evictable]) -> usize {
    collections.iter().map(|c| c.approx_bytes()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::document::{CollectionConfig, MutationOrigin};
    use crate::core::ManualClock;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn filled(name: &str, count: usize, payload_len: usize, clock: &Arc<ManualClock>) -> DocumentCollection<String> {
        let mut col = DocumentCollection::new(name, CollectionConfig::default(), clock.clone());
        for i in 0..count {
            col.upsert(format!("{}-{:04}", name, i), "x".repeat(payload_len), MutationOrigin::Remote)
                .unwrap();
            clock.advance(1);
        }
        col
    }

    #[test]
    fn test_under_budget_is_noop() {
        let clock = Arc::new(ManualClock::new(0));
        let mut col = filled("evidence", 10, 100, &clock);
        let report = QuotaEnforcer::new().enforce(&mut [&mut col], usize::MAX);
        assert_eq!(report.total_evicted(), 0);
        assert!(report.within_budget);
        assert_eq!(col.len(), 10);
    }

    #[test]
    fn test_thousand_kilobyte_documents_under_500_kib() {
        let clock = Arc::new(ManualClock::new(0));
        let mut col = filled("evidence", 1000, 1024, &clock);

        // Touch everything except ten documents so those become least recently used.
        let cold: Vec<String> = (0..10).map(|i| format!("evidence-{:04}", i * 97)).collect();
        for i in 0..1000 {
            let id = format!("evidence-{:04}", i);
            if !cold.contains(&id) {
                col.get(&id);
            }
            clock.advance(1);
        }

        let budget = 500 * 1024;
        let report = QuotaEnforcer::new().enforce(&mut [&mut col], budget);

        assert!(report.within_budget);
        assert!(col.approx_bytes() <= budget);
        assert!(col.len() < 1000);
        assert_eq!(report.evictions["evidence"], 1000 - col.len());
        for id in &cold {
            assert!(col.peek(id).is_none(), "{} should have been evicted first", id);
        }
    }

    #[test]
    fn test_largest_collection_shrinks_first() {
        let clock = Arc::new(ManualClock::new(0));
        let mut big = filled("embeddings", 100, 1000, &clock);
        let mut small = filled("cases", 10, 100, &clock);
        let small_bytes = small.approx_bytes();
        let budget = big.approx_bytes() / 2 + small_bytes;

        let report = QuotaEnforcer::new().enforce(&mut [&mut small, &mut big], budget);
        assert!(report.within_budget);
        assert_eq!(small.len(), 10);
        assert!(big.len() < 100);
        assert!(!report.evictions.contains_key("cases"));
    }

    #[test]
    fn test_budget_below_any_single_document() {
        let clock = Arc::new(ManualClock::new(0));
        let mut col = filled("evidence", 5, 100, &clock);
        let report = QuotaEnforcer::new().enforce(&mut [&mut col], 1);
        assert_eq!(col.len(), 0);
        assert_eq!(report.bytes_after, 0);
        assert!(report.within_budget);
    }

    proptest! {
        #[test]
        fn enforced_total_respects_budget(
            sizes in proptest::collection::vec((1usize..40, 1usize..2_000), 1..4),
            budget in 0usize..100_000,
        ) {
            let clock = Arc::new(ManualClock::new(0));
            let mut cols: Vec<DocumentCollection<String>> = sizes
                .iter()
                .enumerate()
                .map(|(i, (count, len))| filled(&format!("c{}", i), *count, *len, &clock))
                .collect();

            let mut refs: Vec<&mut dyn Evictable> = cols.iter_mut().map(|c| c as &mut dyn Evictable).collect();
            let report = QuotaEnforcer::new().enforce(&mut refs, budget);

            let total: usize = cols.iter().map(|c| c.approx_bytes()).sum();
            let remaining: usize = cols.iter().map(|c| c.len()).sum();
            prop_assert_eq!(total, report.bytes_after);
            prop_assert!(total <= budget || remaining == 0);
        }
    }
}
