//! Cached documents and per-collection settings

use crate::core::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A cached entity together with its access metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document<T> {
    /// Unique within the owning collection
    pub id: String,
    /// Entity body
    pub payload: T,
    /// First insertion time; preserved across replacements
    pub created_at: Timestamp,
    /// Last read or write
    pub last_access: Timestamp,
    /// Reads and replacements since creation
    pub access_count: u64,
}

impl<T> Document<T> {
    /// Create a fresh document
    pub fn new(id: impl Into<String>, payload: T, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            payload,
            created_at: now,
            last_access: now,
            access_count: 0,
        }
    }

    /// Record an access at `now`
    pub(crate) fn touch(&mut self, now: Timestamp) {
        self.access_count += 1;
        self.last_access = now.max(self.created_at);
    }

    /// Age of the document at `now`
    pub fn age(&self, now: Timestamp) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// Whether the document is past its time-to-live (`ttl_ms == 0` never expires)
    pub fn is_expired(&self, ttl_ms: u64, now: Timestamp) -> bool {
        ttl_ms > 0 && self.age(now) > ttl_ms
    }

    /// Convert the payload, keeping the metadata
    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> Document<U> {
        Document {
            id: self.id,
            payload: f(self.payload),
            created_at: self.created_at,
            last_access: self.last_access,
            access_count: self.access_count,
        }
    }
}

/// Order in which documents are evicted when a collection is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Least recently used first
    #[default]
    Lru,
    /// Least frequently used first
    Lfu,
    /// Oldest insertion first
    Fifo,
}

/// Settings fixed at collection creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Maximum document age in milliseconds (0 = no expiry)
    pub ttl_ms: u64,
    /// Maximum live documents (0 = unbounded)
    pub max_entries: usize,
    /// Victim selection when `max_entries` is reached
    pub eviction_strategy: EvictionStrategy,
    /// How often this collection's writes should reach the backend
    pub sync_interval_ms: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 0,
            max_entries: 0,
            eviction_strategy: EvictionStrategy::Lru,
            sync_interval_ms: 30_000,
        }
    }
}

/// Where a mutation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOrigin {
    /// Application write; synced to the backend with the given priority
    Local {
        /// Higher values flush sooner
        priority: i32,
    },
    /// Server-originated change (realtime event or fetched value); never synced back
    Remote,
}

impl MutationOrigin {
    /// Local write with default priority
    pub const fn local() -> Self {
        MutationOrigin::Local { priority: 0 }
    }
}

/// Requirements on anything stored in a collection
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Blanket implementation for any type that meets the requirements
impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let doc = Document::new("e1", 1u32, 1_000);
        assert!(!doc.is_expired(0, u64::MAX));
        assert!(!doc.is_expired(500, 1_500));
        assert!(doc.is_expired(500, 1_501));
    }

    #[test]
    fn test_touch_never_precedes_creation() {
        let mut doc = Document::new("e1", (), 1_000);
        doc.touch(900);
        assert_eq!(doc.last_access, 1_000);
        assert_eq!(doc.access_count, 1);
        doc.touch(2_000);
        assert_eq!(doc.last_access, 2_000);
    }

    #[test]
    fn test_strategy_serde() {
        let cfg: CollectionConfig = serde_json::from_str(r#"{"ttl_ms":10,"eviction_strategy":"fifo"}"#).unwrap();
        assert_eq!(cfg.eviction_strategy, EvictionStrategy::Fifo);
        assert_eq!(cfg.sync_interval_ms, 30_000);
    }
}
