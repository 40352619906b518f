//! In-memory cache layer
//!
//! Typed document collections, query plans, global quota enforcement and
//! statistics aggregation.

pub mod collection;
pub mod document;
pub mod query;
pub mod quota;
pub mod stats;

pub use collection::{CollectionStats, DocumentCollection, Lookup, RemoveOutcome, UpsertOutcome};
pub use document::{CollectionConfig, Document, EvictionStrategy, MutationOrigin, Payload};
pub use query::{QueryPlan, QueryPresets};
pub use quota::{Evictable, QuotaEnforcer, QuotaReport};
pub use stats::{CacheStatsAggregator, CacheStatsSnapshot, CollectionSnapshot, Health};
