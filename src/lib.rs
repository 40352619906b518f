//! Evidence Sync - client-side cache and real-time sync engine for case data
//!
//! Keeps typed, TTL-bound, indexed in-memory collections of case, evidence,
//! analysis and embedding entities. Local writes are pushed behind to a
//! backend through a retrying sync queue; server-pushed changes arrive over a
//! cascade of realtime transports with failover and backoff. A global byte
//! budget bounds the memory all collections use together.
//!
//! ```no_run
//! use evidence_sync::{CollectionManager, Config};
//! use serde_json::json;
//!
//! # async fn run() -> evidence_sync::Result<()> {
//! let manager = CollectionManager::builder(Config::load()?).build()?;
//! manager.start().await;
//!
//! let receipt = manager.write("evidence", "ev-1", json!({ "title": "Exhibit A" }))?;
//! let doc = manager.read("evidence", "ev-1")?;
//! assert!(doc.is_some());
//!
//! // Resolves once the backend has the write (or the queue gives up).
//! let outcome = receipt.sync.await;
//! manager.shutdown().await;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

// Core foundational modules
pub mod core;

// Main functional modules
pub mod api;
pub mod cache;
pub mod manager;
pub mod realtime;
pub mod sync;
pub mod system;

// Re-export commonly used items for convenience
pub use crate::core::{Config, Error, Result};
pub use cache::{CacheStatsSnapshot, Document, MutationOrigin, QueryPlan};
pub use manager::{CollectionManager, MaintenanceReport, WriteOptions, WriteReceipt};
pub use realtime::{RealtimeChannel, RealtimeEvent};
pub use sync::{SyncHandle, SyncOutcome};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize logging and the metrics registry
pub fn init(logging: &crate::core::config::LoggingConfig) -> Result<()> {
    system::init_logging(logging)?;

    tracing::info!("Initializing {} v{}", NAME, VERSION);

    system::metrics::init_registry();

    Ok(())
}
