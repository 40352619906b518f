//! Write-behind synchronization to the backend
//!
//! Local mutations become [`SyncOperation`]s, are buffered by the
//! [`SyncQueue`] and flushed in batches through a [`SyncBackend`].

pub mod backend;
pub mod operation;
pub mod queue;

pub use backend::{HttpSyncBackend, SyncBackend};
pub use operation::{SyncHandle, SyncKind, SyncOperation, SyncOutcome, SyncRequest, SyncSink, DEFAULT_MAX_RETRIES};
pub use queue::{FlushReport, SyncQueue, SyncQueueConfig};
