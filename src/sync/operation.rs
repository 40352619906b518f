//! Outbound write operations and their completion handles

use crate::core::clock::to_rfc3339;
use crate::core::{SyncError, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Default retry budget for a single operation
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What a sync operation does to the backend copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    /// New entity
    Create,
    /// Replacement of an existing entity
    Update,
    /// Removal
    Delete,
}

impl SyncKind {
    /// Wire name used in the request body
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Create => "create",
            SyncKind::Update => "update",
            SyncKind::Delete => "delete",
        }
    }
}

/// A buffered write waiting to reach the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Operation identifier
    pub id: String,
    /// Mutation kind
    pub kind: SyncKind,
    /// Target collection
    pub collection: String,
    /// Target entity
    pub entity_id: String,
    /// Entity body (`Null` for deletes)
    pub payload: Value,
    /// Time the operation was created
    pub enqueued_at: Timestamp,
    /// Higher values flush sooner
    pub priority: i32,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Failed attempts allowed before the operation is dropped
    pub max_retries: u32,
}

/// Body of `POST /cache/sync/{collection}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// `create`, `update` or `delete`
    pub operation: SyncKind,
    /// Entity body with its `id`
    pub data: Value,
    /// RFC 3339 enqueue time
    pub timestamp: String,
}

impl SyncOperation {
    /// Create an operation with a fresh id and the default retry budget
    pub fn new(
        kind: SyncKind,
        collection: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            collection: collection.into(),
            entity_id: entity_id.into(),
            payload,
            enqueued_at,
            priority: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Set the flush priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether the retry budget is spent
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Build the wire body.
    ///
    /// Object payloads gain an `id` field when they lack one; other payloads
    /// are wrapped as `{ "id", "value" }`.
    pub fn request_body(&self) -> SyncRequest {
        let data = match (&self.kind, &self.payload) {
            (SyncKind::Delete, _) => json!({ "id": self.entity_id }),
            (_, Value::Object(map)) => {
                let mut map = map.clone();
                map.entry("id").or_insert_with(|| Value::String(self.entity_id.clone()));
                Value::Object(map)
            }
            (_, other) => json!({ "id": self.entity_id, "value": other }),
        };

        SyncRequest {
            operation: self.kind,
            data,
            timestamp: to_rfc3339(self.enqueued_at),
        }
    }
}

/// Final result of a queued operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Backend accepted the write
    Acknowledged,
    /// Retry budget exhausted or the backend rejected the write
    Dropped {
        /// Failed attempts made
        attempts: u32,
        /// Last error seen
        error: SyncError,
    },
    /// Queue went away before the operation settled
    Cancelled,
}

impl SyncOutcome {
    /// Whether the backend has the write
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, SyncOutcome::Acknowledged)
    }
}

/// Resolves once the operation is acknowledged or dropped.
///
/// Awaiting is optional; dropping the handle does not cancel the write.
#[derive(Debug)]
pub struct SyncHandle {
    operation_id: String,
    rx: oneshot::Receiver<SyncOutcome>,
}

impl SyncHandle {
    /// Create a handle and the sender that settles it
    pub fn channel(operation_id: impl Into<String>) -> (oneshot::Sender<SyncOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { operation_id: operation_id.into(), rx })
    }

    /// Id of the tracked operation
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Outcome if already settled
    pub fn try_outcome(&mut self) -> Option<SyncOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(SyncOutcome::Cancelled),
        }
    }
}

impl Future for SyncHandle {
    type Output = SyncOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(SyncOutcome::Cancelled))
    }
}

/// Destination for operations emitted by collection mutations
pub trait SyncSink: Send + Sync {
    /// Accept an operation for eventual delivery
    fn submit(&self, op: SyncOperation) -> SyncHandle;
}
