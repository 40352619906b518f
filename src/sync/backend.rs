//! Backend seam for outbound writes and its HTTP implementation

use crate::core::{Error, Result, SyncError};
use crate::sync::operation::SyncOperation;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace};

/// Something that can persist one sync operation
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Deliver `op`; `Ok` means the backend acknowledged it
    async fn send(&self, op: &SyncOperation) -> std::result::Result<(), SyncError>;
}

/// Posts operations to `{endpoint}/cache/sync/{collection}`
#[derive(Clone)]
pub struct HttpSyncBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSyncBackend {
    /// Build a client with a per-request timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are sent to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url_for(&self, collection: &str) -> String {
        format!("{}/cache/sync/{}", self.endpoint, collection)
    }
}

#[async_trait]
impl SyncBackend for HttpSyncBackend {
    async fn send(&self, op: &SyncOperation) -> std::result::Result<(), SyncError> {
        let url = self.url_for(&op.collection);
        trace!(%url, op_id = %op.id, kind = op.kind.as_str(), "sending sync operation");

        let response = self
            .client
            .post(&url)
            .json(&op.request_body())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::Timeout
                } else {
                    SyncError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(op_id = %op.id, status = status.as_u16(), "sync operation acknowledged");
            Ok(())
        } else {
            Err(SyncError::Status { status: status.as_u16() })
        }
    }
}
