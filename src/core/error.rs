//! Error types and handling for the evidence cache
//!
//! This module defines all error types used throughout the system. Most
//! failure paths in the cache degrade to logging plus a bounded retry or a
//! drop; these types describe what went wrong when that happens.

use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the evidence cache
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend write failures
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Realtime transport failures
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed realtime payloads
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Payload (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Errors returned by a sync backend for a single operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Backend answered with a non-success status
    #[error("Backend returned HTTP {status}")]
    Status {
        /// HTTP status code
        status: u16,
    },

    /// Request never produced a response
    #[error("Network failure: {0}")]
    Network(String),

    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,

    /// Operation could not be encoded for the backend
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Realtime transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection failed or lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connect attempt did not finish in time
    #[error("Connect timed out")]
    Timeout,

    /// Peer closed the stream
    #[error("Transport closed")]
    Closed,

    /// Protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation not valid in the current transport state
    #[error("Transport not connected")]
    NotConnected,
}

/// Realtime message parsing errors
#[derive(Error, Debug)]
pub enum ParseError {
    /// Payload is not valid JSON
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field is absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// A field has the wrong shape
    #[error("Invalid field {field}: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Sync(e) => e.is_retryable(),
            Error::Transport(e) => !matches!(e, TransportError::Protocol(_)),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Check if this is a client error (4xx equivalent)
    pub fn is_client_error(&self) -> bool {
        match self {
            Error::Sync(e) => e.is_client_error(),
            Error::NotFound(_) | Error::InvalidInput(_) | Error::Serialization(_) | Error::Parse(_) => true,
            _ => false,
        }
    }
}

impl SyncError {
    /// Check if this is a client error (4xx equivalent)
    pub fn is_client_error(&self) -> bool {
        match self {
            SyncError::Status { status } => (400..500).contains(status),
            SyncError::InvalidOperation(_) => true,
            _ => false,
        }
    }

    /// Check if another attempt could succeed.
    ///
    /// Request timeout (408) and rate limiting (429) are client-class statuses
    /// that are still worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Status { status } => !self.is_client_error() || *status == 408 || *status == 429,
            SyncError::Network(_) | SyncError::Timeout => true,
            SyncError::InvalidOperation(_) => false,
        }
    }
}
