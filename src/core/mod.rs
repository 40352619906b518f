//! Core system types and foundations
//!
//! Error handling, configuration and the time source shared by every
//! other module.

pub mod clock;
pub mod config;
pub mod error;

// Re-export commonly used items
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::Config;
pub use error::{Error, ParseError, Result, SyncError, TransportError};
