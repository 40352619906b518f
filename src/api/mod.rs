//! # API Module
//!
//! Small HTTP surface for observing a running cache:
//!
//! - `GET /health` - Liveness plus cache health, sync backlog and realtime state
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /api/v1/stats` - Full statistics snapshot
//! - `GET /api/v1/info` - Version and configured collections
//! - `POST /api/v1/maintenance` - Run one maintenance cycle now
//! - `POST /api/v1/events` - Publish a realtime message on the in-process channel

pub mod handlers;
pub mod server;

pub use handlers::{ApiState, HealthResponse, InfoResponse, IngestResponse};
pub use server::{create_app, start_server};
