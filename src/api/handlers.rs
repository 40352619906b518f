//! HTTP request handlers for the observability API

use crate::cache::{CacheStatsSnapshot, Health};
use crate::manager::{CollectionManager, MaintenanceReport};
use crate::realtime::{parse_message, ChannelState, LocalNotifier};
use crate::system::metrics::collect_metrics;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub manager: CollectionManager,
    pub started_at: Arc<Instant>,
    /// Publisher for the in-process realtime channel, when enabled
    pub notifier: Option<LocalNotifier>,
}

impl ApiState {
    pub fn new(manager: CollectionManager, notifier: Option<LocalNotifier>) -> Self {
        Self { manager, started_at: Arc::new(Instant::now()), notifier }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub cache_health: Health,
    pub hit_rate: f64,
    pub pending_sync: usize,
    /// `None` when no realtime channel is attached
    pub realtime: Option<ChannelState>,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub collections: Vec<String>,
    pub sync_endpoint: String,
}

pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let stats = state.manager.get_stats();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        cache_health: stats.health,
        hit_rate: stats.hit_rate,
        pending_sync: state.manager.pending_sync(),
        realtime: state.manager.realtime().map(|channel| channel.state()),
    })
}

pub async fn metrics() -> impl IntoResponse {
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], collect_metrics())
}

pub async fn stats(State(state): State<ApiState>) -> Json<CacheStatsSnapshot> {
    Json(state.manager.get_stats())
}

pub async fn system_info(State(state): State<ApiState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        collections: state.manager.collection_names(),
        sync_endpoint: state.manager.config().sync.endpoint.clone(),
    })
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Local channel receivers that got the message
    pub delivered: usize,
}

/// Publish a realtime message on the in-process channel
pub async fn ingest_event(
    State(state): State<ApiState>,
    body: String,
) -> Result<(StatusCode, Json<IngestResponse>), (StatusCode, String)> {
    let Some(notifier) = &state.notifier else {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "local realtime channel disabled".to_string()));
    };
    if let Err(e) = parse_message(&body) {
        return Err((StatusCode::BAD_REQUEST, e.to_string()));
    }

    let delivered = notifier.publish_raw(body);
    Ok((StatusCode::ACCEPTED, Json(IngestResponse { delivered })))
}

/// Run one sweep + quota + stats cycle on demand
pub async fn run_maintenance(State(state): State<ApiState>) -> Json<MaintenanceReport> {
    Json(state.manager.run_maintenance())
}
