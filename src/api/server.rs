//! HTTP server for the observability API

use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::handlers::{self, ApiState};
use crate::core::Result;
use crate::manager::CollectionManager;
use crate::realtime::LocalNotifier;

/// Creates the router with all routes and middleware
pub fn create_app(manager: CollectionManager, notifier: Option<LocalNotifier>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/stats", get(handlers::stats))
        .route("/api/v1/info", get(handlers::system_info))
        .route("/api/v1/maintenance", post(handlers::run_maintenance))
        .route("/api/v1/events", post(handlers::ingest_event))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(ApiState::new(manager, notifier))
}

/// Serve the API until `shutdown` resolves
pub async fn start_server<F>(
    addr: SocketAddr,
    manager: CollectionManager,
    notifier: Option<LocalNotifier>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_app(manager, notifier);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Observability server listening on http://{}", addr);
    tracing::info!("Health check available at http://{}/health", addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::SyncError;
    use crate::sync::{SyncBackend, SyncOperation};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct AcceptAll;

    #[async_trait]
    impl SyncBackend for AcceptAll {
        async fn send(&self, _op: &SyncOperation) -> std::result::Result<(), SyncError> {
            Ok(())
        }
    }

    fn manager() -> CollectionManager {
        CollectionManager::builder(Config::default()).backend(Arc::new(AcceptAll)).build().unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let manager = manager();
        manager.write("evidence", "ev-1", json!({"title": "A"})).unwrap();
        manager.read("evidence", "ev-1").unwrap();

        let (status, body) = get_json(create_app(manager, None), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["cacheHealth"], "excellent");
        assert_eq!(body["pendingSync"], 1);
        assert_eq!(body["realtime"], Value::Null);
    }

    #[tokio::test]
    async fn test_stats_and_info() {
        let manager = manager();
        let (_, stats) = get_json(create_app(manager.clone(), None), "/api/v1/stats").await;
        assert_eq!(stats["hits"], 0);
        assert!(stats["collections"]["evidence"].is_object());

        let (_, info) = get_json(create_app(manager, None), "/api/v1/info").await;
        assert_eq!(info["collections"], json!(["analysis", "cases", "embeddings", "evidence"]));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        crate::system::metrics::init_registry();
        let response = create_app(manager(), None)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("evs_"));
    }

    #[tokio::test]
    async fn test_event_ingest_reaches_attached_channel() {
        use crate::realtime::transport::{LocalChannelTransport, Transport};
        use crate::realtime::RealtimeChannel;

        let manager = manager();
        let notifier = LocalNotifier::new(16);
        let transports: Vec<Box<dyn Transport>> = vec![Box::new(LocalChannelTransport::new(notifier.clone()))];
        let channel = Arc::new(RealtimeChannel::new(transports, manager.config().realtime.clone()));
        manager.attach_realtime(channel.clone());
        channel.connect().await;
        let mut state = channel.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();

        let app = create_app(manager.clone(), Some(notifier));
        let body = r#"{"type":"update","data":{"type":"entity_created","collection":"cases","entityId":"c-1","data":{"status":"open"}}}"#;
        let request = Request::builder().method("POST").uri("/api/v1/events").body(Body::from(body)).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.read("cases", "c-1").unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let bad = Request::builder().method("POST").uri("/api/v1/events").body(Body::from("{nope")).unwrap();
        assert_eq!(app.oneshot(bad).await.unwrap().status(), StatusCode::BAD_REQUEST);
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn test_event_ingest_without_local_channel() {
        let request = Request::builder().method("POST").uri("/api/v1/events").body(Body::from("{}")).unwrap();
        let response = create_app(manager(), None).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_maintenance_endpoint() {
        let request = Request::builder().method("POST").uri("/api/v1/maintenance").body(Body::empty()).unwrap();
        let response = create_app(manager(), None).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
