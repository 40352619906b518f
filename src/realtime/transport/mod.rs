//! Transports the realtime channel can receive events over
//!
//! The channel tries them in the order returned by [`build_transports`]:
//! WebSocket, then server push (SSE), then the in-process notifier.

pub mod local;
pub mod server_push;
pub mod websocket;

pub use local::{LocalChannelTransport, LocalNotifier};
pub use server_push::{ServerPushTransport, SseDecoder};
pub use websocket::WebSocketTransport;

use crate::core::config::RealtimeConfig;
use crate::core::TransportError;
use async_trait::async_trait;

/// A connection that yields raw text messages
#[async_trait]
pub trait Transport: Send {
    /// Short name for logs and metrics
    fn name(&self) -> &str;

    /// Open the connection
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Send a text message to the server
    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Next message; `None` once the peer has closed
    async fn next_message(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the connection; idempotent
    async fn close(&mut self);
}

/// Build the configured transports in failover order
pub fn build_transports(config: &RealtimeConfig, local: Option<LocalNotifier>) -> Vec<Box<dyn Transport>> {
    let mut transports: Vec<Box<dyn Transport>> = Vec::new();

    if let Some(url) = &config.websocket_url {
        transports.push(Box::new(WebSocketTransport::new(url.clone())));
    }
    if let Some(url) = &config.sse_url {
        transports.push(Box::new(ServerPushTransport::new(url.clone())));
    }
    if config.local_channel {
        if let Some(notifier) = local {
            transports.push(Box::new(LocalChannelTransport::new(notifier)));
        }
    }
    transports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_order() {
        let config = RealtimeConfig {
            websocket_url: Some("ws://127.0.0.1:1/ws".into()),
            sse_url: Some("http://127.0.0.1:1/events".into()),
            local_channel: true,
            ..Default::default()
        };
        let names: Vec<String> = build_transports(&config, Some(LocalNotifier::new(16)))
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["websocket", "server-push", "local"]);
    }

    #[test]
    fn test_local_needs_notifier() {
        let config = RealtimeConfig { websocket_url: None, sse_url: None, local_channel: true, ..Default::default() };
        assert!(build_transports(&config, None).is_empty());
    }
}
