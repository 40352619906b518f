//! Server push transport over Server-Sent Events.
//!
//! The stream is a long-lived `GET` with `Accept: text/event-stream`; each
//! event's `data:` lines form one message. Outbound messages (the subscribe
//! request) are `POST`ed to the same URL.

use super::Transport;
use crate::core::TransportError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::VecDeque;
use tracing::debug;

/// Incremental `text/event-stream` decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    ready: VecDeque<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; complete events become available from [`Self::next_event`]
    pub fn push(&mut self, chunk: &[u8]) {
        // Events end on a blank line; CR bytes never occur inside UTF-8 sequences.
        self.buffer.extend(chunk.iter().copied().filter(|&b| b != b'\r'));

        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(data) = Self::event_data(&String::from_utf8_lossy(&block)) {
                self.ready.push_back(data);
            }
        }
    }

    /// Next complete event payload
    pub fn next_event(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    fn event_data(block: &str) -> Option<String> {
        let lines: Vec<&str> = block
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|value| value.strip_prefix(' ').unwrap_or(value))
            .collect();

        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

/// SSE connection to the realtime endpoint
pub struct ServerPushTransport {
    url: String,
    client: reqwest::Client,
    body: Option<BoxStream<'static, reqwest::Result<Vec<u8>>>>,
    decoder: SseDecoder,
}

impl ServerPushTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            body: None,
            decoder: SseDecoder::new(),
        }
    }
}

#[async_trait]
impl Transport for ServerPushTransport {
    fn name(&self) -> &str {
        "server-push"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Connection(format!("event stream returned HTTP {}", status)));
        }

        debug!(url = %self.url, "event stream connected");
        self.decoder = SseDecoder::new();
        self.body = Some(response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed());
        Ok(())
    }

    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if self.body.is_none() {
            return Err(TransportError::NotConnected);
        }

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message.to_string())
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Protocol(format!("send returned HTTP {}", response.status())))
        }
    }

    async fn next_message(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(event) = self.decoder.next_event() {
                return Some(Ok(event));
            }

            let body = self.body.as_mut()?;
            match body.next().await? {
                Ok(chunk) => self.decoder.push(&chunk),
                Err(e) => return Some(Err(TransportError::Connection(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        self.body = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header;
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_decoder_splits_events_across_chunks() {
        let mut decoder = SseDecoder::new();
        decoder.push(b": comment\n\ndata: {\"type\":");
        assert_eq!(decoder.next_event(), None);

        decoder.push(b"\"ping\"}\r\n\r\nevent: update\ndata: line one\ndata: line two\n\n");
        assert_eq!(decoder.next_event(), Some("{\"type\":\"ping\"}".to_string()));
        assert_eq!(decoder.next_event(), Some("line one\nline two".to_string()));
        assert_eq!(decoder.next_event(), None);
    }

    #[test]
    fn test_decoder_skips_events_without_data() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"id: 7\nevent: keepalive\n\n");
        assert_eq!(decoder.next_event(), None);
    }

    #[tokio::test]
    async fn test_stream_and_subscribe_post() {
        let posted = Arc::new(Mutex::new(Vec::<String>::new()));
        let recorded = posted.clone();
        let app = Router::new().route(
            "/events",
            get(|| async {
                Response::builder()
                    .header(header::CONTENT_TYPE, "text/event-stream")
                    .body(Body::from("data: {\"type\":\"connected\"}\n\ndata: second\n\n"))
                    .unwrap()
            })
            .post(move |body: String| async move {
                recorded.lock().push(body);
                "ok"
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut transport = ServerPushTransport::new(format!("http://{}/events", addr));
        transport.connect().await.unwrap();
        transport.send(r#"{"type":"subscribe","channels":["cases"]}"#).await.unwrap();

        assert_eq!(transport.next_message().await, Some(Ok(r#"{"type":"connected"}"#.to_string())));
        assert_eq!(transport.next_message().await, Some(Ok("second".to_string())));
        assert_eq!(transport.next_message().await, None);
        assert_eq!(posted.lock().as_slice(), [r#"{"type":"subscribe","channels":["cases"]}"#.to_string()]);
    }
}
