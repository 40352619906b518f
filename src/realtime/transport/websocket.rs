//! Duplex WebSocket transport

use super::Transport;
use crate::core::TransportError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connection to the realtime endpoint
pub struct WebSocketTransport {
    url: String,
    stream: Option<WsStream>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), stream: None }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "websocket connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream
            .send(Message::Text(message.to_string()))
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn next_message(&mut self) -> Option<Result<String, TransportError>> {
        let stream = self.stream.as_mut()?;
        loop {
            match stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes).map_err(|e| TransportError::Protocol(format!("non-UTF-8 frame: {}", e))),
                    )
                }
                Ok(Message::Close(frame)) => {
                    trace!(?frame, "websocket closed by peer");
                    return None;
                }
                // Pings are answered by tungstenite on the next read.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(TransportError::Connection(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                trace!(error = %e, "websocket close failed");
            }
        }
    }
}
