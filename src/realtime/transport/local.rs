//! In-process notification transport.
//!
//! Receive-only: other components of the same process publish events through
//! a [`LocalNotifier`] and every connected [`LocalChannelTransport`] sees them.

use super::Transport;
use crate::core::TransportError;
use crate::realtime::event::RealtimeEvent;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

/// Publishing side of the local channel
#[derive(Clone)]
pub struct LocalNotifier {
    tx: broadcast::Sender<String>,
}

impl LocalNotifier {
    /// Create a notifier buffering up to `capacity` messages per receiver
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns how many receivers got it
    pub fn publish(&self, event: &RealtimeEvent) -> usize {
        self.publish_raw(event.to_message())
    }

    /// Publish a raw message
    pub fn publish_raw(&self, message: impl Into<String>) -> usize {
        self.tx.send(message.into()).unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

/// Receives messages published on a [`LocalNotifier`]
pub struct LocalChannelTransport {
    notifier: LocalNotifier,
    rx: Option<broadcast::Receiver<String>>,
}

impl LocalChannelTransport {
    /// Transport that receives from `notifier` once connected
    pub fn new(notifier: LocalNotifier) -> Self {
        Self { notifier, rx: None }
    }
}

#[async_trait]
impl Transport for LocalChannelTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.rx = Some(self.notifier.subscribe());
        Ok(())
    }

    async fn send(&mut self, _message: &str) -> Result<(), TransportError> {
        if self.rx.is_none() {
            return Err(TransportError::NotConnected);
        }
        // Passive channel: subscriptions are implicit.
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<String, TransportError>> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(message) => return Some(Ok(message)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "local realtime receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(&mut self) {
        self.rx = None;
    }
}
