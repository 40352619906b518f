//! Realtime event channel with transport failover.
//!
//! A background driver task feeds transport outcomes into the pure
//! [`transition`] function and performs the action it returns. Transports are
//! owned by the driver while it runs and handed back when it stops, so a
//! channel can be connected again after a disconnect or give-up.

use crate::core::config::RealtimeConfig;
use crate::realtime::event::{parse_message, subscribe_message, RealtimeEvent};
use crate::realtime::state::{transition, ChannelAction, ChannelInput, ChannelState, ReconnectPolicy};
use crate::realtime::transport::Transport;
use crate::system::metrics::Metrics;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Callback invoked for every parsed event
pub type EventHandler = Arc<dyn Fn(RealtimeEvent) + Send + Sync>;

type Transports = Vec<Box<dyn Transport>>;

struct Shared {
    config: RealtimeConfig,
    handlers: RwLock<Vec<EventHandler>>,
    state_tx: watch::Sender<ChannelState>,
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_replace(state);
    }

    fn dispatch(&self, raw: &str) {
        match parse_message(raw) {
            Ok(Some(event)) => {
                if let Some(metrics) = Metrics::global() {
                    metrics.realtime.events_received.inc();
                }
                trace!(collection = %event.collection, entity_id = %event.entity_id, kind = %event.kind, "realtime event");
                let handlers: Vec<EventHandler> = self.handlers.read().clone();
                for handler in handlers {
                    handler(event.clone());
                }
            }
            Ok(None) => trace!("ignoring control message"),
            Err(e) => {
                if let Some(metrics) = Metrics::global() {
                    metrics.realtime.malformed_messages.inc();
                }
                warn!(error = %e, "dropping malformed realtime message");
            }
        }
    }
}

struct DriverSlot {
    transports: Transports,
    handle: Option<JoinHandle<Transports>>,
}

/// Inbound event stream over an ordered list of transports
pub struct RealtimeChannel {
    shared: Arc<Shared>,
    slot: Mutex<DriverSlot>,
    stop_tx: watch::Sender<bool>,
}

impl RealtimeChannel {
    /// Create a disconnected channel; `transports` are tried in order
    pub fn new(transports: Vec<Box<dyn Transport>>, config: RealtimeConfig) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                handlers: RwLock::new(Vec::new()),
                state_tx,
            }),
            slot: Mutex::new(DriverSlot { transports, handle: None }),
            stop_tx,
        }
    }

    /// Register a handler for parsed events
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(RealtimeEvent) + Send + Sync + 'static,
    {
        self.shared.handlers.write().push(Arc::new(handler));
    }

    /// Current connection state
    pub fn state(&self) -> ChannelState {
        *self.shared.state_tx.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state_tx.subscribe()
    }

    /// Start the connect cascade in the background; no-op while already running
    pub async fn connect(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.handle.take() {
            if !handle.is_finished() {
                slot.handle = Some(handle);
                return;
            }
            slot.transports = reclaim(handle).await;
        }

        self.stop_tx.send_replace(false);
        let transports = std::mem::take(&mut slot.transports);
        let stop_rx = self.stop_tx.subscribe();
        info!(transports = transports.len(), "connecting realtime channel");
        slot.handle = Some(tokio::spawn(drive(self.shared.clone(), transports, stop_rx)));
    }

    /// Close the active transport and stop reconnecting
    pub async fn disconnect(&self) {
        self.stop_tx.send_replace(true);
        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.handle.take() {
            slot.transports = reclaim(handle).await;
        }
        self.shared.set_state(ChannelState::Disconnected);
        info!("realtime channel disconnected");
    }
}

async fn reclaim(handle: JoinHandle<Transports>) -> Transports {
    match handle.await {
        Ok(transports) => transports,
        Err(e) => {
            warn!(error = %e, "realtime driver task failed; transports lost");
            Vec::new()
        }
    }
}

/// Resolves once a stop is requested or the channel is dropped
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn drive(shared: Arc<Shared>, mut transports: Transports, mut stop_rx: watch::Receiver<bool>) -> Transports {
    let policy = ReconnectPolicy {
        transport_count: transports.len(),
        base_delay: shared.config.base_delay,
        max_attempts: shared.config.max_attempts,
    };
    let subscribe = subscribe_message(&shared.config.channels);
    let mut state = ChannelState::Disconnected;
    let mut input = ChannelInput::Connect;

    loop {
        let (next, action) = transition(state, input, &policy);
        state = next;
        shared.set_state(state);

        let Some(action) = action else {
            debug!(?state, ?input, "no action for input; driver stopping");
            break;
        };

        input = match action {
            ChannelAction::Open(i) => {
                let transport = &mut transports[i];
                if let Some(metrics) = Metrics::global() {
                    metrics.realtime.connect_attempts.with_label_values(&[transport.name()]).inc();
                }
                debug!(transport = transport.name(), "opening transport");

                tokio::select! {
                    _ = stop_requested(&mut stop_rx) => ChannelInput::Disconnect,
                    result = tokio::time::timeout(shared.config.connect_timeout, transport.connect()) => match result {
                        Ok(Ok(())) => ChannelInput::Opened,
                        Ok(Err(e)) => {
                            warn!(transport = transport.name(), error = %e, "transport connect failed");
                            ChannelInput::Failed
                        }
                        Err(_) => {
                            warn!(transport = transport.name(), timeout = ?shared.config.connect_timeout, "transport connect timed out");
                            transport.close().await;
                            ChannelInput::Failed
                        }
                    },
                }
            }

            ChannelAction::Listen(i) => listen(&shared, transports[i].as_mut(), &subscribe, &mut stop_rx).await,

            ChannelAction::Wait(delay) => {
                if let Some(metrics) = Metrics::global() {
                    metrics.realtime.reconnects.inc();
                }
                info!(?delay, ?state, "all transports failed; backing off");
                tokio::select! {
                    _ = stop_requested(&mut stop_rx) => ChannelInput::Disconnect,
                    _ = tokio::time::sleep(delay) => ChannelInput::BackoffElapsed,
                }
            }

            ChannelAction::Stop => {
                for transport in transports.iter_mut() {
                    transport.close().await;
                }
                break;
            }

            ChannelAction::GiveUp => {
                warn!(max_attempts = policy.max_attempts, "realtime channel giving up after exhausting every transport");
                break;
            }
        };
    }

    transports
}

async fn listen(
    shared: &Shared,
    transport: &mut dyn Transport,
    subscribe: &str,
    stop_rx: &mut watch::Receiver<bool>,
) -> ChannelInput {
    info!(transport = transport.name(), "realtime channel connected");
    if let Err(e) = transport.send(subscribe).await {
        warn!(transport = transport.name(), error = %e, "subscribe failed");
        transport.close().await;
        return ChannelInput::Failed;
    }

    let opened_at = Instant::now();
    let mut received = false;
    // Until the connection proves stable, losing it counts against the retry budget.
    let ended = |received: bool| {
        if received || opened_at.elapsed() >= shared.config.stable_after {
            ChannelInput::Closed
        } else {
            ChannelInput::Failed
        }
    };

    loop {
        let message = tokio::select! {
            _ = stop_requested(stop_rx) => return ChannelInput::Disconnect,
            message = transport.next_message() => message,
        };

        match message {
            Some(Ok(raw)) => {
                received = true;
                shared.dispatch(&raw);
            }
            Some(Err(e)) => {
                warn!(transport = transport.name(), error = %e, "transport error; reconnecting");
                transport.close().await;
                return ended(received);
            }
            None => {
                info!(transport = transport.name(), "transport closed; reconnecting");
                transport.close().await;
                return ended(received);
            }
        }
    }
}
