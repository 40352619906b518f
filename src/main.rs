//! Evidence Sync daemon
//!
//! Runs the collection manager with its flush and maintenance loops, connects
//! the realtime channel and serves health and Prometheus metrics over HTTP.
//! When the local channel is enabled, other processes on the host can push
//! events into it with `POST /api/v1/events`.

use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use evidence_sync::api::start_server;
use evidence_sync::core::config::parse_duration;
use evidence_sync::realtime::{build_transports, LocalNotifier, RealtimeChannel};
use evidence_sync::{CollectionManager, Config};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

/// Buffered messages per local realtime subscriber
const LOCAL_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let matches = Command::new("evidence-sync")
        .version(evidence_sync::VERSION)
        .about("Client-side cache and real-time sync engine for case and evidence data.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("sync-endpoint")
                .long("sync-endpoint")
                .value_name("URL")
                .help("Backend base URL for write-behind sync"),
        )
        .arg(
            Arg::new("ws-url")
                .long("ws-url")
                .value_name("URL")
                .help("Realtime WebSocket endpoint"),
        )
        .arg(
            Arg::new("sse-url")
                .long("sse-url")
                .value_name("URL")
                .help("Realtime Server-Sent Events endpoint"),
        )
        .arg(
            Arg::new("budget")
                .long("budget")
                .value_name("BYTES")
                .help("Global cache budget in bytes"),
        )
        .arg(
            Arg::new("flush-interval")
                .long("flush-interval")
                .value_name("DURATION")
                .help("Sync flush interval, e.g. 30s or 500ms"),
        )
        .arg(
            Arg::new("metrics-addr")
                .long("metrics-addr")
                .value_name("ADDR")
                .help("Health and metrics server bind address"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .get_matches();

    // Load configuration
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            let mut config = Config::from_file(path).with_context(|| format!("loading {}", path))?;
            config.apply_env_overrides()?;
            config
        }
        None => Config::load()?,
    };

    // Apply CLI overrides
    apply_cli_overrides(&mut config, &matches)?;
    config.validate().context("invalid configuration")?;

    evidence_sync::init(&config.logging)?;
    info!("Starting {} v{}", evidence_sync::NAME, evidence_sync::VERSION);

    let manager = CollectionManager::builder(config.clone())
        .build()
        .context("building collection manager")?;

    // The observability API publishes on the local channel through `POST /api/v1/events`
    let notifier = config.realtime.local_channel.then(|| LocalNotifier::new(LOCAL_CHANNEL_CAPACITY));
    let transports = build_transports(&config.realtime, notifier.clone());
    if transports.is_empty() {
        info!("No realtime transports configured");
    } else {
        let channel = Arc::new(RealtimeChannel::new(transports, config.realtime.clone()));
        manager.attach_realtime(channel);
    }

    manager.start().await;

    // Observability server stops when the shutdown flag flips
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = if config.metrics.enabled {
        let addr = config.metrics.addr;
        let manager = manager.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = start_server(addr, manager, notifier, shutdown).await {
                warn!("Observability server failed: {}", e);
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal
    shutdown_signal().await;
    warn!("Received shutdown signal, initiating graceful shutdown...");

    manager.shutdown().await;
    stop_tx.send_replace(true);
    if let Some(server) = server {
        if let Err(e) = server.await {
            warn!("Observability server task failed: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &ArgMatches) -> anyhow::Result<()> {
    if let Some(endpoint) = matches.get_one::<String>("sync-endpoint") {
        config.sync.endpoint = endpoint.clone();
    }

    if let Some(url) = matches.get_one::<String>("ws-url") {
        config.realtime.websocket_url = Some(url.clone());
    }

    if let Some(url) = matches.get_one::<String>("sse-url") {
        config.realtime.sse_url = Some(url.clone());
    }

    if let Some(budget) = matches.get_one::<String>("budget") {
        config.cache.budget_bytes = budget.parse().with_context(|| format!("invalid budget: {}", budget))?;
    }

    if let Some(interval) = matches.get_one::<String>("flush-interval") {
        config.sync.flush_interval = parse_duration(interval).map_err(anyhow::Error::msg)?;
    }

    if let Some(addr) = matches.get_one::<String>("metrics-addr") {
        config.metrics.addr = addr.parse().with_context(|| format!("invalid metrics address: {}", addr))?;
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
