//! Configuration management for the evidence cache
//!
//! Defaults are tuned for a single client session. A TOML file, `EVS_*`
//! environment variables and command line flags override them, in that order.

use crate::cache::{CollectionConfig, EvictionStrategy};
use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

/// Default configuration file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "evidence-sync.toml";

/// Default global byte budget (512 MiB)
pub const DEFAULT_BUDGET_BYTES: usize = 512 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Collections and memory budget
    pub cache: CacheConfig,

    /// Write-behind queue
    pub sync: SyncConfig,

    /// Inbound update stream
    pub realtime: RealtimeConfig,

    /// Metrics and monitoring
    pub metrics: MetricsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Global ceiling on approximate bytes across all collections
    pub budget_bytes: usize,

    /// Interval between sweep/quota/stats cycles
    #[serde(with = "duration_serde")]
    pub maintenance_interval: Duration,

    /// Collections created at startup
    pub collections: Vec<NamedCollectionConfig>,
}

/// A collection name paired with its settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCollectionConfig {
    /// Collection name, also used in sync URLs and realtime events
    pub name: String,

    /// Collection settings
    #[serde(flatten)]
    pub config: CollectionConfig,
}

/// Sync queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the backend; writes go to `{endpoint}/cache/sync/{collection}`
    pub endpoint: String,

    /// Flush timer period
    #[serde(with = "duration_serde")]
    pub flush_interval: Duration,

    /// Maximum operations sent per flush
    pub batch_size: usize,

    /// Retry budget per operation
    pub max_retries: u32,

    /// Per-request timeout
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Keep retrying 4xx responses instead of dropping them
    pub retry_client_errors: bool,
}

/// Realtime channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Duplex WebSocket endpoint (primary transport)
    pub websocket_url: Option<String>,

    /// Server-Sent Events endpoint (secondary transport)
    pub sse_url: Option<String>,

    /// Enable the in-process notification channel (last resort)
    pub local_channel: bool,

    /// Channels named in the subscribe message
    pub channels: Vec<String>,

    /// Upper bound on a single transport connect
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Backoff unit; round `n` waits `n * base_delay`
    #[serde(with = "duration_serde")]
    pub base_delay: Duration,

    /// Rounds through the transport list before giving up
    pub max_attempts: u32,

    /// A connection that delivers no message and closes sooner than this
    /// counts as a failed attempt
    #[serde(with = "duration_serde")]
    pub stable_after: Duration,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics` and `/health`
    pub enabled: bool,

    /// Observability server bind address
    pub addr: SocketAddr,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let collection = |name: &str, ttl_ms: u64, max_entries: usize, strategy| NamedCollectionConfig {
            name: name.to_string(),
            config: CollectionConfig {
                ttl_ms,
                max_entries,
                eviction_strategy: strategy,
                sync_interval_ms: 30_000,
            },
        };

        Self {
            budget_bytes: DEFAULT_BUDGET_BYTES,
            maintenance_interval: Duration::from_secs(30),
            collections: vec![
                collection("evidence", 30 * 60 * 1000, 10_000, EvictionStrategy::Lru),
                collection("cases", 60 * 60 * 1000, 2_000, EvictionStrategy::Lru),
                collection("analysis", 15 * 60 * 1000, 5_000, EvictionStrategy::Lfu),
                collection("embeddings", 0, 50_000, EvictionStrategy::Fifo),
            ],
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            flush_interval: Duration::from_secs(30),
            batch_size: 10,
            max_retries: 3,
            request_timeout: Duration::from_secs(10),
            retry_client_errors: false,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            websocket_url: None,
            sse_url: None,
            local_channel: true,
            channels: vec!["evidence".to_string(), "cases".to_string()],
            connect_timeout: Duration::from_secs(5),
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
            stable_after: Duration::from_secs(5),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: SocketAddr::from(([127, 0, 0, 1], 9464)),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default file (if present) and environment
    pub fn load() -> Result<Self> {
        let mut config = if std::path::Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply `EVS_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(budget) = lookup("EVS_BUDGET_BYTES") {
            self.cache.budget_bytes = budget.parse()
                .map_err(|e| Error::config(format!("Invalid budget bytes: {}", e)))?;
        }

        if let Some(interval) = lookup("EVS_MAINTENANCE_INTERVAL") {
            self.cache.maintenance_interval = parse_duration(&interval).map_err(Error::config)?;
        }

        if let Some(endpoint) = lookup("EVS_SYNC_ENDPOINT") {
            self.sync.endpoint = endpoint;
        }

        if let Some(interval) = lookup("EVS_FLUSH_INTERVAL") {
            self.sync.flush_interval = parse_duration(&interval).map_err(Error::config)?;
        }

        if let Some(retries) = lookup("EVS_MAX_RETRIES") {
            self.sync.max_retries = retries.parse()
                .map_err(|e| Error::config(format!("Invalid max retries: {}", e)))?;
        }

        if let Some(url) = lookup("EVS_WS_URL") {
            self.realtime.websocket_url = Some(url);
        }

        if let Some(url) = lookup("EVS_SSE_URL") {
            self.realtime.sse_url = Some(url);
        }

        if let Some(addr) = lookup("EVS_METRICS_ADDR") {
            self.metrics.addr = addr.parse()
                .map_err(|e| Error::config(format!("Invalid metrics address: {}", e)))?;
        }

        if let Some(level) = lookup("EVS_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("EVS_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.cache.budget_bytes == 0 {
            return Err(Error::config("Budget bytes must be greater than zero"));
        }

        if self.cache.maintenance_interval.is_zero() {
            return Err(Error::config("Maintenance interval must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for named in &self.cache.collections {
            if named.name.is_empty() {
                return Err(Error::config("Collection name must not be empty"));
            }
            if !seen.insert(named.name.as_str()) {
                return Err(Error::config(format!("Duplicate collection: {}", named.name)));
            }
        }

        if self.sync.batch_size == 0 {
            return Err(Error::config("Sync batch size must be greater than zero"));
        }

        if self.sync.flush_interval.is_zero() {
            return Err(Error::config("Flush interval must be greater than zero"));
        }

        if self.realtime.max_attempts == 0 {
            return Err(Error::config("Realtime max attempts must be greater than zero"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            _ => return Err(Error::config("Invalid log format")),
        }

        Ok(())
    }

    /// Shortest interval at which any collection wants its writes flushed
    pub fn effective_flush_interval(&self) -> Duration {
        self.cache
            .collections
            .iter()
            .filter(|c| c.config.sync_interval_ms > 0)
            .map(|c| Duration::from_millis(c.config.sync_interval_ms))
            .fold(self.sync.flush_interval, Duration::min)
    }
}

/// Durations as `"30s"`-style strings or integer milliseconds
mod duration_serde {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration string like '30s' or integer milliseconds")
            }

            fn visit_str<E>(self, value: &str) -> Result<Duration, E>
            where
                E: de::Error,
            {
                super::parse_duration(value).map_err(E::custom)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_millis(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                u64::try_from(value)
                    .map(Duration::from_millis)
                    .map_err(|_| E::custom("duration must not be negative"))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"` or bare seconds
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let number = |digits: &str| -> std::result::Result<u64, String> {
        digits.parse().map_err(|_| format!("Invalid duration: {}", s))
    };

    if let Some(ms) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(number(ms)?))
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(Duration::from_secs(number(secs)?))
    } else if let Some(mins) = s.strip_suffix('m') {
        Ok(Duration::from_secs(number(mins)? * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        Ok(Duration::from_secs(number(hours)? * 3600))
    } else {
        Ok(Duration::from_secs(number(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.cache.budget_bytes, 512 * 1024 * 1024);
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.realtime.max_attempts, 5);
        assert_eq!(config.sync.flush_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("12").unwrap(), Duration::from_secs(12));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[cache]
budget_bytes = 1048576
maintenance_interval = "10s"

[[cache.collections]]
name = "evidence"
ttl_ms = 60000
max_entries = 100
eviction_strategy = "lfu"
sync_interval_ms = 5000

[sync]
endpoint = "http://backend:9000"
flush_interval = 15000
retry_client_errors = true

[realtime]
websocket_url = "ws://backend:9000/ws"
connect_timeout = "2s"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cache.budget_bytes, 1024 * 1024);
        assert_eq!(config.cache.maintenance_interval, Duration::from_secs(10));
        assert_eq!(config.cache.collections.len(), 1);
        assert_eq!(config.cache.collections[0].config.eviction_strategy, EvictionStrategy::Lfu);
        assert_eq!(config.sync.endpoint, "http://backend:9000");
        assert_eq!(config.sync.flush_interval, Duration::from_secs(15));
        assert_eq!(config.sync.batch_size, 10);
        assert!(config.sync.retry_client_errors);
        assert_eq!(config.realtime.websocket_url.as_deref(), Some("ws://backend:9000/ws"));
        assert_eq!(config.realtime.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.effective_flush_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("EVS_BUDGET_BYTES", "2048"),
            ("EVS_FLUSH_INTERVAL", "1s"),
            ("EVS_SSE_URL", "http://backend/events"),
            ("EVS_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.cache.budget_bytes, 2048);
        assert_eq!(config.sync.flush_interval, Duration::from_secs(1));
        assert_eq!(config.realtime.sse_url.as_deref(), Some("http://backend/events"));
        assert_eq!(config.logging.level, "debug");

        let mut config = Config::default();
        let err = config.apply_overrides(|k| (k == "EVS_BUDGET_BYTES").then(|| "lots".to_string()));
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.cache.collections.push(config.cache.collections[0].clone());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sync.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
