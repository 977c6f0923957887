use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::anomaly::{AnomalyThresholds, DEFAULT_WINDOW_SIZE, PATTERN_WINDOW};
use crate::hub::DEFAULT_MAILBOX_CAPACITY;
use crate::store::memory::DEFAULT_RETENTION;

/// Top-level configuration for the linewatch pipeline.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Broker connection and consumer-group settings.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Anomaly detection settings.
    #[serde(default)]
    pub anomaly: AnomalyConfig,

    /// Subscriber fan-out settings.
    #[serde(default)]
    pub hub: HubConfig,

    /// Periodic aggregate publication.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Internal channel sizing and shutdown.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// HTTP/WebSocket server.
    #[serde(default)]
    pub server: ServerConfig,

    /// In-memory event store.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Broker connection and consumer-group settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Bootstrap broker addresses. Default: ["localhost:9092"].
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    /// Consumer group id. Default: "linewatch".
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Topics carrying telemetry. Default: ["line1.sensor"].
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Where a new group starts reading (earliest, latest). Default: earliest.
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    /// Group session timeout. Default: 20s.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Group heartbeat interval. Default: 3s.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Timeout of the startup metadata fetch. Default: 10s.
    #[serde(default = "default_metadata_timeout", with = "humantime_serde")]
    pub metadata_timeout: Duration,
}

/// Anomaly detection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    /// Events kept per machine. Default: 50.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Initial alert thresholds.
    #[serde(default)]
    pub thresholds: AnomalyThresholds,

    /// Evict machine windows idle for this long. Default: never.
    #[serde(default, with = "humantime_serde")]
    pub window_ttl: Option<Duration>,

    /// How often idle windows are swept when `window_ttl` is set. Default: 1m.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

/// Subscriber fan-out settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Outbound frames queued per subscriber before it is dropped. Default: 256.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Keepalive ping interval. Default: 54s.
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,

    /// Disconnect when nothing is read for this long. Default: 60s.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Deadline for a single outbound write. Default: 10s.
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Largest accepted inbound frame in bytes. Default: 512.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Periodic aggregate publication.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Publication interval. Default: 30s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Aggregation lookback. Default: 1h.
    #[serde(default = "default_stats_window", with = "humantime_serde")]
    pub window: Duration,
}

/// Internal channel sizing and shutdown.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Consumer to driver channel. Default: 100.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Driver to alert worker channel. Default: 100.
    #[serde(default = "default_alert_channel_capacity")]
    pub alert_channel_capacity: usize,

    /// Consumer error channel. Default: 10.
    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,

    /// Upper bound on draining in-flight work at shutdown. Default: 10s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// HTTP/WebSocket server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address; ":port" binds all interfaces. Default: ":8080".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// In-memory event store.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Events and alerts retained. Default: 10000.
    #[serde(default = "default_retention")]
    pub retention: usize,
}

// --- Default value functions ---

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_group_id() -> String {
    "linewatch".to_string()
}

fn default_topics() -> Vec<String> {
    vec!["line1.sensor".to_string()]
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_metadata_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_mailbox_capacity() -> usize {
    DEFAULT_MAILBOX_CAPACITY
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(54)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_message_size() -> usize {
    512
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_stats_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_event_channel_capacity() -> usize {
    100
}

fn default_alert_channel_capacity() -> usize {
    100
}

fn default_error_channel_capacity() -> usize {
    10
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_server_addr() -> String {
    ":8080".to_string()
}

fn default_retention() -> usize {
    DEFAULT_RETENTION
}

// --- Default trait impls ---

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_id: default_group_id(),
            topics: default_topics(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout: default_session_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            metadata_timeout: default_metadata_timeout(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            thresholds: AnomalyThresholds::default(),
            window_ttl: None,
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            ping_interval: default_ping_interval(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: default_stats_interval(),
            window: default_stats_window(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
            alert_channel_capacity: default_alert_channel_capacity(),
            error_channel_capacity: default_error_channel_capacity(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate that the configuration is internally consistent.
    pub fn validate(&self) -> Result<()> {
        let broker = &self.broker;
        if broker.brokers.iter().all(|b| b.trim().is_empty()) {
            bail!("broker.brokers is required");
        }
        if broker.group_id.is_empty() {
            bail!("broker.group_id is required");
        }
        if broker.topics.is_empty() || broker.topics.iter().any(String::is_empty) {
            bail!("broker.topics must list at least one non-empty topic");
        }
        match broker.auto_offset_reset.as_str() {
            "earliest" | "latest" => {}
            other => bail!("broker.auto_offset_reset must be earliest or latest, got {other}"),
        }
        if broker.heartbeat_interval.is_zero()
            || broker.heartbeat_interval >= broker.session_timeout
        {
            bail!("broker.heartbeat_interval must be positive and below broker.session_timeout");
        }

        if self.anomaly.window_size < PATTERN_WINDOW {
            bail!("anomaly.window_size must be at least {PATTERN_WINDOW}");
        }
        self.anomaly
            .thresholds
            .validate()
            .context("anomaly.thresholds")?;
        if self.anomaly.window_ttl.is_some_and(|ttl| ttl.is_zero()) {
            bail!("anomaly.window_ttl must be positive when set");
        }
        if self.anomaly.sweep_interval.is_zero() {
            bail!("anomaly.sweep_interval must be positive");
        }

        let hub = &self.hub;
        if hub.mailbox_capacity == 0 {
            bail!("hub.mailbox_capacity must be positive");
        }
        if hub.ping_interval.is_zero() || hub.write_timeout.is_zero() {
            bail!("hub.ping_interval and hub.write_timeout must be positive");
        }
        if hub.ping_interval >= hub.read_timeout {
            bail!("hub.ping_interval must be shorter than hub.read_timeout");
        }
        if hub.max_message_size == 0 {
            bail!("hub.max_message_size must be positive");
        }

        if self.stats.interval.is_zero() {
            bail!("stats.interval must be positive");
        }
        if self.stats.window.is_zero() {
            bail!("stats.window must be positive");
        }

        let pipeline = &self.pipeline;
        if pipeline.event_channel_capacity == 0
            || pipeline.alert_channel_capacity == 0
            || pipeline.error_channel_capacity == 0
        {
            bail!("pipeline channel capacities must be positive");
        }
        if pipeline.shutdown_timeout.is_zero() {
            bail!("pipeline.shutdown_timeout must be positive");
        }

        if self.server.addr.is_empty() {
            bail!("server.addr is required");
        }
        if self.store.retention == 0 {
            bail!("store.retention must be positive");
        }

        Ok(())
    }
}
