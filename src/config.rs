//! Configuration management
//!
//! Loads exporter configuration from a TOML file, applies environment
//! overrides and validates the result.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::event::IngestorConfig;
use crate::flush::default_tick;
use crate::metrics::{BasicAuth, DEFAULT_BUCKETS};

/// Environment variable overriding `source.addr`
pub const ENV_SOURCE_ADDR: &str = "TASKMON_SOURCE_ADDR";
/// Environment variable overriding the store backend and location
pub const ENV_STORE_URL: &str = "TASKMON_STORE_URL";
/// Environment variable overriding `flush.interval_secs`
pub const ENV_FLUSH_INTERVAL: &str = "TASKMON_FLUSH_INTERVAL";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub exposition: ExpositionConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Event source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Address of the newline-delimited JSON event feed
    #[serde(default = "default_source_addr")]
    pub addr: String,
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Reconnect with backoff after the connection drops
    #[serde(default = "default_true")]
    pub reconnect: bool,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// Task ids remembered for resolving names of terminal events
    #[serde(default = "default_name_cache_capacity")]
    pub name_cache_capacity: usize,
}

/// Snapshot store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
    Resp,
}

/// Snapshot store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    /// Cache address for the `resp` backend
    #[serde(default = "default_store_addr")]
    pub addr: String,
    /// Logical database selected after connecting
    #[serde(default)]
    pub db: Option<u32>,
    /// Target file for the `file` backend
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Key the snapshot is stored under
    #[serde(default = "default_store_key")]
    pub key: String,
    /// Per-operation timeout in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Flush scheduling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// Minimum time between two snapshot writes, in seconds
    #[serde(default = "default_flush_interval")]
    pub interval_secs: f64,
    /// Scheduler wake-up tick (default: min(100ms, interval / 2))
    #[serde(default)]
    pub tick_ms: Option<u64>,
    /// How long `stop` waits for each loop
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
}

impl FlushConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    pub fn tick(&self) -> Duration {
        match self.tick_ms {
            Some(ms) => Duration::from_millis(ms),
            None => default_tick(self.interval()),
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Exposition format configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExpositionConfig {
    /// Metric name prefix
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Finite runtime bucket bounds, ascending
    #[serde(default = "default_buckets")]
    pub buckets: Vec<f64>,
}

/// Scrape endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_scrape_addr")]
    pub bind_addr: SocketAddr,
    /// Basic auth user; auth is enforced when both user and password are set
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ScrapeConfig {
    /// Credentials to enforce, if both halves are configured
    pub fn auth(&self) -> Option<BasicAuth> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(BasicAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Self-telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Enable the self-telemetry endpoint
    #[serde(default)]
    pub enabled: bool,
    /// Telemetry server bind address
    #[serde(default = "default_telemetry_addr")]
    pub bind_addr: SocketAddr,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_source_addr() -> String { "127.0.0.1:5555".to_string() }
fn default_connect_timeout() -> u64 { 5_000 }
fn default_true() -> bool { true }
fn default_backoff_initial() -> u64 { 100 }
fn default_backoff_max() -> u64 { 30_000 }
fn default_name_cache_capacity() -> usize { 10_000 }
fn default_store_backend() -> StoreBackend { StoreBackend::Resp }
fn default_store_addr() -> String { "127.0.0.1:6379".to_string() }
fn default_store_key() -> String { "celery_metrics".to_string() }
fn default_store_timeout() -> u64 { 2_000 }
fn default_flush_interval() -> f64 { 0.5 }
fn default_join_timeout() -> u64 { 1_000 }
fn default_namespace() -> String { "celery".to_string() }
fn default_buckets() -> Vec<f64> { DEFAULT_BUCKETS.to_vec() }
fn default_scrape_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 9808)) }
fn default_telemetry_addr() -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 9090)) }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            addr: default_source_addr(),
            connect_timeout_ms: default_connect_timeout(),
            reconnect: true,
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            name_cache_capacity: default_name_cache_capacity(),
        }
    }
}

impl SourceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ingestor(&self) -> IngestorConfig {
        IngestorConfig {
            reconnect: self.reconnect,
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            name_cache_capacity: self.name_cache_capacity,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            addr: default_store_addr(),
            db: None,
            path: None,
            key: default_store_key(),
            timeout_ms: default_store_timeout(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_flush_interval(),
            tick_ms: None,
            join_timeout_ms: default_join_timeout(),
        }
    }
}

impl Default for ExpositionConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            buckets: default_buckets(),
        }
    }
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_scrape_addr(),
            username: None,
            password: None,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_telemetry_addr(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| "Failed to parse config file")?;

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for deployments without a file
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_SOURCE_ADDR) {
            self.source.addr = addr;
        }
        if let Some(url) = lookup(ENV_STORE_URL) {
            self.apply_store_url(&url)
                .with_context(|| format!("Invalid {}: {}", ENV_STORE_URL, url))?;
        }
        if let Some(interval) = lookup(ENV_FLUSH_INTERVAL) {
            self.flush.interval_secs = interval
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_FLUSH_INTERVAL, interval))?;
        }
        Ok(())
    }

    /// Point the store at `redis://host:port[/db]`, `file:///path` or `memory://`
    fn apply_store_url(&mut self, url: &str) -> Result<()> {
        if let Some(rest) = url.strip_prefix("redis://") {
            let (addr, db) = match rest.split_once('/') {
                Some((addr, "")) => (addr, None),
                Some((addr, db)) => (addr, Some(db.parse::<u32>().context("Invalid database index")?)),
                None => (rest, None),
            };
            if addr.is_empty() {
                anyhow::bail!("missing host");
            }
            self.store.backend = StoreBackend::Resp;
            self.store.addr = addr.to_string();
            self.store.db = db;
        } else if url.starts_with("rediss://") {
            anyhow::bail!("TLS connections to the cache are not supported");
        } else if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() {
                anyhow::bail!("missing file path");
            }
            self.store.backend = StoreBackend::File;
            self.store.path = Some(PathBuf::from(path));
        } else if url == "memory://" {
            self.store.backend = StoreBackend::Memory;
        } else {
            anyhow::bail!("unsupported store URL scheme");
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let interval = self.flush.interval_secs;
        if !interval.is_finite() || interval <= 0.0 {
            anyhow::bail!("flush.interval_secs must be > 0");
        }
        if Duration::try_from_secs_f64(interval).is_err() {
            anyhow::bail!("flush.interval_secs is too large: {}", interval);
        }
        if self.flush.tick_ms == Some(0) {
            anyhow::bail!("flush.tick_ms must be > 0");
        }
        if self.flush.join_timeout_ms == 0 {
            anyhow::bail!("flush.join_timeout_ms must be > 0");
        }
        if self.source.backoff_initial_ms == 0 {
            anyhow::bail!("source.backoff_initial_ms must be > 0");
        }
        if self.store.key.is_empty() {
            anyhow::bail!("store.key must not be empty");
        }
        if self.store.backend == StoreBackend::File && self.store.path.is_none() {
            anyhow::bail!("store.path is required for the file backend");
        }
        if self.store.timeout_ms == 0 {
            anyhow::bail!("store.timeout_ms must be > 0");
        }
        let buckets = &self.exposition.buckets;
        if buckets.is_empty() {
            anyhow::bail!("exposition.buckets must not be empty");
        }
        if buckets.iter().any(|b| !b.is_finite()) {
            anyhow::bail!("exposition.buckets must be finite (+Inf is implicit)");
        }
        if buckets.windows(2).any(|w| w[0] >= w[1]) {
            anyhow::bail!("exposition.buckets must be strictly ascending");
        }
        if self.scrape.username.is_some() != self.scrape.password.is_some() {
            anyhow::bail!("scrape.username and scrape.password must be set together");
        }
        Ok(())
    }
}
