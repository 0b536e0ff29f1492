//! Configuration management for hostwatch
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding all application settings. It uses the `figment`
//! crate to layer built-in defaults, a `hostwatch.toml` file, environment
//! variables and command-line arguments, in that order.

use crate::alerts::AlertRuleConfig;
use crate::cli::Cli;
use crate::persistence::OverflowPolicy;
use crate::providers::ProviderKind;
use crate::registry::ProviderSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid provider, alert or backend configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("provider domain '{0}' is already registered")]
    DuplicateDomain(String),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("invalid alert rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },
    #[error("alert rule '{0}' is defined more than once")]
    DuplicateRule(String),
    #[error("failed to load alert rules from {path}: {reason}")]
    RuleFile { path: PathBuf, reason: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to load configuration: {0}")]
    Load(String),
    #[error("enabled providers cannot change without a restart (running {running:?}, requested {requested:?})")]
    ProviderSetChanged {
        running: Vec<String>,
        requested: Vec<String>,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        ConfigurationError::Load(e.to_string())
    }
}

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// The logging level for the application.
    pub log_level: String,
    /// Agent-wide timing settings.
    pub agent: AgentConfig,
    /// Per-provider sampling settings.
    pub providers: ProvidersConfig,
    /// Threshold alert rules.
    pub alerts: AlertsConfig,
    /// Time-series backend connection.
    pub backend: BackendConfig,
    /// Buffering, retry and fallback behaviour of the persistence client.
    pub persistence: PersistenceConfig,
    /// Live consumer delivery settings.
    pub fanout: FanoutConfig,
    /// HTTP/WebSocket consumer surface.
    pub web: WebConfig,
    /// Prometheus self-metrics.
    pub metrics: MetricsConfig,
    /// Local log of every published snapshot.
    pub history: HistoryConfig,
}

/// Agent-wide timing settings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// How long the publisher waits after a domain update to fold in other
    /// updates before publishing one merged snapshot.
    pub coalesce_window_ms: u64,
    /// Upper bound on how long shutdown waits for in-flight work.
    pub shutdown_grace_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 100,
            shutdown_grace_seconds: 5,
        }
    }
}

/// Sampling settings for one provider.
#[serde_as]
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Whether the provider is registered at all.
    pub enabled: bool,
    /// Time between sampling cycles.
    #[serde(rename = "interval_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub interval: Duration,
    /// Upper bound on a single sampling cycle.
    #[serde(rename = "timeout_seconds")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub timeout: Duration,
    /// Drop the domain from snapshots once its last good sample is this old.
    #[serde(rename = "stale_after_seconds")]
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub stale_after: Option<Duration>,
    /// Consecutive failures before the provider is reported to consumers.
    pub surface_after_failures: u32,
}

impl ProviderConfig {
    fn every(seconds: u64) -> Self {
        Self {
            interval: Duration::from_secs(seconds),
            ..Default::default()
        }
    }

    pub fn settings(&self) -> ProviderSettings {
        ProviderSettings {
            interval: self.interval,
            timeout: self.timeout,
            stale_after: self.stale_after,
            surface_after_failures: self.surface_after_failures,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            stale_after: None,
            surface_after_failures: 3,
        }
    }
}

/// Settings for each built-in provider.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub cpu: ProviderConfig,
    pub memory: ProviderConfig,
    pub disk: ProviderConfig,
    pub network: ProviderConfig,
    pub process: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            cpu: ProviderConfig::every(2),
            memory: ProviderConfig::every(5),
            disk: ProviderConfig::every(10),
            network: ProviderConfig::every(5),
            process: ProviderConfig::every(5),
        }
    }
}

impl ProvidersConfig {
    pub fn get(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::Cpu => &self.cpu,
            ProviderKind::Memory => &self.memory,
            ProviderKind::Disk => &self.disk,
            ProviderKind::Network => &self.network,
            ProviderKind::Process => &self.process,
        }
    }

    /// The enabled providers with their runtime settings.
    pub fn enabled(&self) -> Vec<(ProviderKind, ProviderSettings)> {
        ProviderKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).enabled)
            .map(|kind| (kind, self.get(kind).settings()))
            .collect()
    }
}

/// Threshold alert rules.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AlertsConfig {
    /// YAML files holding lists of rules.
    pub rule_files: Vec<PathBuf>,
    /// Rules defined inline in the configuration file.
    pub rules: Vec<AlertRuleConfig>,
}

/// InfluxDB v2 connection settings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Whether snapshots are persisted at all.
    pub enabled: bool,
    /// Base URL of the InfluxDB server.
    pub url: String,
    /// Organization name.
    pub org: String,
    /// Bucket written to and queried from.
    pub bucket: String,
    /// API token sent as `Authorization: Token ...`.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout_ms: u64,
    /// Static tags attached to every point, e.g. `host = "web-1"`.
    pub tags: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://localhost:8086".to_string(),
            org: "hostwatch".to_string(),
            bucket: "metrics".to_string(),
            token: None,
            timeout_ms: 5000,
            tags: BTreeMap::new(),
        }
    }
}

/// Buffering, retry and fallback behaviour of the persistence client.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Maximum number of points held in memory awaiting a write.
    pub buffer_capacity: usize,
    /// What to do with the oldest point when the buffer is full.
    pub overflow: OverflowPolicy,
    /// Write attempts per batch before falling back.
    pub max_attempts: u32,
    /// First retry delay; doubles on every attempt.
    pub initial_backoff_ms: u64,
    /// Retry delay ceiling.
    pub max_backoff_ms: u64,
    /// Points per backend write.
    pub batch_size: usize,
    /// Local append-only log for points that could not be written.
    pub fallback_path: PathBuf,
    /// Maximum records kept in the fallback log.
    pub fallback_capacity: usize,
    /// How often an unreachable backend is probed for recovery.
    pub probe_interval_seconds: u64,
    /// Separator used to join nested keys into field names.
    pub separator: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            overflow: OverflowPolicy::Spill,
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            batch_size: 500,
            fallback_path: PathBuf::from("hostwatch-fallback.jsonl"),
            fallback_capacity: 100_000,
            probe_interval_seconds: 10,
            separator: crate::codec::DEFAULT_SEPARATOR.to_string(),
        }
    }
}

/// Live consumer delivery settings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct FanoutConfig {
    /// Snapshots queued per consumer before the oldest is replaced.
    pub consumer_queue_capacity: usize,
    /// Alert events queued per consumer. A consumer that lets this fill up
    /// is disconnected.
    pub event_queue_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            consumer_queue_capacity: 1,
            event_queue_capacity: 64,
        }
    }
}

/// HTTP/WebSocket consumer surface.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub listen_address: SocketAddr,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: SocketAddr::from(([127, 0, 0, 1], 5678)),
        }
    }
}

/// Configuration for the metrics system.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus metrics server.
    pub enabled: bool,
    /// The address for the Prometheus metrics server to listen on.
    pub listen_address: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: SocketAddr::from(([127, 0, 0, 1], 9898)),
        }
    }
}

/// Local snapshot history log, read back by `hostwatch export`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("hostwatch-history.jsonl"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            agent: AgentConfig::default(),
            providers: ProvidersConfig::default(),
            alerts: AlertsConfig::default(),
            backend: BackendConfig::default(),
            persistence: PersistenceConfig::default(),
            fanout: FanoutConfig::default(),
            web: WebConfig::default(),
            metrics: MetricsConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration for the given command line.
    ///
    /// Sources are layered: defaults, then the TOML file (if given), then
    /// `HOSTWATCH_` environment variables (`__` separates nested keys), then
    /// command-line flags.
    pub fn load(cli: &Cli) -> Result<Self, ConfigurationError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(path) = &cli.config {
            if !path.exists() {
                return Err(ConfigurationError::Load(format!(
                    "Config file not found at specified path: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: Config = figment
            .merge(Env::prefixed("HOSTWATCH_").split("__"))
            .merge(cli)
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that parse fine but cannot work.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for kind in ProviderKind::ALL {
            let provider = self.providers.get(kind);
            if provider.interval.is_zero() {
                return Err(ConfigurationError::Invalid(format!(
                    "providers.{}.interval_seconds must be greater than zero",
                    kind
                )));
            }
            if provider.timeout.is_zero() {
                return Err(ConfigurationError::Invalid(format!(
                    "providers.{}.timeout_seconds must be greater than zero",
                    kind
                )));
            }
        }
        if self.providers.enabled().is_empty() {
            return Err(ConfigurationError::Invalid(
                "at least one provider must be enabled".to_string(),
            ));
        }

        let p = &self.persistence;
        if p.buffer_capacity == 0 || p.batch_size == 0 {
            return Err(ConfigurationError::Invalid(
                "persistence.buffer_capacity and persistence.batch_size must be greater than zero"
                    .to_string(),
            ));
        }
        if p.max_attempts == 0 {
            return Err(ConfigurationError::Invalid(
                "persistence.max_attempts must be at least 1".to_string(),
            ));
        }
        if p.initial_backoff_ms > p.max_backoff_ms {
            return Err(ConfigurationError::Invalid(
                "persistence.initial_backoff_ms exceeds persistence.max_backoff_ms".to_string(),
            ));
        }
        if p.separator.is_empty() {
            return Err(ConfigurationError::Invalid(
                "persistence.separator must not be empty".to_string(),
            ));
        }
        if self.fanout.consumer_queue_capacity == 0 || self.fanout.event_queue_capacity == 0 {
            return Err(ConfigurationError::Invalid(
                "fanout queue capacities must be greater than zero".to_string(),
            ));
        }
        for rule in &self.alerts.rules {
            rule.validate()?;
        }
        Ok(())
    }
}
