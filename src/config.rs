//! Configuration: per-session SSE options and daemon settings.
//!
//! Session options are a shallow overlay on fixed defaults. Daemon settings are
//! loaded from a TOML file and then overridden from the environment.

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::DaemonError;

/// Default reconnection delay advertised in every frame (milliseconds).
pub const DEFAULT_RETRY_MS: i64 = 1000;

/// Default value reported in the `Content-Length` header.
pub const DEFAULT_MAX_EVENT_SOURCE_BUFFER_SIZE: i64 = 5192;

/// A configuration value that may be given as an integer or a string.
///
/// Rendered verbatim into headers and frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Number(i64),
    Text(String),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Number(n) => write!(f, "{}", n),
            ConfigValue::Text(s) => f.write_str(s),
        }
    }
}

macro_rules! config_value_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for ConfigValue {
                fn from(n: $t) -> Self {
                    ConfigValue::Number(i64::from(n))
                }
            }
        )*
    };
}

config_value_from_int!(i32, i64, u16, u32);

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Text(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::Text(s)
    }
}

/// Resolved configuration for one SSE session. Immutable once the session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Value placed after `retry: ` in every frame.
    pub retry: ConfigValue,
    /// Value placed in the `Content-Length` header. Advisory only, never enforced.
    pub max_event_source_buffer_size: ConfigValue,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: ConfigValue::Number(DEFAULT_RETRY_MS),
            max_event_source_buffer_size: ConfigValue::Number(DEFAULT_MAX_EVENT_SOURCE_BUFFER_SIZE),
        }
    }
}

impl SessionConfig {
    /// Overlay caller options on the defaults. Keys the caller left unset keep
    /// their default.
    pub fn from_options(options: &SessionOptions) -> Self {
        let defaults = Self::default();
        Self {
            retry: options.retry.clone().unwrap_or(defaults.retry),
            max_event_source_buffer_size: options
                .max_event_source_buffer_size
                .clone()
                .unwrap_or(defaults.max_event_source_buffer_size),
        }
    }

    pub fn with_retry(mut self, retry: impl Into<ConfigValue>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn with_max_event_source_buffer_size(mut self, size: impl Into<ConfigValue>) -> Self {
        self.max_event_source_buffer_size = size.into();
        self
    }
}

/// Caller-supplied session options.
///
/// Unknown keys are ignored and wrongly typed values are treated as unset, so
/// deserializing options never fails on content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    #[serde(deserialize_with = "deserialize_lenient")]
    pub retry: Option<ConfigValue>,

    #[serde(
        rename = "maxEventSourceBufferSize",
        alias = "max_event_source_buffer_size",
        deserialize_with = "deserialize_lenient"
    )]
    pub max_event_source_buffer_size: Option<ConfigValue>,
}

impl SessionOptions {
    pub fn retry(mut self, retry: impl Into<ConfigValue>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn max_event_source_buffer_size(mut self, size: impl Into<ConfigValue>) -> Self {
        self.max_event_source_buffer_size = Some(size.into());
        self
    }

    /// Resolve against the defaults.
    pub fn resolve(&self) -> SessionConfig {
        SessionConfig::from_options(self)
    }
}

/// Accept an integer or string; anything else becomes `None`.
fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Option<ConfigValue>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Value(ConfigValue),
        Other(serde::de::IgnoredAny),
    }

    match Lenient::deserialize(deserializer)? {
        Lenient::Value(v) => Ok(Some(v)),
        Lenient::Other(_) => Ok(None),
    }
}

/// Main daemon configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionOptions,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP address to accept SSE clients on.
    pub listen_addr: String,

    /// Request path served as an event stream.
    pub path: String,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Timeout for reading the request head (seconds).
    pub request_timeout_secs: u64,

    /// Upper bound on the request head size (bytes).
    pub max_request_head_bytes: usize,

    /// Timeout for individual writes to client (seconds).
    pub write_timeout_secs: u64,

    /// Graceful shutdown timeout (seconds).
    pub shutdown_timeout_secs: u64,

    /// Interval between heartbeat events (milliseconds).
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            path: "/events".to_string(),
            max_connections: 10_000,
            request_timeout_secs: 5,
            max_request_head_bytes: 8192,
            write_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            heartbeat_interval_ms: 15_000,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(DaemonError::Config(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(DaemonError::Config(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics/Prometheus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics endpoint.
    pub enabled: bool,

    /// Listen address for metrics server.
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn").
    pub level: String,

    /// Output format: "pretty" or "json".
    pub format: String,
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
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DaemonError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DaemonError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        toml::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file, then apply environment variable overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, DaemonError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.server.validate()?;

        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SSE_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Some(v) = lookup("SSE_PATH") {
            self.server.path = v;
        }
        if let Some(n) = lookup("SSE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.server.max_connections = n;
        }
        if let Some(n) = lookup("SSE_WRITE_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.server.write_timeout_secs = n;
        }
        if let Some(n) = lookup("SSE_HEARTBEAT_MS").and_then(|v| v.parse().ok()) {
            self.server.heartbeat_interval_ms = n;
        }

        if let Some(v) = lookup("SSE_RETRY") {
            self.session.retry = Some(parse_config_value(v));
        }
        if let Some(v) = lookup("SSE_MAX_BUFFER_SIZE") {
            self.session.max_event_source_buffer_size = Some(parse_config_value(v));
        }

        if let Some(v) = lookup("SSE_METRICS_ENABLED") {
            self.metrics.enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("SSE_METRICS_ADDR") {
            self.metrics.listen_addr = v;
        }

        if let Some(v) = lookup("SSE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("SSE_LOG_FORMAT") {
            self.logging.format = v;
        }
    }
}

fn parse_config_value(raw: String) -> ConfigValue {
    match raw.trim().parse::<i64>() {
        Ok(n) => ConfigValue::Number(n),
        Err(_) => ConfigValue::Text(raw),
    }
}
