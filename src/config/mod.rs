//! # Configuration Management
//!
//! Defines the configuration structure for the Streamplane data plane core.
//! Settings cover the observability stack and the defaults the discovery and
//! pool subsystems fall back to when the embedder does not override them.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration
    pub observability: ObservabilityConfig,

    /// Extension config discovery configuration
    pub discovery: DiscoveryConfig,

    /// Connection pool defaults
    pub pool: PoolConfig,
}

impl Config {
    /// Load configuration from `STREAMPLANE_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(level) = std::env::var("STREAMPLANE_LOG_LEVEL") {
            config.observability.log_level = level;
        }
        if let Ok(json) = std::env::var("STREAMPLANE_JSON_LOGGING") {
            config.observability.json_logging = parse_bool("STREAMPLANE_JSON_LOGGING", &json)?;
        }
        if let Ok(enabled) = std::env::var("STREAMPLANE_ENABLE_METRICS") {
            config.observability.enable_metrics =
                parse_bool("STREAMPLANE_ENABLE_METRICS", &enabled)?;
        }
        if let Ok(port) = std::env::var("STREAMPLANE_METRICS_PORT") {
            config.observability.metrics_port = port.parse().map_err(|e| {
                Error::config(format!("Invalid STREAMPLANE_METRICS_PORT '{}': {}", port, e))
            })?;
        }
        if let Ok(prefix) = std::env::var("STREAMPLANE_STAT_PREFIX") {
            config.discovery.stat_prefix = prefix;
        }
        if let Ok(timeout) = std::env::var("STREAMPLANE_CONNECT_TIMEOUT_MS") {
            let ms: u64 = timeout.parse().map_err(|e| {
                Error::config(format!("Invalid STREAMPLANE_CONNECT_TIMEOUT_MS '{}': {}", timeout, e))
            })?;
            config.pool.connect_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.observability.validate()?;
        self.pool.validate()?;
        Ok(())
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Emit JSON structured logs instead of human-readable output
    pub json_logging: bool,

    /// Enable Prometheus metrics export
    pub enable_metrics: bool,

    /// Metrics exporter bind address
    pub metrics_bind_address: String,

    /// Metrics exporter port (0 disables the listener)
    pub metrics_port: u16,

    /// Service name attached to exported metrics
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
            enable_metrics: false,
            metrics_bind_address: "127.0.0.1".to_string(),
            metrics_port: 9090,
            service_name: "streamplane".to_string(),
        }
    }
}

impl ObservabilityConfig {
    /// Full metrics bind address, or `None` when the listener is disabled
    pub fn metrics_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            return None;
        }
        Some(format!("{}:{}", self.metrics_bind_address, self.metrics_port))
    }

    fn validate(&self) -> Result<()> {
        match self.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            _ => Err(Error::config(format!(
                "Invalid log level '{}': must be one of trace, debug, info, warn, error",
                self.log_level
            ))),
        }
    }
}

/// Extension config discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Stat prefix prepended to every subscription's metric scope
    pub stat_prefix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { stat_prefix: "listener.".to_string() }
    }
}

/// Connection pool defaults, applied when a cluster does not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on connection establishment (TCP + handshake)
    pub connect_timeout: Duration,

    /// Lifetime stream limit per connection (0 = unlimited)
    pub per_connection_stream_limit: u64,

    /// Concurrent stream limit per connection
    pub concurrent_stream_limit: u32,

    /// Per-upstream preconnect ratio
    pub preconnect_ratio: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            per_connection_stream_limit: 0,
            concurrent_stream_limit: 1,
            preconnect_ratio: 1.0,
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.concurrent_stream_limit == 0 {
            return Err(Error::config("Concurrent stream limit must be at least 1"));
        }
        if self.preconnect_ratio < 1.0 {
            return Err(Error::config("Preconnect ratio cannot be below 1.0"));
        }
        Ok(())
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::config(format!("Invalid {} '{}': expected a boolean", var, value))),
    }
}
