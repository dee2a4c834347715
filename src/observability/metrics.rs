//! # Metrics Collection
//!
//! Provides Prometheus metrics collection for the data plane core. Domain
//! counters that tests and `dump_state` need to read back are kept as atomics
//! on their owning stats structs; this recorder mirrors them onto the
//! `metrics` registry for export.

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};
use ::tracing::{info, warn};
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::RwLock;

/// Metrics recorder that tracks data plane activity
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record an extension config reload for a subscription
    pub fn record_config_reload(&self, resource: &str) {
        let labels = [("resource", resource.to_string())];
        counter!("extension_config_discovery_reloads_total", &labels).increment(1);
    }

    /// Record a failed extension config update
    pub fn record_config_fail(&self, resource: &str) {
        let labels = [("resource", resource.to_string())];
        counter!("extension_config_discovery_failures_total", &labels).increment(1);
    }

    /// Record an extension config rejected by a listener slot
    pub fn record_config_conflict(&self, resource: &str) {
        let labels = [("resource", resource.to_string())];
        counter!("extension_config_discovery_conflicts_total", &labels).increment(1);
    }

    /// Record an upstream connection being established
    pub fn record_connection_created(&self, cluster: &str) {
        let labels = [("cluster", cluster.to_string())];
        counter!("upstream_cx_total", &labels).increment(1);
    }

    /// Record a connection reaching its maximum duration
    pub fn record_max_duration_reached(&self, cluster: &str) {
        let labels = [("cluster", cluster.to_string())];
        counter!("upstream_cx_max_duration_reached_total", &labels).increment(1);
    }

    /// Update the gauge tracking active streams across a cluster's pools
    pub fn update_active_streams(&self, cluster: &str, count: u64) {
        let labels = [("cluster", cluster.to_string())];
        gauge!("upstream_active_streams", &labels).set(count as f64);
    }

    /// Register baseline metrics so exports appear before events occur
    pub fn register_metrics(&self) {
        describe_counter!(
            "extension_config_discovery_reloads_total",
            Unit::Count,
            "Extension config updates applied across all providers"
        );
        describe_counter!(
            "extension_config_discovery_failures_total",
            Unit::Count,
            "Extension config updates rejected or failed in transport"
        );
        describe_counter!(
            "extension_config_discovery_conflicts_total",
            Unit::Count,
            "Extension configs rejected by a listener slot's constraints"
        );
        describe_counter!(
            "upstream_cx_total",
            Unit::Count,
            "Upstream connections established"
        );
        describe_counter!(
            "upstream_cx_max_duration_reached_total",
            Unit::Count,
            "Upstream connections drained for exceeding max duration"
        );
        describe_gauge!(
            "upstream_active_streams",
            Unit::Count,
            "Active streams across a cluster's connection pools"
        );
    }
}

/// Global metrics recorder instance
static METRICS: once_cell::sync::Lazy<Arc<RwLock<Option<MetricsRecorder>>>> =
    once_cell::sync::Lazy::new(|| Arc::new(RwLock::new(None)));

/// Initialize metrics collection and Prometheus exporter
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    let builder = PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name);

    builder
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    let recorder = MetricsRecorder::new();
    if let Ok(mut metrics) = METRICS.write() {
        *metrics = Some(recorder.clone());
    }

    recorder.register_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(())
}

/// Get the global metrics recorder
pub fn get_metrics() -> Option<MetricsRecorder> {
    METRICS.read().ok().and_then(|guard| guard.clone())
}
