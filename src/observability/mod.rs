//! # Observability Infrastructure
//!
//! Structured logging and metrics collection for the Streamplane data plane
//! core. Log and metric *transport* is the embedder's concern; this module
//! only wires up the `tracing` subscriber and the Prometheus exporter.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{init_metrics, MetricsRecorder};

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use ::tracing::info;

/// Initialize all observability components
pub fn init_observability(config: &ObservabilityConfig) -> Result<()> {
    init_logging(config)?;

    if config.enable_metrics {
        init_metrics(config)?;
    }

    info!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        metrics_enabled = %config.enable_metrics,
        "Observability initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_observability_without_metrics() {
        let config = ObservabilityConfig {
            enable_metrics: false,
            ..Default::default()
        };

        // Logging installation is idempotent, so this succeeds regardless of
        // test ordering.
        init_observability(&config).expect("observability init");
    }
}
