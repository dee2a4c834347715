//! # Structured Logging
//!
//! Installs the global `tracing` subscriber for the data plane core. The
//! discovery and pool subsystems emit structured debug events on their hot
//! paths; the level is validated up front so a typo in configuration fails
//! listener startup instead of silently logging nothing.

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};
use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt::{self, format::JsonFields},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static LOGGING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Levels accepted by [`ObservabilityConfig::log_level`]
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Install the global tracing subscriber per the configuration. Safe to call
/// more than once: only the first call installs anything, later calls are
/// no-ops.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = env_filter_for(&config.log_level)?;

    LOGGING_INITIALIZED.get_or_try_init(|| install_subscriber(config, filter)).map(|_| ())
}

fn install_subscriber(config: &ObservabilityConfig, filter: EnvFilter) -> Result<()> {
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_logging {
        // One flattened JSON object per event, current span attached, for
        // log pipelines.
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .fmt_fields(JsonFields::new());
        registry.with(json_layer).try_init()
    } else {
        // Multi-line output with targets and worker-thread names, since the
        // pool and discovery events only make sense per worker.
        let pretty_layer =
            fmt::layer().pretty().with_target(true).with_thread_ids(true).with_thread_names(true);
        registry.with(pretty_layer).try_init()
    };

    result.map_err(|e| Error::config(format!("Failed to install tracing subscriber: {}", e)))
}

/// Validate a configured level and build the corresponding env filter.
/// Rejection happens before anything global is touched.
fn env_filter_for(level: &str) -> Result<EnvFilter> {
    let normalized = level.trim();
    if !LOG_LEVELS.contains(&normalized.to_ascii_lowercase().as_str()) {
        return Err(Error::config(format!(
            "Unknown log level '{}': expected one of {}",
            level,
            LOG_LEVELS.join(", ")
        )));
    }

    EnvFilter::try_new(normalized)
        .map_err(|e| Error::config(format!("Unusable log level '{}': {}", level, e)))
}
