//! # Extension Config Discovery
//!
//! Pull-based, de-duplicated distribution of extension configurations from a
//! remote config source to the listener slots that consume them.
//!
//! One [`FilterConfigSubscription`] exists per (config source, filter config
//! name) pair and owns the last-known-good config. Any number of
//! [`DynamicFilterConfigProvider`]s attach to it, one per listener filter
//! slot, each enforcing its own type-URL whitelist and terminal-placement
//! constraint. The [`FilterConfigProviderManager`] interns subscriptions and
//! coordinates warm-up against the listener init manager.
//!
//! The wire protocol is not this module's concern: a transport implementing
//! [`ConfigSubscription`] is armed with the resource name and delivers
//! already-decoded updates back into the subscription.

mod manager;
mod provider;
mod subscription;

pub use manager::FilterConfigProviderManager;
pub use provider::DynamicFilterConfigProvider;
pub use subscription::{FilterConfigSubscription, LastConfig};

use crate::observability::metrics::get_metrics;
use envoy_types::pb::envoy::config::core::v3::{ConfigSource, TypedExtensionConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Resource type consumed by every filter config subscription
pub const EXTENSION_CONFIG_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.core.v3.TypedExtensionConfig";

/// A decoded resource delivered by the subscription transport
#[derive(Debug, Clone)]
pub struct DecodedResource {
    pub resource: TypedExtensionConfig,
    pub version: String,
}

/// Why a config update could not be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigUpdateFailureReason {
    /// The transport lost its connection to the config source
    ConnectionFailure,
    /// The initial fetch timed out
    FetchTimedOut,
    /// The delivered update was rejected
    UpdateRejected,
}

/// Identity of a subscription: the canonical serialized config source plus
/// the filter config name. Keying on the serialized source (rather than a
/// hash of it) means unrelated subscriptions can never alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub config_source: Vec<u8>,
    pub filter_config_name: String,
}

/// A long-lived transport for one resource subscription. Reconnects and
/// backoff are the transport's concern; the core only arms it.
pub trait ConfigSubscription: Send + Sync {
    /// Arm the subscription for the given resource names
    fn start(&self, resource_names: Vec<String>);
}

/// Produces subscription transports from config sources
pub trait SubscriptionFactory: Send + Sync {
    fn create(
        &self,
        config_source: &ConfigSource,
        resource_type_url: &str,
    ) -> Box<dyn ConfigSubscription>;
}

/// A transport that records started resource names and otherwise does
/// nothing. Useful when updates are fed into the subscription directly.
#[derive(Default)]
pub struct NullSubscriptionFactory {
    started: Arc<Mutex<Vec<String>>>,
}

impl NullSubscriptionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resource names started across all transports created by this factory
    pub fn started_resources(&self) -> Vec<String> {
        self.started.lock().map(|names| names.clone()).unwrap_or_default()
    }
}

struct NullSubscription {
    started: Arc<Mutex<Vec<String>>>,
}

impl ConfigSubscription for NullSubscription {
    fn start(&self, resource_names: Vec<String>) {
        if let Ok(mut started) = self.started.lock() {
            started.extend(resource_names);
        }
    }
}

impl SubscriptionFactory for NullSubscriptionFactory {
    fn create(
        &self,
        _config_source: &ConfigSource,
        _resource_type_url: &str,
    ) -> Box<dyn ConfigSubscription> {
        Box::new(NullSubscription { started: self.started.clone() })
    }
}

/// Per-subscription counters, scoped
/// `"{stat_prefix}extension_config_discovery.{name}."`. Kept as atomics so
/// they are readable in process; mirrored onto the metrics registry.
#[derive(Debug)]
pub struct ExtensionDiscoveryStats {
    resource: String,
    scope: String,
    config_reload: AtomicU64,
    config_fail: AtomicU64,
    config_conflict: AtomicU64,
}

impl ExtensionDiscoveryStats {
    pub fn new(stat_prefix: &str, resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            scope: format!("{}extension_config_discovery.{}.", stat_prefix, resource),
            config_reload: AtomicU64::new(0),
            config_fail: AtomicU64::new(0),
            config_conflict: AtomicU64::new(0),
        }
    }

    /// Metric scope prefix for this subscription
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn inc_config_reload(&self) {
        self.config_reload.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = get_metrics() {
            metrics.record_config_reload(&self.resource);
        }
    }

    pub fn inc_config_fail(&self) {
        self.config_fail.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = get_metrics() {
            metrics.record_config_fail(&self.resource);
        }
    }

    pub fn inc_config_conflict(&self) {
        self.config_conflict.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = get_metrics() {
            metrics.record_config_conflict(&self.resource);
        }
    }

    pub fn config_reload(&self) -> u64 {
        self.config_reload.load(Ordering::Relaxed)
    }

    pub fn config_fail(&self) -> u64 {
        self.config_fail.load(Ordering::Relaxed)
    }

    pub fn config_conflict(&self) -> u64 {
        self.config_conflict.load(Ordering::Relaxed)
    }
}
