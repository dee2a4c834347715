//! # Extension Factory Seam
//!
//! The boundary between the discovery machinery and the extensions it
//! configures. Factories are registered by the descriptor full name of their
//! config message; the discovery layer resolves a factory from an any-typed
//! payload, asks it to translate and validate the payload, and finally asks
//! it for the filter-factory callable the listener filter chain consumes.

use crate::errors::{Error, Result};
use crate::init::InitManager;
use envoy_types::pb::google::protobuf::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Prefix carried by any-typed payload type URLs
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// Map a type URL in any-URL form to descriptor full-name form
/// (`type.googleapis.com/foo.v3.Bar` → `foo.v3.Bar`)
pub fn type_url_to_descriptor_full_name(type_url: &str) -> &str {
    type_url
        .strip_prefix(TYPE_URL_PREFIX)
        .or_else(|| type_url.rsplit('/').next())
        .unwrap_or(type_url)
}

/// Translated, factory-validated extension config payload
#[derive(Clone)]
pub struct ValidatedConfig {
    /// The concrete decoded message, downcast by the owning factory
    pub message: ConfigMessage,
    /// Descriptor full name of the message type
    pub type_url: String,
    /// Name of the factory that produced the message
    pub factory_name: String,
    /// Whether the factory declared this config a terminal filter
    pub is_terminal: bool,
}

impl fmt::Debug for ValidatedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedConfig")
            .field("type_url", &self.type_url)
            .field("factory_name", &self.factory_name)
            .field("is_terminal", &self.is_terminal)
            .finish()
    }
}

/// Opaque decoded config message
pub type ConfigMessage = Arc<dyn std::any::Any + Send + Sync>;

/// A filter chain under construction. Installed filter factories append
/// their filter instances here when the chain is materialized.
#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<String>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_filter(&mut self, name: impl Into<String>) {
        self.filters.push(name.into());
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }
}

/// Callable that installs a configured filter into a chain
pub type FilterFactoryCb = Arc<dyn Fn(&mut FilterChain) + Send + Sync>;

/// The position a filter chain occupies in the listener pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterChainType {
    Http,
    Network,
}

impl fmt::Display for FilterChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterChainType::Http => write!(f, "http"),
            FilterChainType::Network => write!(f, "network"),
        }
    }
}

/// A factory for one extension type
pub trait ExtensionFactory: Send + Sync {
    /// Canonical extension name (e.g. `sp.filters.http.header_tag`)
    fn name(&self) -> &str;

    /// Descriptor full name of the config message this factory accepts
    fn config_type(&self) -> &str;

    /// Decode and semantically validate an any-typed payload into the
    /// concrete config message
    fn translate_config(&self, payload: &Any) -> Result<ConfigMessage>;

    /// Whether the produced config makes this a terminal filter
    fn is_terminal_filter(&self, config: &ConfigMessage) -> bool;

    /// Produce the filter-factory callable for a translated config
    fn create_filter_factory(
        &self,
        config: &ConfigMessage,
        stat_prefix: &str,
    ) -> Result<FilterFactoryCb>;
}

/// Registry of extension factories keyed by config message type
#[derive(Default)]
pub struct FactoryRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ExtensionFactory>>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its config message type. The most recent
    /// registration for a type wins.
    pub fn register(&self, factory: Arc<dyn ExtensionFactory>) {
        if let Ok(mut factories) = self.factories.write() {
            factories.insert(factory.config_type().to_string(), factory);
        }
    }

    /// Look up a factory by descriptor full name of its config message
    pub fn get_factory_by_type(&self, config_type: &str) -> Option<Arc<dyn ExtensionFactory>> {
        self.factories.read().ok().and_then(|factories| factories.get(config_type).cloned())
    }
}

/// Context handed to the discovery machinery by the listener being configured
#[derive(Clone)]
pub struct FactoryContext {
    /// Extension factory registry
    pub registry: Arc<FactoryRegistry>,
    /// The listener's init manager
    pub init_manager: InitManager,
    /// Produces subscription transports from config sources
    pub subscription_factory: Arc<dyn crate::extension_discovery::SubscriptionFactory>,
}

/// Validate a payload type URL against a slot's whitelist. An empty
/// whitelist leaves the slot unconstrained.
pub fn validate_type_url(type_url: &str, require_type_urls: &HashSet<String>) -> Result<()> {
    if require_type_urls.is_empty() || require_type_urls.contains(type_url) {
        return Ok(());
    }
    let mut expected: Vec<&str> = require_type_urls.iter().map(String::as_str).collect();
    expected.sort_unstable();
    Err(Error::validation(format!(
        "filter config has type URL {} but expect {}",
        type_url,
        expected.join(", ")
    )))
}

/// Validate terminal-filter placement: a terminal filter is allowed only at
/// the tail of its chain, and the tail position requires a terminal filter.
pub fn validate_terminal_filter(
    filter_name: &str,
    filter_type: &str,
    chain_type: FilterChainType,
    is_terminal: bool,
    is_last_in_chain: bool,
) -> Result<()> {
    if is_terminal && !is_last_in_chain {
        return Err(Error::validation(format!(
            "terminal filter named {} of type {} must be the last filter in a {} filter chain",
            filter_name, filter_type, chain_type
        )));
    }
    if !is_terminal && is_last_in_chain {
        return Err(Error::validation(format!(
            "non-terminal filter named {} of type {} is the last filter in a {} filter chain",
            filter_name, filter_type, chain_type
        )));
    }
    Ok(())
}
