//! De-duplicated subscription to one named extension config resource.

use super::manager::ManagerState;
use super::provider::DynamicFilterConfigProvider;
use super::{
    ConfigSubscription, ConfigUpdateFailureReason, DecodedResource, ExtensionDiscoveryStats,
    SubscriptionKey, EXTENSION_CONFIG_TYPE_URL,
};
use crate::errors::{Error, Result};
use crate::extension::{type_url_to_descriptor_full_name, FactoryContext, ValidatedConfig};
use crate::init::InitTarget;
use crate::utils::{apply_to_all_with_cleanup, hash_any};
use envoy_types::pb::envoy::config::core::v3::ConfigSource;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, warn};

/// The last config applied by a subscription
#[derive(Debug, Clone)]
pub struct LastConfig {
    /// Stable hash of the any-typed payload, for update de-duplication
    pub hash: u64,
    /// The translated, factory-validated payload
    pub config: ValidatedConfig,
    /// Control-plane version the payload arrived with
    pub version_info: String,
}

struct SubscriptionState {
    started: bool,
    last: Option<LastConfig>,
    providers: Vec<(u64, Weak<DynamicFilterConfigProvider>)>,
}

/// Long-lived consumer of one named extension config from one config source.
///
/// Shared: created on first demand, interned weakly by the provider manager,
/// and dropped when the last attached provider releases it. Providers hold
/// strong references here; this struct only keeps weak back-references to its
/// providers.
pub struct FilterConfigSubscription {
    name: String,
    key: SubscriptionKey,
    stats: Arc<ExtensionDiscoveryStats>,
    init_target: InitTarget,
    registry: Arc<crate::extension::FactoryRegistry>,
    transport: Box<dyn ConfigSubscription>,
    manager: Weak<ManagerState>,
    state: Mutex<SubscriptionState>,
}

impl FilterConfigSubscription {
    pub(crate) fn new(
        config_source: &ConfigSource,
        filter_config_name: &str,
        factory_context: &FactoryContext,
        stat_prefix: &str,
        manager: Weak<ManagerState>,
        key: SubscriptionKey,
    ) -> Arc<Self> {
        let stats = Arc::new(ExtensionDiscoveryStats::new(stat_prefix, filter_config_name));
        let transport =
            factory_context.subscription_factory.create(config_source, EXTENSION_CONFIG_TYPE_URL);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let init_weak = weak.clone();
            let init_target =
                InitTarget::new(format!("filter-config-subscription {}", filter_config_name), move || {
                    if let Some(subscription) = init_weak.upgrade() {
                        subscription.start();
                    }
                });

            Self {
                name: filter_config_name.to_string(),
                key,
                stats,
                init_target,
                registry: factory_context.registry.clone(),
                transport,
                manager,
                state: Mutex::new(SubscriptionState {
                    started: false,
                    last: None,
                    providers: Vec::new(),
                }),
            }
        })
    }

    /// Name of the subscribed filter config resource
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Readiness token for the listener init manager (warming path)
    pub fn init_target(&self) -> &InitTarget {
        &self.init_target
    }

    /// Per-subscription counters
    pub fn stats(&self) -> &Arc<ExtensionDiscoveryStats> {
        &self.stats
    }

    /// The last config applied, if any
    pub fn last_config(&self) -> Option<LastConfig> {
        self.state.lock().ok().and_then(|state| state.last.clone())
    }

    /// Whether the underlying transport has been armed
    pub fn started(&self) -> bool {
        self.state.lock().map(|state| state.started).unwrap_or(false)
    }

    /// Arm the underlying subscription with this resource. Idempotent.
    pub fn start(&self) {
        let first = match self.state.lock() {
            Ok(mut state) if !state.started => {
                state.started = true;
                true
            }
            _ => false,
        };
        if first {
            self.transport.start(vec![self.name.clone()]);
        }
    }

    pub(crate) fn attach_provider(&self, id: u64, provider: Weak<DynamicFilterConfigProvider>) {
        if let Ok(mut state) = self.state.lock() {
            state.providers.push((id, provider));
        }
    }

    pub(crate) fn detach_provider(&self, id: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.providers.retain(|(provider_id, _)| *provider_id != id);
        }
    }

    fn provider_snapshot(&self) -> Vec<Arc<DynamicFilterConfigProvider>> {
        match self.state.lock() {
            Ok(state) => {
                state.providers.iter().filter_map(|(_, provider)| provider.upgrade()).collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Full-state update from the transport.
    ///
    /// Validation happens before any provider is updated, so a rejection by
    /// one slot leaves every slot (and the last-known-good config) untouched.
    /// An `Err` return is reported back by the transport through
    /// [`FilterConfigSubscription::on_config_update_failed`].
    pub fn on_config_update(
        &self,
        resources: &[DecodedResource],
        version_info: &str,
    ) -> Result<()> {
        // Make progress even if the control plane is temporarily inconsistent.
        self.init_target.ready();

        if resources.len() != 1 {
            return Err(Error::discovery(format!(
                "unexpected number of resources in extension config discovery response: {}",
                resources.len()
            )));
        }
        let filter_config = &resources[0].resource;
        if filter_config.name != self.name {
            return Err(Error::discovery(format!(
                "unexpected resource name in extension config discovery response: {}",
                filter_config.name
            )));
        }
        let payload = filter_config.typed_config.as_ref().ok_or_else(|| {
            Error::discovery(format!(
                "extension config discovery response for {} is missing its typed config",
                self.name
            ))
        })?;

        // Skip the update if the hash matches the applied config.
        let new_hash = hash_any(payload);
        if self
            .state
            .lock()
            .ok()
            .and_then(|state| state.last.as_ref().map(|last| last.hash))
            == Some(new_hash)
        {
            return Ok(());
        }

        let type_url = type_url_to_descriptor_full_name(&payload.type_url).to_string();
        let factory = self.registry.get_factory_by_type(&type_url).ok_or_else(|| {
            Error::config(format!("no extension factory registered for config type {}", type_url))
        })?;

        // Validate against every attached slot before applying anywhere; the
        // slots may carry distinct type-URL constraints.
        let providers = self.provider_snapshot();
        for provider in &providers {
            provider.validate_type_url(&type_url)?;
        }

        let message = factory.translate_config(payload)?;
        let is_terminal = factory.is_terminal_filter(&message);
        for provider in &providers {
            provider.validate_terminal_filter(&self.name, factory.name(), is_terminal)?;
        }

        debug!(filter_config = %self.name, version = %version_info, "updating filter configuration");

        let validated = ValidatedConfig {
            message,
            type_url,
            factory_name: factory.name().to_string(),
            is_terminal,
        };
        let stats = Arc::clone(&self.stats);
        apply_to_all_with_cleanup(
            providers,
            |provider, cleanup| {
                if let Err(e) = provider.on_config_update(validated.clone(), version_info, cleanup)
                {
                    error!(filter_config = %self.name, error = %e,
                        "failed to install validated filter configuration");
                }
            },
            move || stats.inc_config_reload(),
        );

        if let Ok(mut state) = self.state.lock() {
            state.last = Some(LastConfig {
                hash: new_hash,
                config: validated,
                version_info: version_info.to_string(),
            });
        }
        Ok(())
    }

    /// Delta update from the transport. A removal clears the applied config
    /// on every slot; additions are treated as a full-state update at the
    /// added resource's version.
    pub fn on_config_update_delta(
        &self,
        added: &[DecodedResource],
        removed: &[String],
        _system_version: &str,
    ) -> Result<()> {
        if !removed.is_empty() {
            if removed.len() != 1 {
                warn!(filter_config = %self.name, count = removed.len(),
                    "multiple removals for a single-resource subscription");
            }
            debug!(filter_config = %self.name, "removing filter configuration");

            let providers = self.provider_snapshot();
            let stats = Arc::clone(&self.stats);
            apply_to_all_with_cleanup(
                providers,
                |provider, cleanup| {
                    if let Err(e) = provider.on_config_removed(cleanup) {
                        error!(filter_config = %self.name, error = %e,
                            "failed to roll back removed filter configuration");
                    }
                },
                move || stats.inc_config_reload(),
            );

            if let Ok(mut state) = self.state.lock() {
                state.last = None;
            }
            return Ok(());
        }
        if !added.is_empty() {
            let version = added[0].version.clone();
            return self.on_config_update(added, &version);
        }
        Ok(())
    }

    /// Transport-level failure. The last-known-good config is retained; a
    /// transient control-plane failure must not drop installed filters.
    pub fn on_config_update_failed(&self, reason: ConfigUpdateFailureReason) {
        debug!(filter_config = %self.name, reason = ?reason, "filter configuration update failed");
        self.stats.inc_config_fail();
        // Make progress even if the control plane is temporarily failing.
        self.init_target.ready();
    }

    /// Bump the per-slot rejection counter (ECDS/LDS race convergence)
    pub(crate) fn inc_conflict_counter(&self) {
        self.stats.inc_config_conflict();
    }
}

impl Drop for FilterConfigSubscription {
    fn drop(&mut self) {
        // If destroyed during initialization, still signal that warm-up
        // cannot be waiting on this subscription.
        self.init_target.ready();
        if let Some(manager) = self.manager.upgrade() {
            manager.subscriptions.remove(&self.key);
        }
    }
}
