//! Per-listener-slot sink for one subscribed extension config.

use super::subscription::FilterConfigSubscription;
use crate::errors::Result;
use crate::extension::{
    validate_terminal_filter, validate_type_url, FilterChainType, FilterFactoryCb, ValidatedConfig,
};
use crate::init::InitTarget;
use crate::utils::Cleanup;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(0);

type InstantiateFn = Box<dyn Fn(&ValidatedConfig) -> Result<FilterFactoryCb> + Send + Sync>;

/// A config published to the filter chain by a provider
#[derive(Clone)]
pub struct InstalledConfig {
    pub factory: FilterFactoryCb,
    pub config: ValidatedConfig,
    pub version_info: String,
}

/// Installs the subscribed config into one listener filter slot, enforcing
/// the slot's type-URL whitelist and terminal-placement constraint.
///
/// Holds a strong reference to its subscription and registers a weak
/// back-reference there for the subscription's broadcasts; registration is
/// undone on drop.
pub struct DynamicFilterConfigProvider {
    id: u64,
    subscription: Arc<FilterConfigSubscription>,
    require_type_urls: HashSet<String>,
    last_filter_in_filter_chain: bool,
    filter_chain_type: FilterChainType,
    default_config: Option<ValidatedConfig>,
    init_target: InitTarget,
    instantiate: InstantiateFn,
    current: RwLock<Option<InstalledConfig>>,
}

impl DynamicFilterConfigProvider {
    pub(crate) fn new(
        subscription: Arc<FilterConfigSubscription>,
        require_type_urls: HashSet<String>,
        default_config: Option<ValidatedConfig>,
        last_filter_in_filter_chain: bool,
        filter_chain_type: FilterChainType,
        instantiate: InstantiateFn,
    ) -> Arc<Self> {
        let id = NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed);

        // This init target activates the subscription without waiting for a
        // response; a default config covers the window until one arrives.
        let init_subscription = Arc::downgrade(&subscription);
        let init_target = InitTarget::new_ready_on_init(
            format!("dynamic-filter-config-provider {}", subscription.name()),
            move || {
                if let Some(subscription) = init_subscription.upgrade() {
                    subscription.start();
                }
            },
        );

        let provider = Arc::new(Self {
            id,
            subscription,
            require_type_urls,
            last_filter_in_filter_chain,
            filter_chain_type,
            default_config,
            init_target,
            instantiate,
            current: RwLock::new(None),
        });
        provider.subscription.attach_provider(id, Arc::downgrade(&provider));
        provider
    }

    /// Name of the subscribed filter config resource
    pub fn name(&self) -> &str {
        self.subscription.name()
    }

    /// Readiness token for the listener init manager (non-warming path)
    pub fn init_target(&self) -> &InitTarget {
        &self.init_target
    }

    /// The subscription this provider consumes
    pub fn subscription(&self) -> &Arc<FilterConfigSubscription> {
        &self.subscription
    }

    /// Check a payload type against this slot's whitelist
    pub fn validate_type_url(&self, type_url: &str) -> Result<()> {
        validate_type_url(type_url, &self.require_type_urls)
    }

    /// Check terminal-filter placement against this slot's chain position
    pub fn validate_terminal_filter(
        &self,
        filter_name: &str,
        filter_type: &str,
        is_terminal: bool,
    ) -> Result<()> {
        validate_terminal_filter(
            filter_name,
            filter_type,
            self.filter_chain_type,
            is_terminal,
            self.last_filter_in_filter_chain,
        )
    }

    /// Install a validated config. The completion sentinel is released when
    /// the previous config's resources are safe to drop; here the swap is
    /// synchronous, so it is released on return.
    pub fn on_config_update(
        &self,
        config: ValidatedConfig,
        version_info: &str,
        _completion: Arc<Cleanup>,
    ) -> Result<()> {
        let factory = (self.instantiate)(&config)?;
        if let Ok(mut current) = self.current.write() {
            *current = Some(InstalledConfig {
                factory,
                config,
                version_info: version_info.to_string(),
            });
        }
        Ok(())
    }

    /// Clear the installed config, falling back to the default when one is
    /// configured
    pub fn on_config_removed(&self, _completion: Arc<Cleanup>) -> Result<()> {
        let fallback = match &self.default_config {
            Some(default) => Some(InstalledConfig {
                factory: (self.instantiate)(default)?,
                config: default.clone(),
                version_info: String::new(),
            }),
            None => None,
        };
        if let Ok(mut current) = self.current.write() {
            *current = fallback;
        }
        Ok(())
    }

    /// Install the pre-bound default config, if one is configured
    pub fn apply_default_configuration(&self) -> Result<()> {
        let Some(default) = self.default_config.clone() else {
            return Ok(());
        };
        debug!(filter_config = %self.name(), "applying default filter configuration");
        let factory = (self.instantiate)(&default)?;
        if let Ok(mut current) = self.current.write() {
            *current = Some(InstalledConfig {
                factory,
                config: default,
                version_info: String::new(),
            });
        }
        Ok(())
    }

    /// The filter-factory callable currently published to the filter chain
    pub fn filter_factory(&self) -> Option<FilterFactoryCb> {
        self.current
            .read()
            .ok()
            .and_then(|current| current.as_ref().map(|installed| installed.factory.clone()))
    }

    /// The currently installed config, if any
    pub fn installed_config(&self) -> Option<ValidatedConfig> {
        self.current
            .read()
            .ok()
            .and_then(|current| current.as_ref().map(|installed| installed.config.clone()))
    }

    /// Version of the currently installed config (empty for the default)
    pub fn installed_version(&self) -> Option<String> {
        self.current
            .read()
            .ok()
            .and_then(|current| current.as_ref().map(|installed| installed.version_info.clone()))
    }
}

impl Drop for DynamicFilterConfigProvider {
    fn drop(&mut self) {
        self.subscription.detach_provider(self.id);
    }
}
