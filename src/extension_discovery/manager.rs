//! Interns subscriptions and builds providers for listener filter slots.

use super::provider::DynamicFilterConfigProvider;
use super::subscription::FilterConfigSubscription;
use super::SubscriptionKey;
use crate::errors::{Error, Result};
use crate::extension::{
    type_url_to_descriptor_full_name, validate_terminal_filter, validate_type_url, FactoryContext,
    FilterChainType, FilterFactoryCb, ValidatedConfig,
};
use crate::utils::Cleanup;
use dashmap::DashMap;
use envoy_types::pb::envoy::config::core::v3::{ConfigSource, ExtensionConfigSource};
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::debug;

pub(crate) struct ManagerState {
    pub(crate) subscriptions: DashMap<SubscriptionKey, Weak<FilterConfigSubscription>>,
}

/// Creates dynamic filter config providers and interns their subscriptions
/// by (config source, filter config name), so every slot consuming the same
/// resource shares one transport and one last-known-good config.
#[derive(Clone)]
pub struct FilterConfigProviderManager {
    state: Arc<ManagerState>,
}

impl Default for FilterConfigProviderManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterConfigProviderManager {
    pub fn new() -> Self {
        Self { state: Arc::new(ManagerState { subscriptions: DashMap::new() }) }
    }

    /// Number of live interned subscriptions
    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions.len()
    }

    /// Get or create the subscription for (config source, name). The table
    /// holds weak references; an entry is live iff some provider still holds
    /// the subscription.
    pub fn get_subscription(
        &self,
        config_source: &ConfigSource,
        filter_config_name: &str,
        factory_context: &FactoryContext,
        stat_prefix: &str,
    ) -> Arc<FilterConfigSubscription> {
        let key = SubscriptionKey {
            config_source: config_source.encode_to_vec(),
            filter_config_name: filter_config_name.to_string(),
        };

        if let Some(entry) = self.state.subscriptions.get(&key) {
            if let Some(existing) = entry.value().upgrade() {
                return existing;
            }
        }

        let subscription = FilterConfigSubscription::new(
            config_source,
            filter_config_name,
            factory_context,
            stat_prefix,
            Arc::downgrade(&self.state),
            key.clone(),
        );
        self.state.subscriptions.insert(key, Arc::downgrade(&subscription));
        subscription
    }

    /// Build a provider for one listener filter slot.
    ///
    /// Warming (`apply_default_config_without_warming == false`) registers
    /// the subscription's init target so the listener waits for the first
    /// response; otherwise the default is applied immediately and only the
    /// provider's own target (ready as soon as the subscription is started)
    /// is registered.
    pub fn create_dynamic_filter_config_provider(
        &self,
        config_source: &ExtensionConfigSource,
        filter_config_name: &str,
        factory_context: &FactoryContext,
        stat_prefix: &str,
        last_filter_in_filter_chain: bool,
        filter_chain_type: FilterChainType,
    ) -> Result<Arc<DynamicFilterConfigProvider>> {
        let source = config_source.config_source.as_ref().ok_or_else(|| {
            Error::config(format!(
                "extension config source for {} is missing its config source",
                filter_config_name
            ))
        })?;

        let subscription =
            self.get_subscription(source, filter_config_name, factory_context, stat_prefix);

        // For warming, wait until the subscription receives the first
        // response to indicate readiness.
        if !config_source.apply_default_config_without_warming {
            factory_context.init_manager.add(subscription.init_target().clone());
        }

        let require_type_urls: HashSet<String> = config_source
            .type_urls
            .iter()
            .map(|type_url| type_url_to_descriptor_full_name(type_url).to_string())
            .collect();

        let default_config = match &config_source.default_config {
            Some(default) => Some(self.get_default_config(
                default,
                filter_config_name,
                factory_context,
                last_filter_in_filter_chain,
                filter_chain_type,
                &require_type_urls,
            )?),
            None => None,
        };

        let registry = Arc::clone(&factory_context.registry);
        let instantiate_prefix = stat_prefix.to_string();
        let provider = DynamicFilterConfigProvider::new(
            Arc::clone(&subscription),
            require_type_urls,
            default_config,
            last_filter_in_filter_chain,
            filter_chain_type,
            Box::new(move |config: &ValidatedConfig| -> Result<FilterFactoryCb> {
                let factory =
                    registry.get_factory_by_type(&config.type_url).ok_or_else(|| {
                        Error::config(format!(
                            "no extension factory registered for config type {}",
                            config.type_url
                        ))
                    })?;
                factory.create_filter_factory(&config.message, &instantiate_prefix)
            }),
        );

        // Ensure the subscription starts even when the listener is not
        // waiting on it.
        if config_source.apply_default_config_without_warming {
            factory_context.init_manager.add(provider.init_target().clone());
        }

        self.apply_last_or_default(&subscription, &provider, filter_config_name)?;
        Ok(provider)
    }

    /// Apply the subscription's current config to a newly created provider,
    /// or fall back to the slot's default.
    ///
    /// A config received before this slot existed can fail the slot's
    /// constraints when ECDS and LDS updates race and the LDS update lands
    /// first. Installing it anyway must not happen: count the conflict, run
    /// on the default, and converge when the next compatible update arrives.
    fn apply_last_or_default(
        &self,
        subscription: &Arc<FilterConfigSubscription>,
        provider: &Arc<DynamicFilterConfigProvider>,
        filter_config_name: &str,
    ) -> Result<()> {
        let mut last_config_valid = false;

        if let Some(last) = subscription.last_config() {
            let validation = provider.validate_type_url(&last.config.type_url).and_then(|_| {
                provider.validate_terminal_filter(
                    filter_config_name,
                    &last.config.factory_name,
                    last.config.is_terminal,
                )
            });
            match validation {
                Ok(()) => {
                    provider.on_config_update(
                        last.config,
                        &last.version_info,
                        Cleanup::new(|| {}),
                    )?;
                    last_config_valid = true;
                }
                Err(e) => {
                    debug!(filter_config = %filter_config_name, error = %e,
                        "subscribed config is invalid in this listener context");
                    subscription.inc_conflict_counter();
                }
            }
        }

        if !last_config_valid {
            provider.apply_default_configuration()?;
        }
        Ok(())
    }

    /// Resolve, validate, and translate a slot's declared default config.
    /// Any failure here fails the listener configuration.
    fn get_default_config(
        &self,
        default: &Any,
        filter_config_name: &str,
        factory_context: &FactoryContext,
        last_filter_in_filter_chain: bool,
        filter_chain_type: FilterChainType,
        require_type_urls: &HashSet<String>,
    ) -> Result<ValidatedConfig> {
        let type_url = type_url_to_descriptor_full_name(&default.type_url);
        let factory =
            factory_context.registry.get_factory_by_type(type_url).ok_or_else(|| {
                Error::config(format!(
                    "cannot find filter factory {} for default filter configuration with type URL {}",
                    filter_config_name, default.type_url
                ))
            })?;

        validate_type_url(type_url, require_type_urls)?;
        let message = factory.translate_config(default)?;
        let is_terminal = factory.is_terminal_filter(&message);
        validate_terminal_filter(
            filter_config_name,
            factory.name(),
            filter_chain_type,
            is_terminal,
            last_filter_in_filter_chain,
        )?;

        Ok(ValidatedConfig {
            message,
            type_url: type_url.to_string(),
            factory_name: factory.name().to_string(),
            is_terminal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{ConfigMessage, ExtensionFactory, FactoryRegistry, FilterChain};
    use crate::extension_discovery::NullSubscriptionFactory;
    use crate::init::InitManager;

    struct TagFactory {
        terminal: bool,
    }

    impl ExtensionFactory for TagFactory {
        fn name(&self) -> &str {
            "sp.filters.http.tag"
        }

        fn config_type(&self) -> &str {
            "sp.extensions.filters.http.tag.v1.Tag"
        }

        fn translate_config(&self, payload: &Any) -> Result<ConfigMessage> {
            Ok(Arc::new(String::from_utf8_lossy(&payload.value).into_owned()))
        }

        fn is_terminal_filter(&self, _config: &ConfigMessage) -> bool {
            self.terminal
        }

        fn create_filter_factory(
            &self,
            config: &ConfigMessage,
            _stat_prefix: &str,
        ) -> Result<FilterFactoryCb> {
            let tag = config
                .downcast_ref::<String>()
                .cloned()
                .ok_or_else(|| Error::internal("tag config has unexpected message type"))?;
            Ok(Arc::new(move |chain: &mut FilterChain| chain.add_filter(tag.clone())))
        }
    }

    fn tag_any(tag: &str) -> Any {
        Any {
            type_url: "type.googleapis.com/sp.extensions.filters.http.tag.v1.Tag".to_string(),
            value: tag.as_bytes().to_vec(),
        }
    }

    fn factory_context() -> FactoryContext {
        let registry = Arc::new(FactoryRegistry::new());
        registry.register(Arc::new(TagFactory { terminal: false }));
        FactoryContext {
            registry,
            init_manager: InitManager::new(),
            subscription_factory: Arc::new(NullSubscriptionFactory::new()),
        }
    }

    fn extension_source(default: Option<Any>, without_warming: bool) -> ExtensionConfigSource {
        ExtensionConfigSource {
            config_source: Some(ConfigSource::default()),
            default_config: default,
            apply_default_config_without_warming: without_warming,
            type_urls: vec![
                "type.googleapis.com/sp.extensions.filters.http.tag.v1.Tag".to_string()
            ],
        }
    }

    #[test]
    fn subscriptions_are_interned_per_source_and_name() {
        let manager = FilterConfigProviderManager::new();
        let context = factory_context();
        let source = ConfigSource::default();

        let first = manager.get_subscription(&source, "http.tag", &context, "listener.");
        let second = manager.get_subscription(&source, "http.tag", &context, "listener.");
        let other = manager.get_subscription(&source, "http.other", &context, "listener.");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(manager.subscription_count(), 2);
    }

    #[test]
    fn subscription_entry_dies_with_last_provider() {
        let manager = FilterConfigProviderManager::new();
        let context = factory_context();

        let provider = manager
            .create_dynamic_filter_config_provider(
                &extension_source(None, false),
                "http.tag",
                &context,
                "listener.",
                false,
                FilterChainType::Http,
            )
            .expect("provider creation");
        assert_eq!(manager.subscription_count(), 1);

        let init_target = provider.subscription().init_target().clone();
        drop(provider);
        assert_eq!(manager.subscription_count(), 0);
        // Destruction mid-warm-up still signals readiness.
        assert!(init_target.is_ready());
    }

    #[test]
    fn without_warming_applies_default_and_starts_on_init() {
        let manager = FilterConfigProviderManager::new();
        let context = factory_context();

        let provider = manager
            .create_dynamic_filter_config_provider(
                &extension_source(Some(tag_any("fallback")), true),
                "http.tag",
                &context,
                "listener.",
                false,
                FilterChainType::Http,
            )
            .expect("provider creation");

        // Default installed immediately; subscription not yet started.
        let mut chain = FilterChain::new();
        provider.filter_factory().expect("default factory")(&mut chain);
        assert_eq!(chain.filters(), ["fallback"]);
        assert!(!provider.subscription().started());

        // Listener initialization starts the subscription and readies the
        // provider target without waiting for a response.
        context.init_manager.initialize();
        assert!(provider.subscription().started());
        assert!(context.init_manager.all_ready());
    }

    #[test]
    fn warming_path_blocks_on_subscription_target() {
        let manager = FilterConfigProviderManager::new();
        let context = factory_context();

        let provider = manager
            .create_dynamic_filter_config_provider(
                &extension_source(None, false),
                "http.tag",
                &context,
                "listener.",
                false,
                FilterChainType::Http,
            )
            .expect("provider creation");

        assert!(provider.filter_factory().is_none());
        context.init_manager.initialize();
        assert!(provider.subscription().started());
        assert!(!context.init_manager.all_ready());

        // First response readies the listener.
        let resource = crate::extension_discovery::DecodedResource {
            resource: envoy_types::pb::envoy::config::core::v3::TypedExtensionConfig {
                name: "http.tag".to_string(),
                typed_config: Some(tag_any("live")),
            },
            version: "1".to_string(),
        };
        provider
            .subscription()
            .on_config_update(std::slice::from_ref(&resource), "1")
            .expect("update");
        assert!(context.init_manager.all_ready());

        let mut chain = FilterChain::new();
        provider.filter_factory().expect("installed factory")(&mut chain);
        assert_eq!(chain.filters(), ["live"]);
    }

    #[test]
    fn default_config_with_unknown_factory_fails_listener() {
        let manager = FilterConfigProviderManager::new();
        let context = factory_context();

        let unknown = Any {
            type_url: "type.googleapis.com/sp.extensions.filters.http.unknown.v1.Unknown"
                .to_string(),
            value: Vec::new(),
        };
        let result = manager.create_dynamic_filter_config_provider(
            &extension_source(Some(unknown), true),
            "http.tag",
            &context,
            "listener.",
            false,
            FilterChainType::Http,
        );
        assert!(result.is_err());
    }
}
