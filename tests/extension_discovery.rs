//! Integration tests for extension config discovery: warm-up paths, update
//! idempotence and atomicity, removal fallback, terminal-placement
//! enforcement, and convergence when discovery races the listener
//! configuration.

use envoy_types::pb::envoy::config::core::v3::{
    ConfigSource, ExtensionConfigSource, TypedExtensionConfig,
};
use envoy_types::pb::google::protobuf::Any;
use std::sync::Arc;
use streamplane::errors::{Error, Result};
use streamplane::extension::{
    ConfigMessage, ExtensionFactory, FactoryContext, FactoryRegistry, FilterChain,
    FilterChainType, FilterFactoryCb,
};
use streamplane::extension_discovery::{
    ConfigUpdateFailureReason, DecodedResource, FilterConfigProviderManager,
    NullSubscriptionFactory,
};
use streamplane::init::InitManager;

const TAG_TYPE_URL: &str = "type.googleapis.com/sp.extensions.filters.http.tag.v1.Tag";
const MIRROR_TYPE_URL: &str = "type.googleapis.com/sp.extensions.filters.http.mirror.v1.Mirror";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/sp.extensions.filters.http.router.v1.Router";

/// A filter factory whose config is a plain UTF-8 tag
struct StringConfigFactory {
    name: &'static str,
    config_type: &'static str,
    terminal: bool,
}

impl ExtensionFactory for StringConfigFactory {
    fn name(&self) -> &str {
        self.name
    }

    fn config_type(&self) -> &str {
        self.config_type
    }

    fn translate_config(&self, payload: &Any) -> Result<ConfigMessage> {
        let text = String::from_utf8(payload.value.clone())
            .map_err(|e| Error::validation(format!("config is not valid UTF-8: {}", e)))?;
        Ok(Arc::new(text))
    }

    fn is_terminal_filter(&self, _config: &ConfigMessage) -> bool {
        self.terminal
    }

    fn create_filter_factory(
        &self,
        config: &ConfigMessage,
        _stat_prefix: &str,
    ) -> Result<FilterFactoryCb> {
        let label = config
            .downcast_ref::<String>()
            .cloned()
            .ok_or_else(|| Error::internal("unexpected config message type"))?;
        let filter_name = format!("{}:{}", self.name, label);
        Ok(Arc::new(move |chain: &mut FilterChain| chain.add_filter(filter_name.clone())))
    }
}

struct Fixture {
    manager: FilterConfigProviderManager,
    context: FactoryContext,
    transport_factory: Arc<NullSubscriptionFactory>,
}

impl Fixture {
    fn new() -> Self {
        let registry = Arc::new(FactoryRegistry::new());
        registry.register(Arc::new(StringConfigFactory {
            name: "sp.filters.http.tag",
            config_type: "sp.extensions.filters.http.tag.v1.Tag",
            terminal: false,
        }));
        registry.register(Arc::new(StringConfigFactory {
            name: "sp.filters.http.mirror",
            config_type: "sp.extensions.filters.http.mirror.v1.Mirror",
            terminal: false,
        }));
        registry.register(Arc::new(StringConfigFactory {
            name: "sp.filters.http.router",
            config_type: "sp.extensions.filters.http.router.v1.Router",
            terminal: true,
        }));

        let transport_factory = Arc::new(NullSubscriptionFactory::new());
        let context = FactoryContext {
            registry,
            init_manager: InitManager::new(),
            subscription_factory: transport_factory.clone(),
        };
        Self { manager: FilterConfigProviderManager::new(), context, transport_factory }
    }
}

fn any_config(type_url: &str, label: &str) -> Any {
    Any { type_url: type_url.to_string(), value: label.as_bytes().to_vec() }
}

fn decoded(name: &str, payload: Any, version: &str) -> DecodedResource {
    DecodedResource {
        resource: TypedExtensionConfig {
            name: name.to_string(),
            typed_config: Some(payload),
        },
        version: version.to_string(),
    }
}

fn extension_source(type_urls: &[&str], default: Option<Any>, without_warming: bool) -> ExtensionConfigSource {
    ExtensionConfigSource {
        config_source: Some(ConfigSource::default()),
        default_config: default,
        apply_default_config_without_warming: without_warming,
        type_urls: type_urls.iter().map(|url| url.to_string()).collect(),
    }
}

fn installed_filters(provider: &streamplane::extension_discovery::DynamicFilterConfigProvider) -> Vec<String> {
    let mut chain = FilterChain::new();
    if let Some(factory) = provider.filter_factory() {
        factory(&mut chain);
    }
    chain.filters().to_vec()
}

#[test]
fn start_arms_transport_with_the_resource_name() {
    let fixture = Fixture::new();
    let provider = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &extension_source(&[TAG_TYPE_URL], None, false),
            "http.tag",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("provider creation");

    assert!(fixture.transport_factory.started_resources().is_empty());
    fixture.context.init_manager.initialize();
    assert_eq!(fixture.transport_factory.started_resources(), vec!["http.tag"]);

    // start() is idempotent across repeated initialization.
    provider.subscription().start();
    fixture.context.init_manager.initialize();
    assert_eq!(fixture.transport_factory.started_resources(), vec!["http.tag"]);
}

#[test]
fn updates_are_idempotent_by_payload_hash() {
    let fixture = Fixture::new();
    let provider = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &extension_source(&[TAG_TYPE_URL], None, false),
            "http.tag",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("provider creation");
    let subscription = provider.subscription().clone();

    let update = [decoded("http.tag", any_config(TAG_TYPE_URL, "blue"), "1")];
    subscription.on_config_update(&update, "1").expect("first update");
    assert_eq!(subscription.stats().config_reload(), 1);
    assert_eq!(installed_filters(&provider), vec!["sp.filters.http.tag:blue"]);

    // Identical payload at a newer version: no broadcast, no counter.
    let repeat = [decoded("http.tag", any_config(TAG_TYPE_URL, "blue"), "2")];
    subscription.on_config_update(&repeat, "2").expect("repeat update");
    assert_eq!(subscription.stats().config_reload(), 1);
    assert_eq!(provider.installed_version().as_deref(), Some("1"));

    // A different payload is applied.
    let changed = [decoded("http.tag", any_config(TAG_TYPE_URL, "green"), "3")];
    subscription.on_config_update(&changed, "3").expect("changed update");
    assert_eq!(subscription.stats().config_reload(), 2);
    assert_eq!(installed_filters(&provider), vec!["sp.filters.http.tag:green"]);
}

#[test]
fn malformed_updates_are_rejected_and_keep_last_config() {
    let fixture = Fixture::new();
    let provider = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &extension_source(&[TAG_TYPE_URL], None, false),
            "http.tag",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("provider creation");
    let subscription = provider.subscription().clone();

    let good = [decoded("http.tag", any_config(TAG_TYPE_URL, "blue"), "1")];
    subscription.on_config_update(&good, "1").expect("good update");

    // Wrong resource count.
    let two = [
        decoded("http.tag", any_config(TAG_TYPE_URL, "a"), "2"),
        decoded("http.tag", any_config(TAG_TYPE_URL, "b"), "2"),
    ];
    assert!(subscription.on_config_update(&two, "2").is_err());

    // Mismatched resource name.
    let misnamed = [decoded("http.other", any_config(TAG_TYPE_URL, "a"), "2")];
    assert!(subscription.on_config_update(&misnamed, "2").is_err());

    // Unknown factory type.
    let unknown = [decoded(
        "http.tag",
        any_config("type.googleapis.com/sp.extensions.filters.http.nope.v1.Nope", "a"),
        "2",
    )];
    assert!(subscription.on_config_update(&unknown, "2").is_err());

    // The transport reports the rejections; last-known-good survives.
    subscription.on_config_update_failed(ConfigUpdateFailureReason::UpdateRejected);
    assert_eq!(subscription.stats().config_fail(), 1);
    assert_eq!(installed_filters(&provider), vec!["sp.filters.http.tag:blue"]);
    assert_eq!(subscription.stats().config_reload(), 1);
}

#[test]
fn per_slot_rejection_aborts_the_whole_update() {
    let fixture = Fixture::new();
    // Two slots over the same resource: one accepts tag and mirror configs,
    // the other only tag configs.
    let wide = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &extension_source(&[TAG_TYPE_URL, MIRROR_TYPE_URL], None, false),
            "http.tag",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("wide provider");
    let narrow = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &extension_source(&[TAG_TYPE_URL], None, false),
            "http.tag",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("narrow provider");
    let subscription = wide.subscription().clone();
    assert!(Arc::ptr_eq(&subscription, narrow.subscription()));

    let tag = [decoded("http.tag", any_config(TAG_TYPE_URL, "blue"), "1")];
    subscription.on_config_update(&tag, "1").expect("tag update");
    assert_eq!(subscription.stats().config_reload(), 1);

    // A mirror config passes the wide slot but not the narrow one: the
    // whole update aborts and neither slot moves.
    let mirror = [decoded("http.tag", any_config(MIRROR_TYPE_URL, "m"), "2")];
    assert!(subscription.on_config_update(&mirror, "2").is_err());
    assert_eq!(installed_filters(&wide), vec!["sp.filters.http.tag:blue"]);
    assert_eq!(installed_filters(&narrow), vec!["sp.filters.http.tag:blue"]);
    assert_eq!(subscription.stats().config_reload(), 1);
    assert_eq!(
        subscription.last_config().expect("last config").config.type_url,
        "sp.extensions.filters.http.tag.v1.Tag"
    );
}

#[test]
fn warm_up_completes_on_transport_failure() {
    let fixture = Fixture::new();
    let provider = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &extension_source(&[TAG_TYPE_URL], None, false),
            "http.tag",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("provider creation");

    fixture.context.init_manager.initialize();
    assert!(!fixture.context.init_manager.all_ready());

    // A failing control plane must not hang listener warm-up.
    provider
        .subscription()
        .on_config_update_failed(ConfigUpdateFailureReason::ConnectionFailure);
    assert!(fixture.context.init_manager.all_ready());
    assert_eq!(provider.subscription().stats().config_fail(), 1);
    assert!(provider.filter_factory().is_none());
}

#[test]
fn removal_falls_back_to_default_config() {
    let fixture = Fixture::new();
    let provider = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &extension_source(&[TAG_TYPE_URL], Some(any_config(TAG_TYPE_URL, "fallback")), true),
            "http.tag",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("provider creation");
    let subscription = provider.subscription().clone();
    assert_eq!(installed_filters(&provider), vec!["sp.filters.http.tag:fallback"]);

    let added = [decoded("http.tag", any_config(TAG_TYPE_URL, "live"), "1")];
    subscription.on_config_update_delta(&added, &[], "1").expect("delta add");
    assert_eq!(installed_filters(&provider), vec!["sp.filters.http.tag:live"]);
    assert_eq!(subscription.stats().config_reload(), 1);

    subscription
        .on_config_update_delta(&[], &["http.tag".to_string()], "2")
        .expect("delta remove");
    assert_eq!(installed_filters(&provider), vec!["sp.filters.http.tag:fallback"]);
    assert!(subscription.last_config().is_none());
    assert_eq!(subscription.stats().config_reload(), 2);
}

#[test]
fn terminal_filter_placement_is_enforced() {
    let fixture = Fixture::new();
    // A slot in the middle of the chain must reject a terminal filter.
    let middle = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &extension_source(&[ROUTER_TYPE_URL], None, false),
            "http.router",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("middle provider");
    let update = [decoded("http.router", any_config(ROUTER_TYPE_URL, "r"), "1")];
    assert!(middle.subscription().on_config_update(&update, "1").is_err());
    assert!(middle.filter_factory().is_none());
    drop(middle);

    // The tail slot accepts it.
    let tail = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &extension_source(&[ROUTER_TYPE_URL], None, false),
            "http.router",
            &fixture.context,
            "listener.",
            true,
            FilterChainType::Http,
        )
        .expect("tail provider");
    tail.subscription().on_config_update(&update, "1").expect("tail update");
    assert_eq!(installed_filters(&tail), vec!["sp.filters.http.router:r"]);
    assert!(tail.installed_config().expect("installed").is_terminal);
}

#[test]
fn discovery_and_listener_updates_converge_after_racing() {
    let fixture = Fixture::new();

    // First listener slot accepts both config types; the subscription
    // receives a mirror config.
    let wide = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &extension_source(&[TAG_TYPE_URL, MIRROR_TYPE_URL], None, false),
            "http.tag",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("wide provider");
    let subscription = wide.subscription().clone();
    let mirror = [decoded("http.tag", any_config(MIRROR_TYPE_URL, "m"), "1")];
    subscription.on_config_update(&mirror, "1").expect("mirror update");

    // A listener update adds a narrower slot for the same resource. The
    // subscribed config violates its whitelist, so the slot starts on its
    // default and the conflict is counted.
    let narrow = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &extension_source(&[TAG_TYPE_URL], Some(any_config(TAG_TYPE_URL, "fallback")), false),
            "http.tag",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("narrow provider");

    assert!(Arc::ptr_eq(&subscription, narrow.subscription()));
    assert_eq!(subscription.stats().config_conflict(), 1);
    assert_eq!(installed_filters(&narrow), vec!["sp.filters.http.tag:fallback"]);
    assert_eq!(installed_filters(&wide), vec!["sp.filters.http.mirror:m"]);

    // A compatible update converges both slots.
    let tag = [decoded("http.tag", any_config(TAG_TYPE_URL, "live"), "2")];
    subscription.on_config_update(&tag, "2").expect("tag update");
    assert_eq!(installed_filters(&wide), vec!["sp.filters.http.tag:live"]);
    assert_eq!(installed_filters(&narrow), vec!["sp.filters.http.tag:live"]);
}

#[test]
fn shared_subscription_broadcasts_once() {
    let fixture = Fixture::new();
    let source = extension_source(&[TAG_TYPE_URL], None, false);
    let first = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &source,
            "http.tag",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("first provider");
    let second = fixture
        .manager
        .create_dynamic_filter_config_provider(
            &source,
            "http.tag",
            &fixture.context,
            "listener.",
            false,
            FilterChainType::Http,
        )
        .expect("second provider");
    assert_eq!(fixture.manager.subscription_count(), 1);

    let update = [decoded("http.tag", any_config(TAG_TYPE_URL, "blue"), "1")];
    first.subscription().on_config_update(&update, "1").expect("update");

    assert_eq!(installed_filters(&first), vec!["sp.filters.http.tag:blue"]);
    assert_eq!(installed_filters(&second), vec!["sp.filters.http.tag:blue"]);
    assert_eq!(first.subscription().stats().config_reload(), 1);

    // A provider dropped later leaves the subscription serving the rest.
    drop(second);
    let update = [decoded("http.tag", any_config(TAG_TYPE_URL, "green"), "2")];
    first.subscription().on_config_update(&update, "2").expect("second update");
    assert_eq!(installed_filters(&first), vec!["sp.filters.http.tag:green"]);
    assert_eq!(fixture.manager.subscription_count(), 1);
}
