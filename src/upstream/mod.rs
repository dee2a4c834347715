//! # Upstream Model
//!
//! Host, cluster, and resource-accounting collaborators consumed by the
//! connection pool: per-host health, per-cluster tunables and counters,
//! circuit-breaker style resource limits, and the cluster-wide connectivity
//! state that preconnect decisions read.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Coarse host health as reported by active and EDS health checking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-cluster traffic counters touched by the pool
#[derive(Debug, Default)]
pub struct ClusterStats {
    pub upstream_cx_total: Counter,
    pub upstream_cx_connect_timeout: Counter,
    pub upstream_cx_overflow: Counter,
    pub upstream_cx_max_requests: Counter,
    pub upstream_cx_max_duration_reached: Counter,
    pub upstream_rq_total: Counter,
    pub upstream_rq_pending_overflow: Counter,
}

/// A bounded resource with a live count
#[derive(Debug)]
pub struct ResourceLimit {
    max: u64,
    count: AtomicU64,
}

impl ResourceLimit {
    pub fn new(max: u64) -> Self {
        Self { max, count: AtomicU64::new(0) }
    }

    pub fn can_create(&self) -> bool {
        self.count.load(Ordering::Relaxed) < self.max
    }

    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let previous = self.count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "resource count underflow");
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max
    }
}

/// Circuit-breaker limits for one upstream cluster
#[derive(Debug)]
pub struct ResourceManager {
    pub connections: ResourceLimit,
    pub pending_streams: ResourceLimit,
    pub streams: ResourceLimit,
}

impl ResourceManager {
    pub fn new(max_connections: u64, max_pending_streams: u64, max_streams: u64) -> Self {
        Self {
            connections: ResourceLimit::new(max_connections),
            pending_streams: ResourceLimit::new(max_pending_streams),
            streams: ResourceLimit::new(max_streams),
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(1024, 1024, 1024)
    }
}

/// Static cluster tunables plus its counters and limits
#[derive(Debug)]
pub struct ClusterInfo {
    name: String,
    connect_timeout: Duration,
    per_upstream_preconnect_ratio: f64,
    max_connection_duration: Option<Duration>,
    resource_manager: ResourceManager,
    stats: ClusterStats,
}

impl ClusterInfo {
    /// Build a cluster carrying the application-level pool defaults
    pub fn from_pool_config(name: impl Into<String>, config: &crate::config::PoolConfig) -> Self {
        Self::new(name)
            .with_connect_timeout(config.connect_timeout)
            .with_preconnect_ratio(config.preconnect_ratio)
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connect_timeout: Duration::from_secs(5),
            per_upstream_preconnect_ratio: 1.0,
            max_connection_duration: None,
            resource_manager: ResourceManager::default(),
            stats: ClusterStats::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_preconnect_ratio(mut self, ratio: f64) -> Self {
        self.per_upstream_preconnect_ratio = ratio;
        self
    }

    pub fn with_max_connection_duration(mut self, duration: Duration) -> Self {
        self.max_connection_duration = Some(duration);
        self
    }

    pub fn with_resource_manager(mut self, resource_manager: ResourceManager) -> Self {
        self.resource_manager = resource_manager;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn per_upstream_preconnect_ratio(&self) -> f64 {
        self.per_upstream_preconnect_ratio
    }

    pub fn max_connection_duration(&self) -> Option<Duration> {
        self.max_connection_duration
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource_manager
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }
}

/// One upstream endpoint
pub struct HostDescription {
    address: String,
    cluster: Arc<ClusterInfo>,
    health: AtomicU8,
}

impl fmt::Debug for HostDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDescription")
            .field("address", &self.address)
            .field("cluster", &self.cluster.name())
            .field("health", &self.health())
            .finish()
    }
}

impl HostDescription {
    pub fn new(address: impl Into<String>, cluster: Arc<ClusterInfo>) -> Self {
        Self { address: address.into(), cluster, health: AtomicU8::new(0) }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn cluster(&self) -> &Arc<ClusterInfo> {
        &self.cluster
    }

    pub fn health(&self) -> HostHealth {
        match self.health.load(Ordering::Relaxed) {
            0 => HostHealth::Healthy,
            1 => HostHealth::Degraded,
            _ => HostHealth::Unhealthy,
        }
    }

    pub fn set_health(&self, health: HostHealth) {
        let value = match health {
            HostHealth::Healthy => 0,
            HostHealth::Degraded => 1,
            HostHealth::Unhealthy => 2,
        };
        self.health.store(value, Ordering::Relaxed);
    }
}

/// Counters shared by every pool of a cluster. They aggregate the union of
/// the pools' internal state; at every quiescent point the sums must agree
/// with the pools. Mutated only on the owning worker's loop.
#[derive(Debug, Default)]
pub struct ClusterConnectivityState {
    active_streams: AtomicU64,
    pending_streams: AtomicU64,
    connecting_and_connected_stream_capacity: AtomicI64,
}

impl ClusterConnectivityState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_streams(&self) -> u64 {
        self.active_streams.load(Ordering::Relaxed)
    }

    pub fn pending_streams(&self) -> u64 {
        self.pending_streams.load(Ordering::Relaxed)
    }

    pub fn connecting_and_connected_stream_capacity(&self) -> i64 {
        self.connecting_and_connected_stream_capacity.load(Ordering::Relaxed)
    }

    pub fn incr_active_streams(&self, delta: u64) {
        self.active_streams.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn decr_active_streams(&self, delta: u64) {
        let previous = self.active_streams.fetch_sub(delta, Ordering::Relaxed);
        debug_assert!(previous >= delta, "active stream count underflow");
    }

    pub fn incr_pending_streams(&self, delta: u64) {
        self.pending_streams.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn decr_pending_streams(&self, delta: u64) {
        let previous = self.pending_streams.fetch_sub(delta, Ordering::Relaxed);
        debug_assert!(previous >= delta, "pending stream count underflow");
    }

    pub fn incr_connecting_and_connected_stream_capacity(&self, delta: i64) {
        self.connecting_and_connected_stream_capacity.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn decr_connecting_and_connected_stream_capacity(&self, delta: i64) {
        self.connecting_and_connected_stream_capacity.fetch_sub(delta, Ordering::Relaxed);
    }
}
