//! # Connection Pool Base
//!
//! A generic per-upstream pool multiplexing logical streams onto a bounded,
//! state-tracked population of physical connections, with preconnecting,
//! draining, idle detection, max-duration lifecycle, and resource-limit
//! arbitration.
//!
//! The pool is a synchronous state machine driven on one worker loop:
//! protocol glue feeds it connection events and fired timers, and receives
//! `on_pool_ready` / `on_pool_failure` callbacks through [`PoolHooks`]. The
//! hooks are a method parameter rather than pool state so a callback may
//! re-enter the pool (a failure handler issuing a retry stream is the normal
//! case, not an error).

mod client;
mod pool;

pub use client::{ActiveClient, ClientId, ClientState};
pub use pool::{ConnPoolBase, NewStreamResult, PendingStreamId};

use crate::event::Dispatcher;
use crate::upstream::HostDescription;
use std::sync::Arc;

/// Connection-level events fed into the pool by the protocol glue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    LocalClose,
    RemoteClose,
}

/// What to do with preconnected capacity when a pending stream is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Release the reservation but keep preconnected capacity
    Default,
    /// Additionally release one unit of connecting capacity, preventing
    /// overshoot when the caller abandons a preconnect
    CloseExcess,
}

/// How existing connections are treated on drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainBehavior {
    /// Stop accepting new streams; let existing streams complete
    DrainExistingConnections,
    /// Drain, and delete the pool's connections once drained
    DrainAndDelete,
}

/// Why a stream could not be provided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureReason {
    /// Pending-stream resource limit reached
    Overflow,
    /// The connection failed locally
    LocalConnectionFailure,
    /// The peer closed or refused the connection
    RemoteConnectionFailure,
    /// Connection establishment timed out
    Timeout,
}

/// Stream-capacity shape of a newly instantiated connection
#[derive(Debug, Clone, Copy)]
pub struct ClientSpec {
    /// Total streams the connection may ever carry (0 = unlimited)
    pub lifetime_stream_limit: u64,
    /// Streams the connection may carry concurrently
    pub concurrent_stream_limit: u32,
}

impl ClientSpec {
    /// Derive the capacity shape from the application-level pool defaults
    pub fn from_config(config: &crate::config::PoolConfig) -> Self {
        Self {
            lifetime_stream_limit: config.per_connection_stream_limit,
            concurrent_stream_limit: config.concurrent_stream_limit,
        }
    }
}

/// Callbacks from the pool to its protocol-specific owner.
///
/// `on_pool_failure` may call back into the pool (for example to create a
/// replacement stream); the pool is passed explicitly so the re-entry is a
/// plain method call.
pub trait PoolHooks<C> {
    /// Provide the capacity shape for a connection the pool is creating
    fn instantiate_active_client(&mut self) -> ClientSpec;

    /// A stream was attached to a connected client
    fn on_pool_ready(
        &mut self,
        pool: &mut ConnPoolBase<C>,
        dispatcher: &mut Dispatcher,
        client: ClientId,
        context: C,
    );

    /// A pending stream cannot be served
    fn on_pool_failure(
        &mut self,
        pool: &mut ConnPoolBase<C>,
        dispatcher: &mut Dispatcher,
        host: &Arc<HostDescription>,
        details: &str,
        reason: PoolFailureReason,
        context: C,
    );
}
