//! One physical upstream connection tracked by the pool.

use crate::event::TimerId;
use crate::upstream::HostDescription;
use std::fmt;
use std::sync::Arc;

/// Pool-scoped identifier of an active client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a client. A client is in exactly one state; the pool's
/// bucket views are derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// TCP/handshake in progress
    Connecting,
    /// Connected and able to accept streams
    Ready,
    /// Connected but at stream capacity
    Busy,
    /// Accepting no new streams; existing streams drain
    Draining,
    /// Connection gone; resources released via deferred delete
    Closed,
}

/// One physical connection: state, stream capacity, and timers
pub struct ActiveClient {
    id: ClientId,
    state: ClientState,
    pub(crate) remaining_streams: u64,
    pub(crate) concurrent_stream_limit: u32,
    pub(crate) active_streams: u32,
    pub(crate) connect_timer: Option<TimerId>,
    pub(crate) connection_duration_timer: Option<TimerId>,
    host: Arc<HostDescription>,
}

impl fmt::Debug for ActiveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveClient")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("remaining_streams", &self.remaining_streams)
            .field("active_streams", &self.active_streams)
            .finish()
    }
}

impl ActiveClient {
    pub(crate) fn new(
        id: ClientId,
        lifetime_stream_limit: u64,
        concurrent_stream_limit: u32,
        host: Arc<HostDescription>,
        connect_timer: TimerId,
    ) -> Self {
        Self {
            id,
            state: ClientState::Connecting,
            remaining_streams: translate_zero_to_unlimited(lifetime_stream_limit),
            concurrent_stream_limit: concurrent_stream_limit.max(1),
            active_streams: 0,
            connect_timer: Some(connect_timer),
            connection_duration_timer: None,
            host,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ClientState) {
        self.state = state;
    }

    pub fn host(&self) -> &Arc<HostDescription> {
        &self.host
    }

    pub fn active_streams(&self) -> u32 {
        self.active_streams
    }

    pub fn remaining_streams(&self) -> u64 {
        self.remaining_streams
    }

    /// The max-duration timer, present only after the client connected on a
    /// cluster declaring a max connection duration
    pub fn connection_duration_timer(&self) -> Option<TimerId> {
        self.connection_duration_timer
    }

    /// Streams this client could still serve right now. Negative when the
    /// concurrency limit dropped below the in-flight stream count.
    pub fn current_unused_capacity(&self) -> i64 {
        let concurrency_capacity =
            self.concurrent_stream_limit as i64 - self.active_streams as i64;
        (self.remaining_streams.min(i64::MAX as u64) as i64).min(concurrency_capacity)
    }

    /// Capacity the client contributes while connecting: its concurrency
    /// limit bounded by remaining lifetime streams
    pub fn effective_concurrent_stream_limit(&self) -> u64 {
        self.remaining_streams.min(self.concurrent_stream_limit as u64)
    }

    /// Whether the pool may attach another stream here
    pub fn ready_for_stream(&self) -> bool {
        self.state == ClientState::Ready && self.current_unused_capacity() > 0
    }
}

fn translate_zero_to_unlimited(limit: u64) -> u64 {
    if limit == 0 {
        u64::MAX
    } else {
        limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::ClusterInfo;

    fn test_client(lifetime: u64, concurrent: u32) -> ActiveClient {
        let cluster = Arc::new(ClusterInfo::new("backend"));
        let host = Arc::new(HostDescription::new("tcp://127.0.0.1:80", cluster));
        ActiveClient::new(ClientId(0), lifetime, concurrent, host, crate::event::Dispatcher::new().arm_timer(std::time::Duration::from_secs(1)))
    }

    #[test]
    fn capacity_is_bounded_by_both_limits() {
        let mut client = test_client(100, 4);
        assert_eq!(client.current_unused_capacity(), 4);
        assert_eq!(client.effective_concurrent_stream_limit(), 4);

        client.active_streams = 3;
        assert_eq!(client.current_unused_capacity(), 1);

        client.remaining_streams = 0;
        assert_eq!(client.current_unused_capacity(), 0);
    }

    #[test]
    fn zero_lifetime_limit_means_unlimited() {
        let client = test_client(0, 2);
        assert_eq!(client.remaining_streams(), u64::MAX);
        assert_eq!(client.effective_concurrent_stream_limit(), 2);
    }

    #[test]
    fn capacity_can_go_negative_under_concurrency_reduction() {
        let mut client = test_client(100, 4);
        client.active_streams = 4;
        client.concurrent_stream_limit = 2;
        assert_eq!(client.current_unused_capacity(), -2);
        assert!(!client.ready_for_stream());
    }
}
