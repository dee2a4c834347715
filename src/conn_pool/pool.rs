//! The pool state machine.

use super::client::{ActiveClient, ClientId, ClientState};
use super::{CancelPolicy, ClientSpec, ConnectionEvent, DrainBehavior, PoolFailureReason, PoolHooks};
use crate::event::{Dispatcher, TimerId};
use crate::upstream::{ClusterConnectivityState, HostDescription, HostHealth};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Identifier (and cancel token) of a queued stream request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingStreamId(u64);

/// Outcome of a stream request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewStreamResult {
    /// Attached immediately to a ready client; `on_pool_ready` has run
    Attached(ClientId),
    /// Queued until a connection is ready; cancellable through the id
    Pending(PendingStreamId),
    /// Rejected; `on_pool_failure` has run
    Failed,
}

struct PendingStream<C> {
    id: PendingStreamId,
    context: C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Connect,
    ConnectionDuration,
}

/// Generic per-upstream connection pool.
///
/// Lives on one worker loop. Methods that can produce callbacks take the
/// shared [`Dispatcher`] and the owner's [`PoolHooks`] as parameters; the
/// hooks may re-enter the pool from inside a callback.
pub struct ConnPoolBase<C> {
    host: Arc<HostDescription>,
    state: Arc<ClusterConnectivityState>,
    clients: BTreeMap<ClientId, ActiveClient>,
    pending_streams: VecDeque<PendingStream<C>>,
    /// Capacity contributed by CONNECTING clients only
    connecting_stream_capacity: i64,
    num_active_streams: u64,
    idle_callbacks: Vec<Box<dyn FnMut()>>,
    is_draining_for_deletion: bool,
    timer_index: HashMap<TimerId, (ClientId, TimerKind)>,
    bug_events: u64,
    next_client_id: u64,
    next_stream_id: u64,
}

impl<C> ConnPoolBase<C> {
    pub fn new(host: Arc<HostDescription>, state: Arc<ClusterConnectivityState>) -> Self {
        Self {
            host,
            state,
            clients: BTreeMap::new(),
            pending_streams: VecDeque::new(),
            connecting_stream_capacity: 0,
            num_active_streams: 0,
            idle_callbacks: Vec::new(),
            is_draining_for_deletion: false,
            timer_index: HashMap::new(),
            bug_events: 0,
            next_client_id: 0,
            next_stream_id: 0,
        }
    }

    pub fn host(&self) -> &Arc<HostDescription> {
        &self.host
    }

    /// Request a stream. Attaches to a ready client when one exists,
    /// otherwise queues the request and creates connections up to the
    /// preconnect capacity target.
    pub fn new_stream(
        &mut self,
        context: C,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) -> NewStreamResult {
        debug_assert!(!self.is_draining_for_deletion, "new stream on a pool draining for deletion");

        if let Some(ready) = self.first_ready_client() {
            self.attach_stream_to_client(ready, context, dispatcher, hooks);
            // Even with a ready client, preconnect for the next stream.
            self.try_create_new_connections(dispatcher, hooks);
            return NewStreamResult::Attached(ready);
        }

        if self.host.cluster().resource_manager().pending_streams.can_create() {
            let id = self.add_pending_stream(context);
            // This must come after the stream is queued: connection counts
            // are derived from the pending queue length.
            self.try_create_new_connections(dispatcher, hooks);
            NewStreamResult::Pending(id)
        } else {
            debug!(host = %self.host.address(), "max pending streams overflow");
            self.host.cluster().stats().upstream_rq_pending_overflow.inc();
            let host = Arc::clone(&self.host);
            hooks.on_pool_failure(
                self,
                dispatcher,
                &host,
                "pending stream overflow",
                PoolFailureReason::Overflow,
                context,
            );
            NewStreamResult::Failed
        }
    }

    /// Cancel a queued stream request
    pub fn cancel_pending_stream(
        &mut self,
        id: PendingStreamId,
        policy: CancelPolicy,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        let Some(position) = self.pending_streams.iter().position(|pending| pending.id == id)
        else {
            return;
        };
        debug!(host = %self.host.address(), "cancelling pending stream");
        self.pending_streams.remove(position);
        self.state.decr_pending_streams(1);
        self.host.cluster().resource_manager().pending_streams.dec();

        if policy == CancelPolicy::CloseExcess {
            if let Some(excess) = self.newest_connecting_client() {
                let limit = self
                    .clients
                    .get(&excess)
                    .map(|client| client.effective_concurrent_stream_limit() as i64)
                    .unwrap_or(0);
                // Close the newest connection only when the rest still cover
                // every queued stream.
                if self.connecting_stream_capacity - limit
                    >= self.pending_streams.len() as i64
                {
                    debug!(client = %excess, "closing excess connection");
                    self.close_client(excess, dispatcher, None, hooks);
                }
            }
        }
        self.check_for_idle_and_notify();
    }

    /// Feed a connection-level event for one client into the pool
    pub fn on_connection_event(
        &mut self,
        client: ClientId,
        event: ConnectionEvent,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        match event {
            ConnectionEvent::Connected => self.on_client_connected(client, dispatcher, hooks),
            ConnectionEvent::LocalClose => {
                self.close_client(
                    client,
                    dispatcher,
                    Some(PoolFailureReason::LocalConnectionFailure),
                    hooks,
                );
            }
            ConnectionEvent::RemoteClose => {
                self.close_client(
                    client,
                    dispatcher,
                    Some(PoolFailureReason::RemoteConnectionFailure),
                    hooks,
                );
            }
        }
    }

    /// A stream on `client` finished
    pub fn on_stream_closed(
        &mut self,
        client_id: ClientId,
        delay_attaching_stream: bool,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        let (state, active_streams, capacity_regained) = {
            let Some(client) = self.clients.get_mut(&client_id) else {
                return;
            };
            debug_assert!(client.active_streams > 0, "stream closed on a streamless client");
            client.active_streams = client.active_streams.saturating_sub(1);
            debug!(client = %client_id, remaining = client.active_streams, "destroying stream");

            // Regrow shared capacity only when the client was limited by
            // concurrency (draining clients and lifetime-exhausted clients
            // contribute nothing), or when a concurrency reduction pushed
            // capacity negative.
            let limited_by_concurrency = client.remaining_streams
                > (client.concurrent_stream_limit as i64 - client.active_streams as i64 - 1)
                    .max(0) as u64;
            let negative_capacity = client.current_unused_capacity() < 0;
            (
                client.state(),
                client.active_streams,
                negative_capacity || limited_by_concurrency,
            )
        };

        self.num_active_streams = self.num_active_streams.saturating_sub(1);
        self.state.decr_active_streams(1);
        self.host.cluster().resource_manager().streams.dec();
        if capacity_regained {
            self.state.incr_connecting_and_connected_stream_capacity(1);
        }

        match state {
            ClientState::Draining if active_streams == 0 => {
                // Close out the draining client now that its streams are gone.
                self.close_client(client_id, dispatcher, None, hooks);
            }
            ClientState::Busy => {
                let reopened = self
                    .clients
                    .get(&client_id)
                    .map(|client| client.current_unused_capacity() > 0)
                    .unwrap_or(false);
                if reopened {
                    self.transition_client_state(client_id, ClientState::Ready);
                    if !delay_attaching_stream {
                        self.on_upstream_ready(dispatcher, hooks);
                    }
                }
            }
            _ => {}
        }
    }

    /// Dispatch a fired timer that belongs to this pool
    pub fn on_timer_fired(
        &mut self,
        timer: TimerId,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        let Some((client, kind)) = self.timer_index.remove(&timer) else {
            return;
        };
        match kind {
            TimerKind::Connect => self.on_connect_timeout(client, dispatcher, hooks),
            TimerKind::ConnectionDuration => {
                self.on_connection_duration_timeout(client, dispatcher, hooks)
            }
        }
    }

    /// The max-duration timer for `client` fired.
    ///
    /// Valid only after the handshake: the timer is armed on Connected, so a
    /// call in CONNECTING or CLOSED is a programmer error and is reported as
    /// a bug signal without crashing.
    pub fn on_connection_duration_timeout(
        &mut self,
        client_id: ClientId,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        let snapshot = self
            .clients
            .get(&client_id)
            .map(|client| (client.state(), client.active_streams()));
        match snapshot {
            None | Some((ClientState::Closed, _)) => {
                error!(client = %client_id, "max connection duration reached while closed");
                self.bug_events += 1;
            }
            Some((ClientState::Connecting, _)) => {
                error!(client = %client_id, "max connection duration reached while connecting");
                self.bug_events += 1;
            }
            Some((ClientState::Draining, _)) => {
                // Already draining; the stream-closed path finishes the job.
            }
            Some((ClientState::Ready | ClientState::Busy, active_streams)) => {
                self.host.cluster().stats().upstream_cx_max_duration_reached.inc();
                if active_streams == 0 {
                    debug!(client = %client_id, "max connection duration reached, closing");
                    self.close_client(client_id, dispatcher, None, hooks);
                } else {
                    debug!(client = %client_id, "max connection duration reached, draining");
                    self.transition_client_state(client_id, ClientState::Draining);
                }
            }
        }
    }

    /// Create at most one connection toward the preconnect target. Never
    /// preconnects below ratio 1, and only for a Healthy host. Returns
    /// whether a connection was created by this call.
    pub fn maybe_preconnect(
        &mut self,
        global_preconnect_ratio: f64,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) -> bool {
        self.try_create_new_connection(global_preconnect_ratio, dispatcher, hooks)
    }

    /// Register a callback run whenever the pool transitions into idleness.
    /// Registration alone never fires it.
    pub fn add_idle_callback(&mut self, callback: Box<dyn FnMut()>) {
        self.idle_callbacks.push(callback);
    }

    /// Whether the pool has no pending streams and no live clients
    pub fn is_idle(&self) -> bool {
        self.pending_streams.is_empty() && self.clients.is_empty()
    }

    /// Drain existing connections. `DrainAndDelete` additionally closes
    /// idle connections, schedules deletion once drained, and runs the idle
    /// callbacks after the final transition.
    pub fn drain_connections(
        &mut self,
        behavior: DrainBehavior,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        if behavior == DrainBehavior::DrainAndDelete {
            self.is_draining_for_deletion = true;
        }
        self.close_idle_connections_for_draining_pool(dispatcher, hooks);

        // Every remaining READY client is serving streams; drain them along
        // with the busy set.
        let to_drain: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| {
                matches!(client.state(), ClientState::Ready | ClientState::Busy)
            })
            .map(|(id, _)| *id)
            .collect();
        for client in to_drain {
            debug!(client = %client, "draining connection");
            self.transition_client_state(client, ClientState::Draining);
        }

        if self.is_draining_for_deletion {
            self.check_for_idle_and_notify();
        }
    }

    /// Close every connection, failing any outstanding pending streams, and
    /// flush the deferred-deletion list.
    pub fn destruct_all_connections(
        &mut self,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for client in ids {
            let failure = match self.clients.get(&client).map(ActiveClient::state) {
                Some(ClientState::Connecting) => {
                    Some(PoolFailureReason::LocalConnectionFailure)
                }
                _ => None,
            };
            self.close_client(client, dispatcher, failure, hooks);
        }
        dispatcher.clear_deferred_delete_list();
    }

    /// One-line human-readable pool summary
    pub fn dump_state(&self) -> String {
        let mut ready = 0usize;
        let mut busy = 0usize;
        let mut connecting = 0usize;
        for client in self.clients.values() {
            match client.state() {
                ClientState::Ready => ready += 1,
                ClientState::Busy | ClientState::Draining => busy += 1,
                ClientState::Connecting => connecting += 1,
                ClientState::Closed => {}
            }
        }
        format!(
            "ready_clients.len(): {}, busy_clients.len(): {}, connecting_clients.len(): {}, \
             connecting_stream_capacity: {}, num_active_streams: {}",
            ready, busy, connecting, self.connecting_stream_capacity, self.num_active_streams
        )
    }

    /// Pool-local view of capacity across CONNECTING and connected clients
    pub fn connecting_and_connected_capacity(&self) -> i64 {
        self.clients.values().map(ActiveClient::current_unused_capacity).sum()
    }

    /// Number of live (non-CLOSED) clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// State of one client, if it is still live
    pub fn client_state(&self, client: ClientId) -> Option<ClientState> {
        self.clients.get(&client).map(ActiveClient::state)
    }

    /// Access a live client
    pub fn client(&self, client: ClientId) -> Option<&ActiveClient> {
        self.clients.get(&client)
    }

    /// Live client ids in creation order
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Number of bug signals raised (timer callbacks in impossible states)
    pub fn bug_events(&self) -> u64 {
        self.bug_events
    }

    // ---- internals -------------------------------------------------------

    fn first_ready_client(&self) -> Option<ClientId> {
        self.clients
            .values()
            .find(|client| client.ready_for_stream())
            .map(ActiveClient::id)
    }

    fn newest_connecting_client(&self) -> Option<ClientId> {
        self.clients
            .values()
            .rev()
            .find(|client| client.state() == ClientState::Connecting)
            .map(ActiveClient::id)
    }

    fn add_pending_stream(&mut self, context: C) -> PendingStreamId {
        let id = PendingStreamId(self.next_stream_id);
        self.next_stream_id += 1;
        self.pending_streams.push_back(PendingStream { id, context });
        self.state.incr_pending_streams(1);
        self.host.cluster().resource_manager().pending_streams.inc();
        debug!(host = %self.host.address(), "queueing stream due to no available connections");
        id
    }

    /// `(pending + active + anticipated) * ratio > capacity + active`: the
    /// streams we want to be provisioned for exceed what is provisioned.
    fn should_connect(
        pending_streams: i64,
        active_streams: i64,
        capacity: i64,
        preconnect_ratio: f64,
        anticipate_incoming_stream: bool,
    ) -> bool {
        let anticipated = i64::from(anticipate_incoming_stream);
        (pending_streams + active_streams + anticipated) as f64 * preconnect_ratio
            > (capacity + active_streams) as f64
    }

    fn should_create_new_connection(&self, global_preconnect_ratio: f64) -> bool {
        // An unhealthy host gets no anticipatory work: connect only to cover
        // queued streams.
        if self.host.health() != HostHealth::Healthy {
            return self.pending_streams.len() as i64 > self.connecting_stream_capacity;
        }

        // Global preconnecting anticipates the next stream across the
        // cluster, never below ratio 1.
        if global_preconnect_ratio > 1.0
            && Self::should_connect(
                self.state.pending_streams() as i64,
                self.state.active_streams() as i64,
                self.state.connecting_and_connected_stream_capacity(),
                global_preconnect_ratio,
                true,
            )
        {
            return true;
        }

        Self::should_connect(
            self.pending_streams.len() as i64,
            self.num_active_streams as i64,
            self.connecting_and_connected_capacity(),
            self.host.cluster().per_upstream_preconnect_ratio(),
            false,
        )
    }

    fn try_create_new_connections(
        &mut self,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        // Cap the connections created per trigger; the next event picks up
        // any remaining deficit.
        for _ in 0..3 {
            if !self.try_create_new_connection(0.0, dispatcher, hooks) {
                break;
            }
        }
    }

    fn try_create_new_connection(
        &mut self,
        global_preconnect_ratio: f64,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) -> bool {
        if !self.should_create_new_connection(global_preconnect_ratio) {
            return false;
        }

        let can_create = self.host.cluster().resource_manager().connections.can_create();
        if !can_create {
            self.host.cluster().stats().upstream_cx_overflow.inc();
        }
        // At the connection limit because of other upstreams, a pool with no
        // connections at all may still overflow the limit rather than starve.
        if !(can_create || self.clients.is_empty()) {
            return false;
        }

        let spec = hooks.instantiate_active_client();
        self.create_client(spec, dispatcher);
        true
    }

    fn create_client(&mut self, spec: ClientSpec, dispatcher: &mut Dispatcher) {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;

        let connect_timer = dispatcher.arm_timer(self.host.cluster().connect_timeout());
        self.timer_index.insert(connect_timer, (id, TimerKind::Connect));

        let client = ActiveClient::new(
            id,
            spec.lifetime_stream_limit,
            spec.concurrent_stream_limit,
            Arc::clone(&self.host),
            connect_timer,
        );
        let capacity = client.effective_concurrent_stream_limit() as i64;
        self.connecting_stream_capacity += capacity;
        self.state.incr_connecting_and_connected_stream_capacity(capacity);
        self.host.cluster().stats().upstream_cx_total.inc();
        self.host.cluster().resource_manager().connections.inc();
        debug!(client = %id, host = %self.host.address(), "creating a new connection");
        self.clients.insert(id, client);
    }

    fn on_client_connected(
        &mut self,
        client_id: ClientId,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        let (connect_timer, unused) = {
            let Some(client) = self.clients.get_mut(&client_id) else {
                return;
            };
            if client.state() != ClientState::Connecting {
                warn!(client = %client_id, state = ?client.state(), "spurious connected event");
                return;
            }
            (client.connect_timer.take(), client.current_unused_capacity())
        };
        debug!(client = %client_id, host = %self.host.address(), "connected");

        if let Some(timer) = connect_timer {
            dispatcher.disarm_timer(timer);
            self.timer_index.remove(&timer);
        }
        // The capacity moves from the connecting bucket to the connected
        // one; the shared counter tracks both and does not change.
        self.connecting_stream_capacity -= unused;
        debug_assert!(self.connecting_stream_capacity >= 0, "connecting capacity underflow");

        self.transition_client_state(client_id, ClientState::Ready);

        // The connection-duration clock starts at handshake completion,
        // never at instantiation.
        if let Some(duration) = self.host.cluster().max_connection_duration() {
            let timer = dispatcher.arm_timer(duration);
            self.timer_index.insert(timer, (client_id, TimerKind::ConnectionDuration));
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.connection_duration_timer = Some(timer);
            }
        }

        self.on_upstream_ready(dispatcher, hooks);
    }

    fn on_upstream_ready(&mut self, dispatcher: &mut Dispatcher, hooks: &mut dyn PoolHooks<C>) {
        while !self.pending_streams.is_empty() {
            let Some(ready) = self.first_ready_client() else {
                break;
            };
            let Some(pending) = self.pending_streams.pop_front() else {
                break;
            };
            debug!(client = %ready, "attaching to next stream");
            self.state.decr_pending_streams(1);
            self.host.cluster().resource_manager().pending_streams.dec();
            self.attach_stream_to_client(ready, pending.context, dispatcher, hooks);
        }
        if !self.pending_streams.is_empty() {
            self.try_create_new_connections(dispatcher, hooks);
        }
    }

    fn attach_stream_to_client(
        &mut self,
        client_id: ClientId,
        context: C,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        let exhausted_lifetime = {
            let Some(client) = self.clients.get_mut(&client_id) else {
                return;
            };
            debug_assert!(client.ready_for_stream(), "attach to a client not ready for streams");
            let capacity = client.current_unused_capacity();
            client.remaining_streams = client.remaining_streams.saturating_sub(1);
            client.active_streams += 1;

            if client.remaining_streams == 0 {
                debug!(client = %client_id, "maximum streams per connection, draining");
                client.set_state(ClientState::Draining);
                true
            } else {
                if capacity == 1 {
                    // The new stream maxes the client out.
                    client.set_state(ClientState::Busy);
                }
                false
            }
        };
        if exhausted_lifetime {
            self.host.cluster().stats().upstream_cx_max_requests.inc();
        }

        self.num_active_streams += 1;
        self.state.incr_active_streams(1);
        self.state.decr_connecting_and_connected_stream_capacity(1);
        self.host.cluster().stats().upstream_rq_total.inc();
        self.host.cluster().resource_manager().streams.inc();
        debug!(client = %client_id, "creating stream");

        hooks.on_pool_ready(self, dispatcher, client_id, context);
    }

    fn on_connect_timeout(
        &mut self,
        client_id: ClientId,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        debug!(client = %client_id, "connect timeout");
        // The timer already fired; drop the handle so close does not disarm
        // a dead timer id.
        client.connect_timer = None;
        self.host.cluster().stats().upstream_cx_connect_timeout.inc();
        self.close_client(client_id, dispatcher, Some(PoolFailureReason::Timeout), hooks);
    }

    /// Remove a client from the pool. `failure` carries the reason when a
    /// CONNECTING close must fail the queued streams; an excess-capacity
    /// trim passes `None` and queued streams are untouched.
    fn close_client(
        &mut self,
        client_id: ClientId,
        dispatcher: &mut Dispatcher,
        failure: Option<PoolFailureReason>,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        let Some(mut client) = self.clients.remove(&client_id) else {
            return;
        };

        if let Some(timer) = client.connect_timer.take() {
            dispatcher.disarm_timer(timer);
            self.timer_index.remove(&timer);
        }
        if let Some(timer) = client.connection_duration_timer.take() {
            dispatcher.disarm_timer(timer);
            self.timer_index.remove(&timer);
        }

        let was_connecting = client.state() == ClientState::Connecting;
        self.state.decr_connecting_and_connected_stream_capacity(client.current_unused_capacity());
        if was_connecting {
            self.connecting_stream_capacity -= client.effective_concurrent_stream_limit() as i64;
            debug_assert!(self.connecting_stream_capacity >= 0, "connecting capacity underflow");
        }
        // No further capacity or stream accounting happens for this client.
        client.remaining_streams = 0;

        if client.active_streams > 0 {
            // Streams cut short by the close.
            self.num_active_streams =
                self.num_active_streams.saturating_sub(client.active_streams as u64);
            self.state.decr_active_streams(client.active_streams as u64);
            for _ in 0..client.active_streams {
                self.host.cluster().resource_manager().streams.dec();
            }
            client.active_streams = 0;
        }
        self.host.cluster().resource_manager().connections.dec();

        debug!(client = %client_id, host = %self.host.address(), "client disconnected");
        client.set_state(ClientState::Closed);
        dispatcher.defer_delete(Box::new(client));

        if was_connecting {
            if let Some(reason) = failure {
                self.purge_pending_streams(reason, dispatcher, hooks);
            }
        }
        self.check_for_idle_and_notify();
    }

    /// Fail every queued stream. The queue is detached first so a failure
    /// callback issuing a replacement `new_stream` re-queues cleanly.
    fn purge_pending_streams(
        &mut self,
        reason: PoolFailureReason,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        let to_purge = std::mem::take(&mut self.pending_streams);
        let host = Arc::clone(&self.host);
        for pending in to_purge {
            self.state.decr_pending_streams(1);
            host.cluster().resource_manager().pending_streams.dec();
            hooks.on_pool_failure(
                self,
                dispatcher,
                &host,
                "connection failure before stream attach",
                reason,
                pending.context,
            );
        }
    }

    fn close_idle_connections_for_draining_pool(
        &mut self,
        dispatcher: &mut Dispatcher,
        hooks: &mut dyn PoolHooks<C>,
    ) {
        let mut to_close: Vec<ClientId> = self
            .clients
            .values()
            .filter(|client| client.state() == ClientState::Ready && client.active_streams() == 0)
            .map(ActiveClient::id)
            .collect();
        if self.pending_streams.is_empty() {
            to_close.extend(
                self.clients
                    .values()
                    .filter(|client| client.state() == ClientState::Connecting)
                    .map(ActiveClient::id),
            );
        }
        for client in to_close {
            self.close_client(client, dispatcher, None, hooks);
        }
    }

    fn transition_client_state(&mut self, client_id: ClientId, state: ClientState) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.set_state(state);
        }
    }

    fn check_for_idle_and_notify(&mut self) {
        if self.is_idle() {
            debug!(
                host = %self.host.address(),
                draining_for_deletion = self.is_draining_for_deletion,
                "invoking idle callbacks"
            );
            for callback in &mut self.idle_callbacks {
                callback();
            }
        }
    }
}
