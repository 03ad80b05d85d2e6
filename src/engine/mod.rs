//! The request-dispatch engine.
//!
//! One [Engine] serves one address family. It owns the routing table, the
//! peer directory and the value store, answers every incoming request, and
//! keeps itself healthy with periodic maintenance and bootstrap episodes.
//! Sockets and iterative lookups stay behind the [RpcTransport] and
//! [TaskScheduler] seams.

mod bootstrap;
mod handlers;
mod maintenance;
mod siblings;

pub use siblings::SiblingRegistry;

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, info, warn};

use bootstrap::{BootstrapState, RouterCache};
use maintenance::MaintenanceTimers;
use siblings::SharedTable;

use crate::common::{
    is_bogon, Id, PeerContact, BOOTSTRAP_IF_LESS_THAN, ROUTER_BOOTSTRAP_IF_LESS_THAN,
};
use crate::config::Config;
use crate::directory::PeerDirectory;
use crate::messages::{Message, MessageBody, RequestSpecific, RequestTypeSpecific};
use crate::routing_table::{self, bucket_fill_target, RoutingTable};
use crate::scheduler::{NodeLookup, Priority, TaskId, TaskScheduler};
use crate::storage::{ValueStore, MAX_VALUES};
use crate::transport::{EndpointId, RpcTransport, TransportEvent};
use crate::Result;

/// Client version advertised in outgoing messages.
pub const VERSION: [u8; 4] = *b"KN\x00\x01";

/// A lookup for the same target within this window is not enqueued again.
const RECENT_LOOKUP_WINDOW: Duration = Duration::from_secs(5 * 60);
const RECENT_LOOKUPS_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Initializing,
    Running,
}

/// Embedder veto over incoming requests, consulted before any state changes.
/// Returning `false` drops the request silently.
pub trait RequestFilter: Send {
    fn allow(&mut self, from: SocketAddr, request: &RequestSpecific) -> bool;
}

/// Observer of swarm activity, for crawlers and indexers.
pub trait IndexingObserver: Send {
    /// An infohash was looked up via get_peers. Returned contacts are merged
    /// into the response sample, letting an indexer inject peers it knows.
    fn lookup_observed(&mut self, _info_hash: &Id, _from: SocketAddr) -> Vec<PeerContact> {
        Vec::new()
    }

    /// A peer announced itself for an infohash.
    fn announce_observed(&mut self, _info_hash: &Id, _peer: &PeerContact) {}
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub received_requests: u64,
    pub sent_responses: u64,
    pub sent_errors: u64,
    pub dropped_requests: u64,
    pub timeouts: u64,
    pub table_size: usize,
    pub stored_peers: usize,
    pub stored_values: usize,
    pub pending_lookups: usize,
}

#[derive(Debug, Default)]
struct Counters {
    received_requests: u64,
    sent_responses: u64,
    sent_errors: u64,
    dropped_requests: u64,
    timeouts: u64,
}

pub struct Engine {
    config: Config,
    status: Status,

    // Populated on start, released on stop.
    id: Option<Id>,
    table: Option<SharedTable>,
    directory: Option<PeerDirectory>,
    store: Option<ValueStore>,
    transport: Option<Box<dyn RpcTransport>>,
    scheduler: Option<Box<dyn TaskScheduler>>,
    completions: Option<flume::Receiver<TaskId>>,
    timers: Option<MaintenanceTimers>,

    siblings: SiblingRegistry,
    bootstrap: BootstrapState,
    routers: RouterCache,
    recent_lookups: LruCache<Id, Instant>,
    next_transaction_id: u16,

    filter: Option<Box<dyn RequestFilter>>,
    status_observers: Vec<Box<dyn Fn(Status, Status) + Send>>,
    stats_observers: Vec<Box<dyn Fn(&Stats) + Send>>,
    indexing_observers: Vec<Box<dyn IndexingObserver>>,
    counters: Counters,
}

impl Engine {
    pub fn new(config: Config) -> Engine {
        let routers = RouterCache::new(config.bootstrap_hosts().to_vec(), config.family());

        Engine {
            config,
            status: Status::Stopped,
            id: None,
            table: None,
            directory: None,
            store: None,
            transport: None,
            scheduler: None,
            completions: None,
            timers: None,
            siblings: SiblingRegistry::new(),
            bootstrap: BootstrapState::new(),
            routers,
            recent_lookups: LruCache::new(
                NonZeroUsize::new(RECENT_LOOKUPS_CAP).unwrap_or(NonZeroUsize::MIN),
            ),
            next_transaction_id: 0,
            filter: None,
            status_observers: Vec::new(),
            stats_observers: Vec::new(),
            indexing_observers: Vec::new(),
            counters: Counters::default(),
        }
    }

    /// Join a sibling group shared with the engine of the other address
    /// family. Must be called before [Engine::start].
    pub fn with_siblings(mut self, siblings: SiblingRegistry) -> Engine {
        self.siblings = siblings;
        self
    }

    // === Observers ===

    pub fn add_status_observer(&mut self, observer: impl Fn(Status, Status) + Send + 'static) {
        self.status_observers.push(Box::new(observer));
    }

    /// Called with a fresh [Stats] snapshot on every tick.
    pub fn add_stats_observer(&mut self, observer: impl Fn(&Stats) + Send + 'static) {
        self.stats_observers.push(Box::new(observer));
    }

    pub fn add_indexing_observer(&mut self, observer: Box<dyn IndexingObserver>) {
        self.indexing_observers.push(observer);
    }

    pub fn set_request_filter(&mut self, filter: Box<dyn RequestFilter>) {
        self.filter = Some(filter);
    }

    // === Getters ===

    pub fn status(&self) -> Status {
        self.status
    }

    /// The node id, available while the engine is running.
    pub fn id(&self) -> Option<Id> {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrap.is_bootstrapping()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            received_requests: self.counters.received_requests,
            sent_responses: self.counters.sent_responses,
            sent_errors: self.counters.sent_errors,
            dropped_requests: self.counters.dropped_requests,
            timeouts: self.counters.timeouts,
            table_size: self.with_table(|table| table.size()).unwrap_or(0),
            stored_peers: self
                .directory
                .as_ref()
                .map(|directory| directory.peer_count())
                .unwrap_or(0),
            stored_values: self.store.as_ref().map(|store| store.len()).unwrap_or(0),
            pending_lookups: self
                .scheduler
                .as_ref()
                .map(|scheduler| scheduler.pending())
                .unwrap_or(0),
        }
    }

    // === Lifecycle ===

    /// Bring the engine up: allocate its stores, register with the sibling
    /// group and kick off the first bootstrap.
    pub fn start(
        &mut self,
        transport: Box<dyn RpcTransport>,
        scheduler: Box<dyn TaskScheduler>,
        completions: flume::Receiver<TaskId>,
    ) -> Result<()> {
        if self.status != Status::Stopped {
            warn!(family = %self.config.family(), "Engine already started");
            return Ok(());
        }

        self.set_status(Status::Initializing);

        let table = self.build_table();
        let id = *table.id();
        let table: SharedTable = Arc::new(Mutex::new(table));

        if let Err(error) = self.siblings.register(self.config.family(), table.clone()) {
            self.set_status(Status::Stopped);
            return Err(error);
        }

        self.id = Some(id);
        self.table = Some(table);
        self.directory = Some(PeerDirectory::new());
        self.store = Some(ValueStore::new(
            NonZeroUsize::new(MAX_VALUES).unwrap_or(NonZeroUsize::MIN),
        ));
        self.transport = Some(transport);
        self.scheduler = Some(scheduler);
        self.completions = Some(completions);
        self.timers = Some(MaintenanceTimers::new(Instant::now()));

        if self.config.router_bootstrap() {
            self.routers.refresh();
        }

        info!(family = %self.config.family(), %id, "Engine started");
        self.set_status(Status::Running);

        self.bootstrap_if_needed(Instant::now());

        Ok(())
    }

    /// Wind the engine down: persist the table, leave the sibling group and
    /// release every store.
    pub fn stop(&mut self) {
        if self.status == Status::Stopped {
            return;
        }

        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.cancel_all();
        }
        self.bootstrap.abort();
        self.persist_table();
        self.siblings.unregister(self.config.family());

        self.id = None;
        self.table = None;
        self.directory = None;
        self.store = None;
        self.transport = None;
        self.scheduler = None;
        self.completions = None;
        self.timers = None;

        info!(family = %self.config.family(), "Engine stopped");
        self.set_status(Status::Stopped);
    }

    // === Event handling ===

    /// Feed one transport event through the engine. Everything the wire
    /// delivers goes through here.
    pub fn handle_event(&mut self, event: TransportEvent) {
        if self.status != Status::Running {
            return;
        }

        match event {
            TransportEvent::Incoming {
                endpoint,
                from,
                message,
            } => self.handle_message(endpoint, from, message),
            TransportEvent::Timeout { endpoint: _, call } => {
                self.counters.timeouts += 1;
                self.with_table(|table| table.record_timeout(call.to));
            }
        }
    }

    /// Run due maintenance. Cheap when nothing is due; meant to be called
    /// frequently from the driving loop.
    pub fn tick(&mut self) {
        if self.status != Status::Running {
            return;
        }

        let now = Instant::now();

        self.drain_completions();

        // The timers stay in place while the chores run; a chore that panics
        // (and is caught at the loop boundary) must not leave maintenance
        // disabled for every later tick.
        let Some((liveness, discovery, expiry, persist)) = self.timers.as_mut().map(|timers| {
            (
                timers.liveness_ping_due(now),
                timers.discovery_lookup_due(now),
                timers.expiry_due(now),
                timers.persist_due(now),
            )
        }) else {
            return;
        };

        if liveness {
            self.liveness_pings();
        }
        if discovery {
            self.discovery_lookups();
        }
        if expiry {
            self.expiry_sweep(now);
        }
        if persist {
            self.persist_table();
        }

        self.bootstrap_if_needed(now);

        if !self.stats_observers.is_empty() {
            let stats = self.stats();
            for observer in &self.stats_observers {
                observer(&stats);
            }
        }
    }

    // === Private ===

    fn handle_message(&mut self, endpoint: EndpointId, from: SocketAddr, message: Message) {
        let Message {
            transaction_id,
            version,
            body,
        } = message;

        match body {
            MessageBody::Request(request) => {
                self.handle_request(endpoint, from, transaction_id, version, request)
            }
            MessageBody::Response(response) => {
                let responder = response.responder_id();

                if !is_bogon(&from) && Some(responder) != self.id {
                    self.with_table(|table| table.record_seen(responder, from));
                }
            }
            MessageBody::Error(error) => {
                debug!(
                    code = error.code,
                    description = %error.description,
                    %from,
                    "Received error response"
                );
            }
        }
    }

    fn build_table(&self) -> RoutingTable {
        match (self.config.id(), self.config.table_path()) {
            (Some(id), Some(path)) => {
                let mut table = RoutingTable::new(id);
                if path.exists() {
                    if let Err(error) = table.load(&path) {
                        debug!(?error, path = %path.display(), "Failed to load table snapshot");
                    }
                }
                table
            }
            (Some(id), None) => RoutingTable::new(id),
            (None, Some(path)) if path.exists() => {
                routing_table::restore(&path).unwrap_or_else(|error| {
                    debug!(?error, path = %path.display(), "Failed to restore table snapshot");
                    RoutingTable::new(Id::random())
                })
            }
            _ => RoutingTable::new(Id::random()),
        }
    }

    fn set_status(&mut self, new: Status) {
        let old = self.status;
        if old == new {
            return;
        }

        self.status = new;

        for observer in &self.status_observers {
            observer(old, new);
        }
    }

    fn with_table<R>(&self, f: impl FnOnce(&mut RoutingTable) -> R) -> Option<R> {
        self.table
            .as_ref()
            .map(|table| f(&mut table.lock().unwrap_or_else(PoisonError::into_inner)))
    }

    fn endpoints(&self) -> Vec<EndpointId> {
        self.transport
            .as_ref()
            .map(|transport| transport.endpoints())
            .unwrap_or_default()
    }

    fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    fn ping(&mut self, endpoint: EndpointId, to: SocketAddr, id: Id) {
        let transaction_id = self.next_transaction_id();

        let mut message = Message::request(transaction_id, id, RequestTypeSpecific::Ping);
        message.version = Some(VERSION.to_vec());

        if let Some(transport) = self.transport.as_mut() {
            transport.send(endpoint, to, message);
        }
    }

    /// Enqueue a node lookup, skipping targets looked up recently. High
    /// priority lookups (bootstrap) bypass the deduplication.
    fn schedule_lookup(
        &mut self,
        endpoint: EndpointId,
        target: Id,
        seeds: Vec<SocketAddr>,
        priority: Priority,
    ) -> Option<TaskId> {
        let now = Instant::now();

        if priority == Priority::Normal {
            if let Some(at) = self.recent_lookups.get(&target) {
                if now.duration_since(*at) < RECENT_LOOKUP_WINDOW {
                    return None;
                }
            }
        }

        let scheduler = self.scheduler.as_mut()?;
        let task = scheduler.enqueue(
            NodeLookup {
                endpoint,
                target,
                seeds,
            },
            priority,
        );

        self.recent_lookups.put(target, now);

        Some(task)
    }

    // === Bootstrap ===

    fn bootstrap_if_needed(&mut self, now: Instant) {
        let size = self.with_table(|table| table.size()).unwrap_or(0);

        // A healthy table still refreshes its neighborhood once the
        // discovery interval has passed since the last episode.
        let healthy = size >= BOOTSTRAP_IF_LESS_THAN;
        if (healthy && !self.bootstrap.refresh_due(now)) || !self.bootstrap.can_start(now) {
            return;
        }

        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            return;
        }

        let seeds = if self.config.router_bootstrap() && size < ROUTER_BOOTSTRAP_IF_LESS_THAN {
            let addresses = self.routers.addresses();
            if addresses.is_empty() {
                self.routers.refresh();
            }
            addresses
        } else {
            Vec::new()
        };

        // An empty table with no routers to seed from can only wait for
        // resolution (or for a stranger to find us).
        if seeds.is_empty() && size == 0 {
            return;
        }

        self.bootstrap.begin(now);
        info!(family = %self.config.family(), table_size = size, "Bootstrapping");

        for endpoint in endpoints {
            let target = self
                .transport
                .as_ref()
                .and_then(|transport| transport.derived_id(endpoint))
                .or(self.id);
            let Some(target) = target else {
                continue;
            };

            if let Some(task) = self.schedule_lookup(endpoint, target, seeds.clone(), Priority::High)
            {
                self.bootstrap.track(task);
            }
        }
    }

    fn drain_completions(&mut self) {
        let finished: Vec<TaskId> = self
            .completions
            .as_ref()
            .map(|completions| completions.try_iter().collect())
            .unwrap_or_default();

        for task in finished {
            if self.bootstrap.complete(task) {
                debug!(family = %self.config.family(), "Bootstrap episode finished");
                self.fill_sparse_buckets();
            }
        }
    }

    /// After a bootstrap that left the table below the healthy threshold,
    /// look up a random id inside every bucket that is occupied but under
    /// half full.
    fn fill_sparse_buckets(&mut self) {
        let Some(id) = self.id else {
            return;
        };
        let Some(&endpoint) = self.endpoints().first() else {
            return;
        };
        if self.with_table(|table| table.size()).unwrap_or(0) >= BOOTSTRAP_IF_LESS_THAN {
            return;
        }

        let distances = self
            .with_table(|table| table.under_populated_buckets())
            .unwrap_or_default();

        for distance in distances {
            let target = bucket_fill_target(&id, distance);
            let _ = self.schedule_lookup(endpoint, target, Vec::new(), Priority::Normal);
        }
    }

    // === Maintenance chores ===

    fn liveness_pings(&mut self) {
        let Some(id) = self.id else {
            return;
        };

        for endpoint in self.endpoints() {
            let idle = self
                .transport
                .as_ref()
                .map(|transport| transport.active_calls(endpoint) == 0)
                .unwrap_or(false);
            if !idle {
                continue;
            }

            if let Some(Some(node)) = self.with_table(|table| table.random_entry()) {
                self.ping(endpoint, node.address(), id);
            }
        }
    }

    /// One random-target lookup per endpoint, to stay discoverable across
    /// the whole key space.
    fn discovery_lookups(&mut self) {
        for endpoint in self.endpoints() {
            let _ = self.schedule_lookup(endpoint, Id::random(), Vec::new(), Priority::Normal);
        }
    }

    fn expiry_sweep(&mut self, now: Instant) {
        if let Some(directory) = self.directory.as_mut() {
            directory.expire(now);
        }
        if let Some(store) = self.store.as_mut() {
            store.cleanup(now);
        }

        let to_ping = self
            .with_table(|table| table.purge_and_ping_candidates())
            .unwrap_or_default();

        if let (Some(id), Some(&endpoint)) = (self.id, self.endpoints().first()) {
            for address in to_ping {
                self.ping(endpoint, address, id);
            }
        }

        let expired: Vec<Id> = self
            .recent_lookups
            .iter()
            .filter(|(_, at)| now.duration_since(**at) > RECENT_LOOKUP_WINDOW)
            .map(|(target, _)| *target)
            .collect();
        for target in expired {
            self.recent_lookups.pop(&target);
        }
    }

    fn persist_table(&mut self) {
        let Some(path) = self.config.table_path() else {
            return;
        };

        // A nearly empty table is not worth overwriting a previous snapshot.
        if self
            .with_table(|table| table.is_in_survival_mode())
            .unwrap_or(true)
        {
            return;
        }

        if let Some(Err(error)) = self.with_table(|table| table.save(&path)) {
            warn!(?error, path = %path.display(), "Failed to persist routing table");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::maintenance::LIVENESS_PING_INTERVAL;
    use super::*;
    use crate::common::{AddressFamily, BOOTSTRAP_MIN_INTERVAL, DISCOVERY_LOOKUP_INTERVAL};
    use crate::scheduler::TaskQueue;
    use crate::transport::{ChannelTransport, Outbound};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub(crate) fn started_engine() -> (Engine, flume::Receiver<Outbound>, crate::scheduler::TaskDriver)
    {
        let config = Config::new(AddressFamily::V4).without_router_bootstrap();
        let mut engine = Engine::new(config);

        let (transport, outbound) = ChannelTransport::new(vec![Id::random()]);
        let (queue, driver, completions) = TaskQueue::new();

        engine
            .start(Box::new(transport), Box::new(queue), completions)
            .expect("start");

        (engine, outbound, driver)
    }

    #[test]
    fn lifecycle_transitions_notify_observers() {
        let changes = Arc::new(AtomicUsize::new(0));
        let seen = changes.clone();

        let mut engine = Engine::new(Config::new(AddressFamily::V4).without_router_bootstrap());
        engine.add_status_observer(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let (transport, _outbound) = ChannelTransport::new(vec![Id::random()]);
        let (queue, _driver, completions) = TaskQueue::new();

        engine
            .start(Box::new(transport), Box::new(queue), completions)
            .expect("start");
        assert_eq!(engine.status(), Status::Running);
        assert!(engine.id().is_some());

        engine.stop();
        assert_eq!(engine.status(), Status::Stopped);
        assert!(engine.id().is_none());

        // Stopped -> Initializing -> Running -> Stopped.
        assert_eq!(changes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn one_engine_per_family_in_a_group() {
        let siblings = SiblingRegistry::new();

        let (engine, _outbound, _driver) = {
            let config = Config::new(AddressFamily::V4).without_router_bootstrap();
            let mut engine = Engine::new(config).with_siblings(siblings.clone());

            let (transport, outbound) = ChannelTransport::new(vec![Id::random()]);
            let (queue, driver, completions) = TaskQueue::new();
            engine
                .start(Box::new(transport), Box::new(queue), completions)
                .expect("start");

            (engine, outbound, driver)
        };

        let mut second = Engine::new(Config::new(AddressFamily::V4).without_router_bootstrap())
            .with_siblings(siblings);
        let (transport, _outbound) = ChannelTransport::new(vec![Id::random()]);
        let (queue, _driver, completions) = TaskQueue::new();

        assert!(second
            .start(Box::new(transport), Box::new(queue), completions)
            .is_err());
        assert_eq!(second.status(), Status::Stopped);

        drop(engine);
    }

    #[test]
    fn stop_frees_the_family_slot() {
        let siblings = SiblingRegistry::new();

        let mut engine = Engine::new(Config::new(AddressFamily::V4).without_router_bootstrap())
            .with_siblings(siblings.clone());
        let (transport, _outbound) = ChannelTransport::new(vec![Id::random()]);
        let (queue, _driver, completions) = TaskQueue::new();
        engine
            .start(Box::new(transport), Box::new(queue), completions)
            .expect("start");

        engine.stop();

        assert!(!siblings.registered(AddressFamily::V4));
    }

    #[test]
    fn events_are_ignored_while_stopped() {
        let mut engine = Engine::new(Config::new(AddressFamily::V4).without_router_bootstrap());

        engine.handle_event(TransportEvent::Incoming {
            endpoint: EndpointId(0),
            from: ([93, 184, 216, 34], 6881).into(),
            message: Message::request(1, Id::random(), RequestTypeSpecific::Ping),
        });

        assert_eq!(engine.stats(), Stats::default());
    }

    #[test]
    fn bootstrap_waits_for_contacts_without_routers() {
        let (mut engine, _outbound, _driver) = started_engine();

        // Empty table, router bootstrap disabled: nothing to look up yet.
        engine.tick();
        assert!(!engine.is_bootstrapping());
        assert_eq!(engine.stats().pending_lookups, 0);

        // One contact is enough to seed an episode.
        engine.handle_event(TransportEvent::Incoming {
            endpoint: EndpointId(0),
            from: ([93, 184, 216, 34], 6881).into(),
            message: Message::request(1, Id::random(), RequestTypeSpecific::Ping),
        });
        engine.tick();

        assert!(engine.is_bootstrapping());
        assert_eq!(engine.stats().pending_lookups, 1);
    }

    #[test]
    fn bootstrap_episodes_are_single_flight() {
        let (mut engine, _outbound, driver) = started_engine();

        engine.handle_event(TransportEvent::Incoming {
            endpoint: EndpointId(0),
            from: ([93, 184, 216, 34], 6881).into(),
            message: Message::request(1, Id::random(), RequestTypeSpecific::Ping),
        });
        engine.tick();
        assert!(engine.is_bootstrapping());

        // Still in-flight: further ticks must not enqueue more lookups.
        engine.tick();
        engine.tick();
        assert_eq!(engine.stats().pending_lookups, 1);

        let (task, _lookup) = driver.next().expect("lookup queued");
        driver.complete(task);
        engine.tick();

        assert!(!engine.is_bootstrapping());

        // Finished, but the minimum interval keeps a new episode from
        // starting right away.
        engine.tick();
        assert!(!engine.is_bootstrapping());
    }

    #[test]
    fn timeouts_mark_failures_only_while_running() {
        let (mut engine, _outbound, _driver) = started_engine();

        let from: SocketAddr = ([93, 184, 216, 34], 6881).into();
        engine.handle_event(TransportEvent::Incoming {
            endpoint: EndpointId(0),
            from,
            message: Message::request(1, Id::random(), RequestTypeSpecific::Ping),
        });
        assert_eq!(engine.stats().table_size, 1);

        engine.handle_event(TransportEvent::Timeout {
            endpoint: EndpointId(0),
            call: crate::transport::CallInfo {
                to: from,
                expected_id: None,
            },
        });
        assert_eq!(engine.stats().timeouts, 1);

        engine.stop();
        engine.handle_event(TransportEvent::Timeout {
            endpoint: EndpointId(0),
            call: crate::transport::CallInfo {
                to: from,
                expected_id: None,
            },
        });
        // Not counted after stop.
        assert_eq!(engine.stats().timeouts, 1);
    }

    #[test]
    fn maintenance_survives_a_panicking_chore() {
        use std::panic::{catch_unwind, AssertUnwindSafe};

        #[derive(Debug)]
        struct FlakyTransport {
            inner: ChannelTransport,
            tripped: AtomicBool,
        }

        impl RpcTransport for FlakyTransport {
            fn endpoints(&self) -> Vec<EndpointId> {
                self.inner.endpoints()
            }

            fn derived_id(&self, endpoint: EndpointId) -> Option<Id> {
                self.inner.derived_id(endpoint)
            }

            fn send(&mut self, endpoint: EndpointId, to: SocketAddr, message: Message) {
                self.inner.send(endpoint, to, message)
            }

            fn active_calls(&self, endpoint: EndpointId) -> usize {
                if !self.tripped.swap(true, Ordering::SeqCst) {
                    panic!("transport hiccup");
                }
                self.inner.active_calls(endpoint)
            }
        }

        let mut engine = Engine::new(Config::new(AddressFamily::V4).without_router_bootstrap());
        let (inner, _outbound) = ChannelTransport::new(vec![Id::random()]);
        let (queue, _driver, completions) = TaskQueue::new();
        engine
            .start(
                Box::new(FlakyTransport {
                    inner,
                    tripped: AtomicBool::new(false),
                }),
                Box::new(queue),
                completions,
            )
            .expect("start");

        let snapshots = Arc::new(AtomicUsize::new(0));
        let seen = snapshots.clone();
        engine.add_stats_observer(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        // Make the liveness chore due so the tick reaches the transport.
        engine.timers = Some(MaintenanceTimers::new(
            Instant::now() - LIVENESS_PING_INTERVAL,
        ));
        assert!(catch_unwind(AssertUnwindSafe(|| engine.tick())).is_err());

        // One failed tick must not disable maintenance for good.
        engine.tick();
        engine.tick();
        assert_eq!(snapshots.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn healthy_tables_refresh_on_the_discovery_interval() {
        let (mut engine, _outbound, driver) = started_engine();
        let id = engine.id().expect("running");

        // Fill the table well past the healthy threshold, one contact per
        // bucket so nothing gets evicted.
        for (i, distance) in (100..140_u8).enumerate() {
            engine.handle_event(TransportEvent::Incoming {
                endpoint: EndpointId(0),
                from: ([93, 184, 216, i as u8], 6881).into(),
                message: Message::request(
                    1,
                    id.random_at_distance(distance),
                    RequestTypeSpecific::Ping,
                ),
            });
        }
        assert!(engine.stats().table_size >= BOOTSTRAP_IF_LESS_THAN);

        // A healthy node that never bootstrapped refreshes right away.
        let start = Instant::now();
        engine.bootstrap_if_needed(start);
        assert!(engine.is_bootstrapping());

        let (task, _lookup) = driver.next().expect("lookup queued");
        driver.complete(task);
        engine.tick();
        assert!(!engine.is_bootstrapping());

        // Healthy and recently refreshed: nothing to do yet.
        engine.bootstrap_if_needed(start + BOOTSTRAP_MIN_INTERVAL);
        assert!(!engine.is_bootstrapping());

        // The discovery interval elapsed: refresh despite the full table.
        engine.bootstrap_if_needed(start + DISCOVERY_LOOKUP_INTERVAL);
        assert!(engine.is_bootstrapping());
    }

    #[test]
    fn stats_observers_get_a_snapshot_per_tick() {
        let (mut engine, _outbound, _driver) = started_engine();

        let snapshots = Arc::new(AtomicUsize::new(0));
        let seen = snapshots.clone();
        engine.add_stats_observer(move |stats| {
            assert_eq!(stats.table_size, 1);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        engine.handle_event(TransportEvent::Incoming {
            endpoint: EndpointId(0),
            from: ([93, 184, 216, 34], 6881).into(),
            message: Message::request(1, Id::random(), RequestTypeSpecific::Ping),
        });

        engine.tick();
        engine.tick();

        assert_eq!(snapshots.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn responses_refresh_the_table() {
        let (mut engine, _outbound, _driver) = started_engine();

        let responder = Id::random();
        engine.handle_event(TransportEvent::Incoming {
            endpoint: EndpointId(0),
            from: ([93, 184, 216, 34], 6881).into(),
            message: Message::response(
                7,
                crate::messages::ResponseSpecific::Ping(crate::messages::PingResponseArguments {
                    responder_id: responder,
                }),
            ),
        });

        assert_eq!(engine.stats().table_size, 1);
    }
}
