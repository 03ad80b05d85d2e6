//! Bootstrap bookkeeping: the episode state machine and the router resolver.

use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use tracing::debug;

use crate::common::{AddressFamily, BOOTSTRAP_MIN_INTERVAL, DISCOVERY_LOOKUP_INTERVAL};
use crate::scheduler::TaskId;

/// One bootstrap episode: a burst of lookups tracked until the last one
/// completes. At most one episode runs at a time, and episodes are rate
/// limited so a struggling node doesn't hammer the routers.
#[derive(Debug, Default)]
pub struct BootstrapState {
    bootstrapping: bool,
    last_attempt: Option<Instant>,
    inflight: HashSet<TaskId>,
}

impl BootstrapState {
    pub fn new() -> BootstrapState {
        BootstrapState::default()
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping
    }

    /// Whether a new episode may start now.
    pub fn can_start(&self, now: Instant) -> bool {
        if self.bootstrapping {
            return false;
        }

        match self.last_attempt {
            Some(at) => now.duration_since(at) >= BOOTSTRAP_MIN_INTERVAL,
            None => true,
        }
    }

    /// Whether a healthy table is nevertheless due for a neighborhood
    /// refresh: the discovery interval has passed since the last episode
    /// (or there has never been one).
    pub fn refresh_due(&self, now: Instant) -> bool {
        match self.last_attempt {
            Some(at) => now.duration_since(at) >= DISCOVERY_LOOKUP_INTERVAL,
            None => true,
        }
    }

    pub fn begin(&mut self, now: Instant) {
        self.bootstrapping = true;
        self.last_attempt = Some(now);
        self.inflight.clear();
    }

    pub fn track(&mut self, task: TaskId) {
        self.inflight.insert(task);
    }

    /// Record a lookup completion. Returns `true` when it was the last
    /// in-flight lookup of the episode, ending it.
    pub fn complete(&mut self, task: TaskId) -> bool {
        if !self.inflight.remove(&task) {
            return false;
        }

        if self.inflight.is_empty() && self.bootstrapping {
            self.bootstrapping = false;
            return true;
        }

        false
    }

    /// Abandon the current episode, e.g. on engine stop.
    pub fn abort(&mut self) {
        self.bootstrapping = false;
        self.inflight.clear();
    }
}

/// Resolves the configured bootstrap routers off-thread and caches the
/// addresses. DNS failures are logged and swallowed; bootstrap simply
/// proceeds with whatever resolved.
#[derive(Debug, Clone)]
pub struct RouterCache {
    hosts: Vec<String>,
    family: AddressFamily,
    resolved: Arc<Mutex<Vec<SocketAddr>>>,
    resolving: Arc<AtomicBool>,
}

impl RouterCache {
    pub fn new(hosts: Vec<String>, family: AddressFamily) -> RouterCache {
        RouterCache {
            hosts,
            family,
            resolved: Arc::new(Mutex::new(Vec::new())),
            resolving: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The addresses resolved so far. Empty until a [RouterCache::refresh]
    /// has finished.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Kick off a background resolution unless one is already running.
    pub fn refresh(&self) {
        if self.hosts.is_empty() || self.resolving.swap(true, Ordering::SeqCst) {
            return;
        }

        let hosts = self.hosts.clone();
        let family = self.family;
        let resolved = self.resolved.clone();
        let resolving = self.resolving.clone();

        let spawned = thread::Builder::new()
            .name("router-resolver".into())
            .spawn(move || {
                let mut addresses = Vec::new();

                for host in &hosts {
                    match host.to_socket_addrs() {
                        Ok(candidates) => {
                            addresses
                                .extend(candidates.filter(|a| AddressFamily::of(a) == family));
                        }
                        Err(error) => {
                            debug!(host, ?error, "Failed to resolve bootstrap router");
                        }
                    }
                }

                if !addresses.is_empty() {
                    *resolved.lock().unwrap_or_else(PoisonError::into_inner) = addresses;
                }

                resolving.store(false, Ordering::SeqCst);
            });

        if spawned.is_err() {
            self.resolving.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn one_episode_at_a_time() {
        let mut state = BootstrapState::new();
        let now = Instant::now();

        assert!(state.can_start(now));
        state.begin(now);
        assert!(!state.can_start(now));

        state.track(TaskId(1));
        state.track(TaskId(2));

        assert!(!state.complete(TaskId(1)));
        assert!(state.is_bootstrapping());

        assert!(state.complete(TaskId(2)));
        assert!(!state.is_bootstrapping());
    }

    #[test]
    fn episodes_are_rate_limited() {
        let mut state = BootstrapState::new();
        let start = Instant::now();

        state.begin(start);
        state.track(TaskId(1));
        state.complete(TaskId(1));

        // Finished, but within the minimum interval.
        assert!(!state.can_start(start + Duration::from_secs(30)));
        assert!(state.can_start(start + BOOTSTRAP_MIN_INTERVAL));
    }

    #[test]
    fn refresh_is_due_after_the_discovery_interval() {
        let mut state = BootstrapState::new();
        let start = Instant::now();

        // Never attempted: due right away.
        assert!(state.refresh_due(start));

        state.begin(start);
        state.track(TaskId(1));
        state.complete(TaskId(1));

        assert!(!state.refresh_due(start + BOOTSTRAP_MIN_INTERVAL));
        assert!(state.refresh_due(start + DISCOVERY_LOOKUP_INTERVAL));
    }

    #[test]
    fn foreign_completions_are_ignored() {
        let mut state = BootstrapState::new();
        state.begin(Instant::now());
        state.track(TaskId(1));

        assert!(!state.complete(TaskId(99)));
        assert!(state.is_bootstrapping());
    }

    #[test]
    fn abort_clears_the_episode() {
        let mut state = BootstrapState::new();
        state.begin(Instant::now());
        state.track(TaskId(1));

        state.abort();

        assert!(!state.is_bootstrapping());
        assert!(!state.complete(TaskId(1)));
    }

    #[test]
    fn resolver_filters_by_family() {
        let cache = RouterCache::new(vec!["127.0.0.1:6881".into()], AddressFamily::V6);
        cache.refresh();

        // Wait for the background thread.
        for _ in 0..50 {
            if !cache.resolving.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert!(cache.addresses().is_empty());
    }

    #[test]
    fn resolver_caches_literal_addresses() {
        let cache = RouterCache::new(vec!["127.0.0.1:6881".into()], AddressFamily::V4);
        cache.refresh();

        for _ in 0..50 {
            if !cache.addresses().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(
            cache.addresses(),
            vec![SocketAddr::from(([127, 0, 0, 1], 6881))]
        );
    }
}
