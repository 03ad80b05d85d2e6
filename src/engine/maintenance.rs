//! Periodic maintenance scheduling.
//!
//! The engine's tick consults these timers to decide which of the slow
//! background chores are due. Each `*_due` check rearms its timer when it
//! fires, so a chore runs at most once per interval no matter how often the
//! engine ticks.

use std::time::{Duration, Instant};

use crate::common::DISCOVERY_LOOKUP_INTERVAL;

/// Ping one idle node per endpoint this often to keep the table honest.
pub const LIVENESS_PING_INTERVAL: Duration = Duration::from_secs(10);
/// Persist the routing table this often (skipped in survival mode).
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Sweep expired peers, values and cached lookups this often.
pub const EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct MaintenanceTimers {
    last_liveness_ping: Instant,
    last_discovery_lookup: Instant,
    last_persist: Instant,
    last_expiry: Instant,
}

impl MaintenanceTimers {
    pub fn new(now: Instant) -> MaintenanceTimers {
        MaintenanceTimers {
            last_liveness_ping: now,
            last_discovery_lookup: now,
            last_persist: now,
            last_expiry: now,
        }
    }

    pub fn liveness_ping_due(&mut self, now: Instant) -> bool {
        due(&mut self.last_liveness_ping, LIVENESS_PING_INTERVAL, now)
    }

    pub fn discovery_lookup_due(&mut self, now: Instant) -> bool {
        due(&mut self.last_discovery_lookup, DISCOVERY_LOOKUP_INTERVAL, now)
    }

    pub fn persist_due(&mut self, now: Instant) -> bool {
        due(&mut self.last_persist, PERSIST_INTERVAL, now)
    }

    pub fn expiry_due(&mut self, now: Instant) -> bool {
        due(&mut self.last_expiry, EXPIRY_INTERVAL, now)
    }
}

fn due(last: &mut Instant, interval: Duration, now: Instant) -> bool {
    if now.duration_since(*last) >= interval {
        *last = now;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn due_rearms_on_fire() {
        let start = Instant::now();
        let mut timers = MaintenanceTimers::new(start);

        assert!(!timers.expiry_due(start));
        assert!(timers.expiry_due(start + EXPIRY_INTERVAL));

        // Rearmed; not due again until another full interval passes.
        assert!(!timers.expiry_due(start + EXPIRY_INTERVAL + Duration::from_secs(1)));
        assert!(timers.expiry_due(start + EXPIRY_INTERVAL * 2));
    }

    #[test]
    fn timers_are_independent() {
        let start = Instant::now();
        let mut timers = MaintenanceTimers::new(start);

        let later = start + EXPIRY_INTERVAL;
        assert!(timers.expiry_due(later));
        assert!(!timers.persist_due(later));
        assert!(!timers.discovery_lookup_due(later));
    }
}
