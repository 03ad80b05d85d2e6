//! Contact entries: routing table nodes and announced swarm peers.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::Id;

/// The age after which a node gets pinged during table maintenance.
pub const PING_IF_OLDER_THAN: Duration = Duration::from_secs(15 * 60);
/// The age after which a node that also failed calls is dropped.
pub const STALE_IF_OLDER_THAN: Duration = Duration::from_secs(55 * 60);
/// Failed calls before a node is considered unreachable.
pub const STALE_AFTER_FAILURES: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
/// Node entry in the Kademlia routing table.
pub struct NodeContact {
    id: Id,
    address: SocketAddr,
    last_seen: Instant,
    failed_calls: u8,
}

impl NodeContact {
    /// Creates a new contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> NodeContact {
        NodeContact {
            id,
            address,
            last_seen: Instant::now(),
            failed_calls: 0,
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    // === Public Methods ===

    /// Record a call to this contact that timed out.
    pub fn record_failure(&mut self) {
        self.failed_calls = self.failed_calls.saturating_add(1);
    }

    /// Node hasn't been heard from in a while and should be pinged.
    pub fn should_ping(&self) -> bool {
        self.last_seen.elapsed() > PING_IF_OLDER_THAN
    }

    /// Node failed enough calls (or went silent long enough) to be dropped.
    pub fn is_stale(&self) -> bool {
        self.failed_calls >= STALE_AFTER_FAILURES || self.last_seen.elapsed() > STALE_IF_OLDER_THAN
    }

    pub fn same_ip(&self, other: &NodeContact) -> bool {
        self.address.ip() == other.address.ip()
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A peer announced for an infohash, stored by the [PeerDirectory][crate::PeerDirectory].
///
/// Never mutated in place; re-announcing replaces the stored contact.
pub struct PeerContact {
    address: SocketAddr,
    seed: bool,
    version: Option<Vec<u8>>,
}

impl PeerContact {
    pub fn new(address: SocketAddr, seed: bool) -> PeerContact {
        PeerContact {
            address,
            seed,
            version: None,
        }
    }

    pub fn with_version(mut self, version: Vec<u8>) -> PeerContact {
        self.version = Some(version);
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_seed(&self) -> bool {
        self.seed
    }

    pub fn version(&self) -> Option<&[u8]> {
        self.version.as_deref()
    }
}
