//! Common types and protocol constants.

mod bogon;
mod contact;
mod id;

use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

pub use bogon::is_bogon;
pub use contact::{NodeContact, PeerContact};
pub use id::{Id, ID_SIZE, MAX_DISTANCE};

/// K = the default maximum size of a k-bucket, and the closest-node count in
/// lookup responses.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// Minimum time between two bootstrap attempts.
pub const BOOTSTRAP_MIN_INTERVAL: Duration = Duration::from_secs(4 * 60);
/// How often we look up a random target per endpoint to stay discoverable
/// across the whole key space.
pub const DISCOVERY_LOOKUP_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Below this many contacts the table is unhealthy and we keep bootstrapping.
pub const BOOTSTRAP_IF_LESS_THAN: usize = 30;
/// Below this many contacts, seed bootstrap lookups with well-known routers.
pub const ROUTER_BOOTSTRAP_IF_LESS_THAN: usize = 10;
/// Below this many contacts the node is in survival mode and persisting the
/// table is not worth the I/O.
pub const SURVIVAL_MODE_THRESHOLD: usize = 8;

/// How often the token secret rotates. Tokens stay valid for two rotations.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Announced peers are dropped after this long without a re-announce.
pub const PEER_RETENTION: Duration = Duration::from_secs(30 * 60);
/// BEP44 values are dropped after this long without a re-put.
pub const VALUE_RETENTION: Duration = Duration::from_secs(2 * 60 * 60);

/// Maximum length of a BEP44 value (`v` field).
pub const MAX_VALUE_SIZE: usize = 1000;
/// Maximum length of a BEP44 `salt` field.
pub const MAX_SALT_SIZE: usize = 64;

pub const DEFAULT_BOOTSTRAP_NODES: [&str; 4] = [
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.libtorrent.org:25401",
    "dht.anacrolix.link:42069",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The address family an engine instance serves.
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(address: &SocketAddr) -> AddressFamily {
        if address.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "ipv4",
            AddressFamily::V6 => "ipv6",
        }
    }

    /// How many peers a get_peers response aims to carry. IPv6 packets
    /// carry larger headers and contact entries, so the v6 budget is
    /// smaller.
    pub fn peer_sample_target(&self) -> usize {
        match self {
            AddressFamily::V4 => 50,
            AddressFamily::V6 => 34,
        }
    }
}

impl Display for AddressFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}
