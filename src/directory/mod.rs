//! Peer directory: swarm membership per infohash, anti-spoof tokens, and
//! scrape filters.

mod bloom;
mod tokens;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::trace;

use crate::common::{Id, PeerContact, PEER_RETENTION};

pub use bloom::{BloomFilter, FILTER_SIZE};
pub use tokens::Tokens;

/// Default maximum number of info_hashes for which to store peers.
pub const MAX_INFO_HASHES: usize = 2000;
/// Default maximum number of peers to store per info_hash.
pub const MAX_PEERS_PER_INFO_HASH: usize = 100;

#[derive(Debug)]
struct StoredPeer {
    contact: PeerContact,
    stored_at: Instant,
}

/// Stores announced peers per infohash and gate-keeps writes with tokens.
#[derive(Debug)]
pub struct PeerDirectory {
    peers: HashMap<Id, Vec<StoredPeer>>,
    /// Insertion order across all keys, for capping total storage.
    order: Vec<(Id, SocketAddr)>,
    tokens: Tokens,
    max_info_hashes: usize,
    max_peers_per_info_hash: usize,
    retention: Duration,
}

impl PeerDirectory {
    pub fn new() -> PeerDirectory {
        PeerDirectory {
            peers: HashMap::new(),
            order: Vec::new(),
            tokens: Tokens::new(),
            max_info_hashes: MAX_INFO_HASHES,
            max_peers_per_info_hash: MAX_PEERS_PER_INFO_HASH,
            retention: PEER_RETENTION,
        }
    }

    // === Tokens ===

    /// Issue a token bound to (id, ip, port, key), or `None` if the
    /// insertion policy blocks the key. Refusing to issue for blocked keys
    /// avoids token-issuance amplification.
    pub fn issue_token(&mut self, id: &Id, from: SocketAddr, key: &Id) -> Option<Vec<u8>> {
        self.rotate_if_due();

        if !self.insertion_allowed(key) {
            return None;
        }

        Some(self.tokens.generate(id, from, key).to_vec())
    }

    /// Validate a token against the exact tuple it should have been issued for.
    pub fn validate_token(&mut self, token: &[u8], id: &Id, from: SocketAddr, key: &Id) -> bool {
        self.rotate_if_due();

        self.tokens.validate(token, id, from, key)
    }

    // === Peers ===

    /// Whether storing another peer for this key is currently acceptable.
    pub fn insertion_allowed(&self, key: &Id) -> bool {
        if self.peers.len() >= self.max_info_hashes && !self.peers.contains_key(key) {
            return false;
        }

        self.peers
            .get(key)
            .map(|stored| stored.len() < self.max_peers_per_info_hash)
            .unwrap_or(true)
    }

    /// Store an announced peer. Re-announcing from the same address replaces
    /// the stored contact with a fresh timestamp.
    pub fn store_peer(&mut self, key: Id, contact: PeerContact) {
        let address = contact.address();
        let entry = self.peers.entry(key).or_default();

        if let Some(index) = entry.iter().position(|p| p.contact.address() == address) {
            entry.remove(index);
            self.order.retain(|i| i != &(key, address));
        } else if entry.len() >= self.max_peers_per_info_hash {
            let removed = entry.remove(0);
            self.order
                .retain(|i| i != &(key, removed.contact.address()));
        }

        entry.push(StoredPeer {
            contact,
            stored_at: Instant::now(),
        });
        self.order.push((key, address));

        // Cap the total store by evicting the globally oldest entry.
        if self.order.len() > self.max_info_hashes * self.max_peers_per_info_hash {
            let (old_key, old_address) = self.order.remove(0);
            if let Some(stored) = self.peers.get_mut(&old_key) {
                stored.retain(|p| p.contact.address() != old_address);
            }
        }
    }

    /// Sample up to `count` random peers for a key, optionally excluding
    /// seed-only contacts.
    pub fn sample_peers(&self, key: &Id, count: usize, want_seeds: bool) -> Vec<PeerContact> {
        let Some(stored) = self.peers.get(key) else {
            return Vec::new();
        };

        let eligible: Vec<&StoredPeer> = stored
            .iter()
            .filter(|p| want_seeds || !p.contact.is_seed())
            .collect();

        eligible
            .choose_multiple(&mut rand::thread_rng(), count)
            .map(|p| p.contact.clone())
            .collect()
    }

    /// Build a BEP33 scrape filter over the peers (or only the seeds) of a key.
    pub fn scrape_filter(&self, key: &Id, seeds: bool) -> BloomFilter {
        let mut filter = BloomFilter::new();

        if let Some(stored) = self.peers.get(key) {
            for peer in stored {
                if !seeds || peer.contact.is_seed() {
                    filter.insert(&peer.contact.address().ip());
                }
            }
        }

        filter
    }

    /// Drop peers past the retention window.
    pub fn expire(&mut self, now: Instant) {
        let retention = self.retention;
        let mut dropped = 0_usize;

        self.peers.retain(|key, stored| {
            stored.retain(|peer| {
                let keep = now.duration_since(peer.stored_at) <= retention;
                if !keep {
                    dropped += 1;
                    self.order.retain(|i| i != &(*key, peer.contact.address()));
                }
                keep
            });

            !stored.is_empty()
        });

        if dropped > 0 {
            trace!(dropped, "Expired announced peers");
        }
    }

    pub fn peer_count(&self) -> usize {
        self.order.len()
    }
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory {
    fn rotate_if_due(&mut self) {
        if self.tokens.should_update() {
            self.tokens.rotate();
        }
    }
}
