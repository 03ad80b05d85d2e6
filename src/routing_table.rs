//! Kademlia routing table: distance-ordered k-buckets of [NodeContact]s.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{Id, NodeContact, MAX_BUCKET_SIZE_K, MAX_DISTANCE, SURVIVAL_MODE_THRESHOLD};
use crate::Result;

#[derive(Debug, Clone)]
/// Kademlia routing table.
pub struct RoutingTable {
    id: Id,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    // === Public Methods ===

    /// Record that a node authored a message we accepted: refresh it if it is
    /// already in the table, otherwise try to add it.
    pub fn record_seen(&mut self, id: Id, address: SocketAddr) {
        let distance = self.id.distance(&id);

        if distance == 0 {
            // Never add self to the routing table.
            return;
        }

        let bucket = self.buckets.entry(distance).or_default();
        bucket.add(NodeContact::new(id, address));
    }

    /// Record that a call to a node timed out.
    pub fn record_timeout(&mut self, address: SocketAddr) {
        for bucket in self.buckets.values_mut() {
            for node in bucket.nodes.iter_mut() {
                if node.address() == address {
                    node.record_failure();
                }
            }
        }
    }

    /// Remove a node from this routing table.
    pub fn remove(&mut self, node_id: &Id) {
        let distance = self.id.distance(node_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(node_id)
        }
    }

    /// Return the `count` closest nodes to the target.
    pub fn closest(&self, target: &Id, count: usize) -> Vec<NodeContact> {
        let mut all: Vec<NodeContact> = self.nodes().collect();

        all.sort_by(|a, b| a.id().xor(target).cmp(&b.id().xor(target)));
        all.truncate(count);

        all
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.nodes.len())
    }

    /// Too few contacts to make persisting the table meaningful.
    pub fn is_in_survival_mode(&self) -> bool {
        self.size() < SURVIVAL_MODE_THRESHOLD
    }

    /// A random contact, used for liveness pings.
    pub fn random_entry(&self) -> Option<NodeContact> {
        self.nodes().choose(&mut rand::thread_rng())
    }

    /// Distances of buckets that are occupied but below half capacity,
    /// candidates for a bucket-filling lookup after bootstrap.
    pub fn under_populated_buckets(&self) -> Vec<u8> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty() && bucket.nodes.len() < MAX_BUCKET_SIZE_K / 2)
            .map(|(distance, _)| *distance)
            .collect()
    }

    /// Drop stale nodes and return the addresses of nodes that went quiet and
    /// should be pinged.
    pub fn purge_and_ping_candidates(&mut self) -> Vec<SocketAddr> {
        let mut to_ping = Vec::new();

        for bucket in self.buckets.values_mut() {
            bucket.nodes.retain(|node| !node.is_stale());

            for node in bucket.iter() {
                if node.should_ping() {
                    to_ping.push(node.address());
                }
            }
        }

        to_ping
    }

    /// Returns an iterator over the nodes in this routing table.
    pub fn nodes(&self) -> impl Iterator<Item = NodeContact> + '_ {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.iter().cloned())
    }

    // === Persistence ===

    /// Persist a snapshot of this table as a bencoded file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = TableSnapshot {
            id: serde_bytes::ByteBuf::from(self.id.to_vec()),
            nodes: self
                .nodes()
                .map(|node| SnapshotNode {
                    id: serde_bytes::ByteBuf::from(node.id().to_vec()),
                    address: node.address().to_string(),
                })
                .collect(),
        };

        let bytes = serde_bencode::to_bytes(&snapshot)?;
        std::fs::write(path, bytes)?;

        Ok(())
    }

    /// Load a previously saved snapshot into this table.
    ///
    /// Entries that fail to parse are skipped; a snapshot saved for a
    /// different local id is ignored entirely.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let snapshot: TableSnapshot = serde_bencode::from_bytes(&bytes)?;

        if Id::from_bytes(&snapshot.id).ok() != Some(self.id) {
            debug!(path = %path.display(), "Ignoring table snapshot saved for a different id");
            return Ok(());
        }

        for node in snapshot.nodes {
            let (Ok(id), Ok(address)) = (
                Id::from_bytes(&node.id),
                SocketAddr::from_str(&node.address),
            ) else {
                continue;
            };

            self.record_seen(id, address);
        }

        Ok(())
    }

    #[cfg(test)]
    fn contains(&self, node_id: &Id) -> bool {
        let distance = self.id.distance(node_id);

        self.buckets
            .get(&distance)
            .map(|bucket| bucket.iter().any(|node| node.id() == node_id))
            .unwrap_or(false)
    }
}

/// Rebuild a table from a snapshot, adopting the id it was saved with.
pub fn restore(path: &Path) -> Result<RoutingTable> {
    let bytes = std::fs::read(path)?;
    let snapshot: TableSnapshot = serde_bencode::from_bytes(&bytes)?;

    let mut table = RoutingTable::new(Id::from_bytes(&snapshot.id)?);

    for node in snapshot.nodes {
        let (Ok(id), Ok(address)) = (
            Id::from_bytes(&node.id),
            SocketAddr::from_str(&node.address),
        ) else {
            continue;
        };

        table.record_seen(id, address);
    }

    Ok(table)
}

#[derive(Serialize, Deserialize)]
struct TableSnapshot {
    id: serde_bytes::ByteBuf,
    nodes: Vec<SnapshotNode>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotNode {
    id: serde_bytes::ByteBuf,
    address: String,
}

/// KBuckets are similar to LRU caches that evict unresponsive nodes without
/// dropping any responsive nodes in the process.
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    /// Nodes in the k-bucket, sorted by the least recently seen.
    nodes: Vec<NodeContact>,
}

impl KBucket {
    pub fn add(&mut self, incoming: NodeContact) -> bool {
        if let Some(index) = self.iter().position(|n| n.id() == incoming.id()) {
            let existing = &self.nodes[index];

            // Same id from the same ip refreshes the node (possibly updating
            // the port) and moves it to the end of the bucket. A different ip
            // claiming an existing id is ignored until the old entry times out.
            if existing.same_ip(&incoming) {
                self.nodes.remove(index);
                self.nodes.push(incoming);

                true
            } else {
                false
            }
        } else if self.nodes.len() < MAX_BUCKET_SIZE_K {
            self.nodes.push(incoming);
            true
        } else if self.nodes[0].is_stale() {
            // Replace the least recently seen node.
            self.nodes.remove(0);
            self.nodes.push(incoming);

            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, node_id: &Id) {
        self.nodes.retain(|node| node.id() != node_id);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeContact> {
        self.nodes.iter()
    }
}

/// Derive a random lookup target inside the bucket at `distance`.
pub fn bucket_fill_target(local_id: &Id, distance: u8) -> Id {
    local_id.random_at_distance(distance.min(MAX_DISTANCE))
}
