//! Mainline DHT request-dispatch engine.
//!
//! Implements the server side of BEP5 (Kademlia), BEP32/BEP42 hints,
//! BEP33 (scrapes) and BEP44 (arbitrary storage with compare-and-swap),
//! plus the lifecycle around it: routing table upkeep, bootstrap episodes
//! and storage expiry. Sockets and iterative lookups plug in behind the
//! [RpcTransport] and [TaskScheduler] seams.
//!
//! ## Example
//!
//! ```rust
//! use kadnode::{AddressFamily, ChannelTransport, Config, Engine, Id, TaskQueue};
//!
//! let config = Config::new(AddressFamily::V4).without_router_bootstrap();
//! let mut engine = Engine::new(config);
//!
//! let (transport, _outbound) = ChannelTransport::new(vec![Id::random()]);
//! let (queue, _driver, completions) = TaskQueue::new();
//!
//! engine.start(Box::new(transport), Box::new(queue), completions)?;
//! # Ok::<(), kadnode::Error>(())
//! ```

// Modules
mod common;
mod config;
mod directory;
mod engine;
mod error;
mod node;
mod routing_table;
mod scheduler;
mod storage;
mod transport;

pub mod messages;

// Exports
pub use crate::common::{
    AddressFamily, Id, NodeContact, PeerContact, DEFAULT_BOOTSTRAP_NODES, MAX_BUCKET_SIZE_K,
    MAX_SALT_SIZE, MAX_VALUE_SIZE,
};
pub use crate::config::Config;
pub use crate::directory::{BloomFilter, PeerDirectory, Tokens, FILTER_SIZE};
pub use crate::engine::{
    Engine, IndexingObserver, RequestFilter, SiblingRegistry, Stats, Status, VERSION,
};
pub use crate::error::{Error, Result};
pub use crate::node::Node;
pub use crate::routing_table::{bucket_fill_target, KBucket, RoutingTable};
pub use crate::scheduler::{
    NodeLookup, Priority, TaskDriver, TaskId, TaskQueue, TaskScheduler,
};
pub use crate::storage::{
    encode_signable, hash_immutable, target_from_key, StorageItem, UpdateOutcome, ValueStore,
};
pub use crate::transport::{
    CallInfo, ChannelTransport, EndpointId, Outbound, RpcTransport, TransportEvent,
};
