//! Engine configuration.

use std::path::{Path, PathBuf};

use crate::common::{AddressFamily, Id, DEFAULT_BOOTSTRAP_NODES};

/// Configuration for a [crate::engine::Engine].
#[derive(Debug, Clone)]
pub struct Config {
    family: AddressFamily,
    id: Option<Id>,
    storage_dir: Option<PathBuf>,
    bootstrap_hosts: Vec<String>,
    router_bootstrap: bool,
}

impl Config {
    pub fn new(family: AddressFamily) -> Config {
        Config {
            family,
            id: None,
            storage_dir: None,
            bootstrap_hosts: DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|host| host.to_string())
                .collect(),
            router_bootstrap: true,
        }
    }

    // === Builders ===

    /// Use a fixed node id instead of a random one.
    pub fn with_id(mut self, id: Id) -> Config {
        self.id = Some(id);
        self
    }

    /// Persist the routing table under this directory across restarts.
    pub fn with_storage_dir(mut self, dir: impl AsRef<Path>) -> Config {
        self.storage_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Replace the default bootstrap routers.
    pub fn with_bootstrap_hosts<T: ToString>(mut self, hosts: &[T]) -> Config {
        self.bootstrap_hosts = hosts.iter().map(|host| host.to_string()).collect();
        self
    }

    /// Disable seeding bootstrap lookups from well-known routers. Useful for
    /// private swarms and tests.
    pub fn without_router_bootstrap(mut self) -> Config {
        self.router_bootstrap = false;
        self
    }

    // === Getters ===

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn id(&self) -> Option<Id> {
        self.id
    }

    pub fn storage_dir(&self) -> Option<&Path> {
        self.storage_dir.as_deref()
    }

    pub fn bootstrap_hosts(&self) -> &[String] {
        &self.bootstrap_hosts
    }

    pub fn router_bootstrap(&self) -> bool {
        self.router_bootstrap
    }

    /// Where this engine persists its routing table, if persistence is on.
    pub fn table_path(&self) -> Option<PathBuf> {
        self.storage_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-table.cache", self.family.short_name())))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(AddressFamily::V4)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table_path_is_per_family() {
        let v4 = Config::new(AddressFamily::V4).with_storage_dir("/tmp/dht");
        let v6 = Config::new(AddressFamily::V6).with_storage_dir("/tmp/dht");

        assert_ne!(v4.table_path(), v6.table_path());
    }

    #[test]
    fn defaults() {
        let config = Config::default();

        assert!(config.router_bootstrap());
        assert!(config.table_path().is_none());
        assert!(!config.bootstrap_hosts().is_empty());
    }
}
