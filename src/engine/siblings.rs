//! Cross-family sibling registry.
//!
//! A dual-stack node runs one engine per address family. Each engine answers
//! `want` requests for the *other* family by consulting its sibling's routing
//! table through this registry, so neither engine owns the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::common::{AddressFamily, Id, NodeContact};
use crate::routing_table::RoutingTable;
use crate::{Error, Result};

pub type SharedTable = Arc<Mutex<RoutingTable>>;

#[derive(Debug, Clone, Default)]
pub struct SiblingRegistry {
    tables: Arc<Mutex<HashMap<AddressFamily, SharedTable>>>,
}

impl SiblingRegistry {
    pub fn new() -> SiblingRegistry {
        SiblingRegistry::default()
    }

    /// Register an engine's routing table under its family. Each family can
    /// be registered exactly once; a second engine of the same family in one
    /// group is a configuration error, not something to silently tolerate.
    pub fn register(&self, family: AddressFamily, table: SharedTable) -> Result<()> {
        let mut tables = lock(&self.tables);

        if tables.contains_key(&family) {
            return Err(Error::FamilyTaken(family));
        }

        tables.insert(family, table);

        Ok(())
    }

    pub fn unregister(&self, family: AddressFamily) {
        lock(&self.tables).remove(&family);
    }

    pub fn registered(&self, family: AddressFamily) -> bool {
        lock(&self.tables).contains_key(&family)
    }

    /// Closest nodes to `target` from the table of `family`, or empty if no
    /// engine of that family is registered.
    pub fn closest(&self, family: AddressFamily, target: &Id, count: usize) -> Vec<NodeContact> {
        let table = lock(&self.tables).get(&family).cloned();

        match table {
            Some(table) => table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .closest(target, count),
            None => Vec::new(),
        }
    }
}

fn lock(
    tables: &Arc<Mutex<HashMap<AddressFamily, SharedTable>>>,
) -> std::sync::MutexGuard<'_, HashMap<AddressFamily, SharedTable>> {
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod test {
    use super::*;

    fn shared_table() -> SharedTable {
        Arc::new(Mutex::new(RoutingTable::new(Id::random())))
    }

    #[test]
    fn each_family_registers_once() {
        let registry = SiblingRegistry::new();

        assert!(registry.register(AddressFamily::V4, shared_table()).is_ok());
        assert!(matches!(
            registry.register(AddressFamily::V4, shared_table()),
            Err(Error::FamilyTaken(AddressFamily::V4))
        ));
        assert!(registry.register(AddressFamily::V6, shared_table()).is_ok());
    }

    #[test]
    fn unregister_frees_the_slot() {
        let registry = SiblingRegistry::new();

        registry
            .register(AddressFamily::V4, shared_table())
            .expect("register");
        registry.unregister(AddressFamily::V4);

        assert!(!registry.registered(AddressFamily::V4));
        assert!(registry.register(AddressFamily::V4, shared_table()).is_ok());
    }

    #[test]
    fn closest_without_sibling_is_empty() {
        let registry = SiblingRegistry::new();

        assert!(registry
            .closest(AddressFamily::V6, &Id::random(), 8)
            .is_empty());
    }

    #[test]
    fn closest_reads_the_registered_table() {
        let registry = SiblingRegistry::new();
        let table = shared_table();

        table
            .lock()
            .expect("lock")
            .record_seen(Id::random(), ([93, 184, 216, 34], 6881).into());

        registry
            .register(AddressFamily::V4, table)
            .expect("register");

        assert_eq!(registry.closest(AddressFamily::V4, &Id::random(), 8).len(), 1);
    }
}
