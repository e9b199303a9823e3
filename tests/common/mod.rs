//! Shared fixtures for integration tests.

use std::sync::Arc;

use arbor::config::RegistryConfig;
use arbor::store::{CoordinationStore, MemoryStore};
use arbor::tree::{TreeHub, TreeWatcher};

/// A hub over a fresh in-memory store with default configuration.
pub fn registry() -> (TreeHub, Arc<MemoryStore>, Arc<RegistryConfig>) {
    let config = Arc::new(RegistryConfig::default());
    let store = Arc::new(MemoryStore::new());
    let hub = TreeHub::new(config.clone(), store.clone());
    (hub, store, config)
}

/// Create one node, panicking on failure. Returns its version for later
/// compare-and-set writes.
pub async fn seed(store: &MemoryStore, path: &str, data: &str) -> i64 {
    store
        .create(path, data)
        .await
        .unwrap_or_else(|error| panic!("seeding {} failed: {}", path, error))
}

pub fn watcher(hub: &TreeHub, config: &Arc<RegistryConfig>) -> TreeWatcher {
    TreeWatcher::new(hub.clone(), config.clone())
}
