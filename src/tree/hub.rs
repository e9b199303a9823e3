//! Tree hub
//!
//! Process-wide registry of tree holders keyed by `(application, type)`,
//! with a shared semaphore bounding how many holders may be
//! mid-initialization simultaneously. The startup budget protects the
//! coordination-store client from a thundering herd at process startup.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::gauge;
use tokio::sync::Semaphore;
use tracing::info;

use crate::config::RegistryConfig;
use crate::store::{CoordinationStore, NodeType};
use crate::tree::holder::TreeHolder;

pub type HolderKey = (String, NodeType);

pub(crate) struct HubInner {
    config: Arc<RegistryConfig>,
    store: Arc<dyn CoordinationStore>,
    holders: DashMap<HolderKey, Arc<TreeHolder>>,
    startup: Arc<Semaphore>,
}

impl HubInner {
    /// Remove a holder's slot only if it is still occupied by that exact
    /// holder. A replacement created for the same key after the caller was
    /// released must not be evicted by the stale holder's teardown.
    pub(crate) fn remove(&self, application: &str, type_name: NodeType, holder: &TreeHolder) {
        self.holders
            .remove_if(&(application.to_string(), type_name), |_, existing| {
                std::ptr::eq(existing.as_ref(), holder)
            });
    }
}

#[derive(Clone)]
pub struct TreeHub {
    inner: Arc<HubInner>,
}

impl TreeHub {
    pub fn new(config: Arc<RegistryConfig>, store: Arc<dyn CoordinationStore>) -> Self {
        let startup = Arc::new(Semaphore::new(config.holder.startup_concurrency));
        Self {
            inner: Arc::new(HubInner {
                config,
                store,
                holders: DashMap::new(),
                startup,
            }),
        }
    }

    /// Return the existing holder for `(application, type)` or atomically
    /// create and start a new one. The registry lock covers only the map
    /// mutation; startup throttling happens inside the holder's own task.
    pub fn get_tree_holder(&self, application: &str, type_name: NodeType) -> Arc<TreeHolder> {
        let key = (application.to_string(), type_name);
        let holder = match self.inner.holders.entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let holder = TreeHolder::new(
                    application,
                    type_name,
                    self.inner.config.clone(),
                    self.inner.store.clone(),
                    Arc::downgrade(&self.inner),
                );
                entry.insert(holder.clone());
                gauge!("arbor_tree_holders").increment(1.0);
                info!(application, type_name = %type_name, "tree holder created");
                holder
            }
        };
        holder.start(self.inner.startup.clone());
        holder
    }

    /// Look up a holder without creating one.
    pub fn get(&self, application: &str, type_name: NodeType) -> Option<Arc<TreeHolder>> {
        self.inner
            .holders
            .get(&(application.to_string(), type_name))
            .map(|entry| entry.clone())
    }

    /// Remove and close a holder so a future lookup gets a fresh attempt.
    pub fn release_tree_holder(&self, application: &str, type_name: NodeType) {
        if let Some((_, holder)) = self
            .inner
            .holders
            .remove(&(application.to_string(), type_name))
        {
            holder.close();
            info!(application, type_name = %type_name, "tree holder released");
        }
    }

    pub fn contains(&self, application: &str, type_name: NodeType) -> bool {
        self.inner
            .holders
            .contains_key(&(application.to_string(), type_name))
    }

    pub fn len(&self) -> usize {
        self.inner.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.holders.is_empty()
    }

    /// Remaining slots of the startup concurrency budget.
    pub fn available_startup_permits(&self) -> usize {
        self.inner.startup.available_permits()
    }
}
