//! In-memory coordination store
//!
//! Backs unit and integration tests with the same versioning and watch
//! semantics the core expects from the real backend. All mutation happens
//! under one lock so that snapshots and event delivery observe a single
//! total order.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{CoordinationStore, NodeEvent, StoreError, SubtreeWatch};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct NodeRecord {
    data: String,
    version: i64,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, NodeRecord>,
    watches: Vec<(String, broadcast::Sender<NodeEvent>)>,
}

impl State {
    fn publish(&mut self, event: NodeEvent) {
        self.watches.retain(|(prefix, sender)| {
            let matches = event
                .path()
                .map(|path| path == prefix || path.starts_with(&format!("{}/", prefix)))
                .unwrap_or(true);
            if matches {
                // A send error only means every receiver is gone.
                if sender.send(event.clone()).is_err() && sender.receiver_count() == 0 {
                    return false;
                }
            }
            true
        });
    }
}

/// Watchable in-memory store with compare-and-set writes.
pub struct MemoryStore {
    state: Mutex<State>,
    /// Artificial latency injected before `watch_subtree` returns, used to
    /// exercise initialization timeouts.
    watch_delay: Mutex<Option<Duration>>,
    /// One-shot error returned by the next `watch_subtree` call, used to
    /// exercise failed watch starts.
    watch_failure: Mutex<Option<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            watch_delay: Mutex::new(None),
            watch_failure: Mutex::new(None),
        }
    }

    pub fn set_watch_delay(&self, delay: Duration) {
        *self.watch_delay.lock() = Some(delay);
    }

    pub fn fail_next_watch(&self, error: StoreError) {
        *self.watch_failure.lock() = Some(error);
    }

    /// Emit a connectivity event to every active watch.
    pub fn emit_connectivity(&self, event: NodeEvent) {
        self.state.lock().publish(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<(String, i64), StoreError> {
        let state = self.state.lock();
        state
            .nodes
            .get(path)
            .map(|record| (record.data.clone(), record.version))
            .ok_or_else(|| StoreError::NoNode {
                path: path.to_string(),
            })
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock();
        let prefix = format!("{}/", path);
        let children = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(child, _)| child.starts_with(&prefix))
            .filter_map(|(child, _)| {
                let rest = &child[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(children)
    }

    async fn create(&self, path: &str, data: &str) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        if state.nodes.contains_key(path) {
            return Err(StoreError::NodeExists {
                path: path.to_string(),
            });
        }
        // Create missing ancestors with empty payloads, root-first.
        let mut ancestors = Vec::new();
        let mut current = path;
        while let Some(idx) = current.rfind('/') {
            current = &current[..idx];
            if current.is_empty() || state.nodes.contains_key(current) {
                break;
            }
            ancestors.push(current.to_string());
        }
        for ancestor in ancestors.into_iter().rev() {
            state.nodes.insert(
                ancestor.clone(),
                NodeRecord {
                    data: String::new(),
                    version: 0,
                },
            );
            state.publish(NodeEvent::Created {
                path: ancestor,
                data: String::new(),
            });
        }
        state.nodes.insert(
            path.to_string(),
            NodeRecord {
                data: data.to_string(),
                version: 0,
            },
        );
        state.publish(NodeEvent::Created {
            path: path.to_string(),
            data: data.to_string(),
        });
        Ok(0)
    }

    async fn set(&self, path: &str, data: &str, version: i64) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        let record = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode {
                path: path.to_string(),
            })?;
        if record.version != version {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
            });
        }
        record.data = data.to_string();
        record.version += 1;
        let new_version = record.version;
        state.publish(NodeEvent::Updated {
            path: path.to_string(),
            data: data.to_string(),
        });
        Ok(new_version)
    }

    async fn delete(&self, path: &str, version: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let record = state.nodes.get(path).ok_or_else(|| StoreError::NoNode {
            path: path.to_string(),
        })?;
        if record.version != version {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
            });
        }
        state.nodes.remove(path);
        state.publish(NodeEvent::Deleted {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn watch_subtree(&self, prefix: &str) -> Result<SubtreeWatch, StoreError> {
        let delay = *self.watch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.watch_failure.lock().take() {
            return Err(error);
        }
        let mut state = self.state.lock();
        let child_prefix = format!("{}/", prefix);
        let initial = state
            .nodes
            .range(prefix.to_string()..)
            .take_while(|(path, _)| *path == prefix || path.starts_with(&child_prefix))
            .map(|(path, record)| (path.clone(), record.data.clone()))
            .collect();
        let (sender, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        state.watches.push((prefix.to_string(), sender));
        Ok(SubtreeWatch {
            initial,
            events: receiver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_get_set_delete() {
        let store = MemoryStore::new();
        let version = store.create("/arbor/service/foo", "{}").await.unwrap();
        assert_eq!(version, 0);

        let (data, version) = store.get("/arbor/service/foo").await.unwrap();
        assert_eq!(data, "{}");
        assert_eq!(version, 0);

        let version = store.set("/arbor/service/foo", "{\"a\":1}", 0).await.unwrap();
        assert_eq!(version, 1);

        assert!(matches!(
            store.set("/arbor/service/foo", "x", 0).await,
            Err(StoreError::BadVersion { .. })
        ));

        store.delete("/arbor/service/foo", 1).await.unwrap();
        assert!(matches!(
            store.get("/arbor/service/foo").await,
            Err(StoreError::NoNode { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_makes_parents() {
        let store = MemoryStore::new();
        store
            .create("/arbor/service/foo/stable/10.0.0.1_8080", "{}")
            .await
            .unwrap();
        let children = store.get_children("/arbor/service/foo").await.unwrap();
        assert_eq!(children, vec!["stable".to_string()]);
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let store = MemoryStore::new();
        store.create("/arbor/service/foo", "").await.unwrap();
        assert!(matches!(
            store.create("/arbor/service/foo", "").await,
            Err(StoreError::NodeExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_watch_sees_initial_and_live_events() {
        let store = MemoryStore::new();
        store.create("/arbor/service/foo/stable", "").await.unwrap();

        let mut watch = store.watch_subtree("/arbor/service/foo").await.unwrap();
        assert_eq!(watch.initial.len(), 2);

        store
            .create("/arbor/service/foo/stable/10.0.0.1_8080", "{}")
            .await
            .unwrap();
        match watch.events.recv().await.unwrap() {
            NodeEvent::Created { path, .. } => {
                assert_eq!(path, "/arbor/service/foo/stable/10.0.0.1_8080");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_injected_watch_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_next_watch(StoreError::ConnectionLoss);
        assert!(matches!(
            store.watch_subtree("/arbor/service/foo").await,
            Err(StoreError::ConnectionLoss)
        ));
        assert!(store.watch_subtree("/arbor/service/foo").await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_scoped_to_prefix() {
        let store = MemoryStore::new();
        let mut watch = store.watch_subtree("/arbor/service/foo").await.unwrap();
        store.create("/arbor/service/bar/stable", "").await.unwrap();
        store.create("/arbor/service/foo/stable", "").await.unwrap();
        match watch.events.recv().await.unwrap() {
            NodeEvent::Created { path, .. } => assert_eq!(path, "/arbor/service/foo"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
