//! Tree holder
//!
//! The authoritative in-memory mirror of one `{type, application}` subtree.
//! A holder performs the initial full read under the hub's startup budget,
//! applies live node events to its mirror, and republishes them as typed
//! [`TreeEvent`]s for every attached watcher. Reads never touch the network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::route::{ClusterResolver, RouteDataSource, RouteKey};
use crate::store::{CoordinationStore, NodeEvent, NodeType, StructuredPath};
use crate::tree::event::{EventKind, TreeEvent};
use crate::tree::hub::HubInner;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Pending,
    Ready,
    Closed,
}

#[derive(Default)]
struct ClusterState {
    data: Option<String>,
    instances: HashMap<String, String>,
}

#[derive(Default)]
struct MirrorState {
    application_data: Option<String>,
    clusters: HashMap<String, ClusterState>,
}

pub struct TreeHolder {
    application: String,
    type_name: NodeType,
    config: Arc<RegistryConfig>,
    store: Arc<dyn CoordinationStore>,
    hub: Weak<HubInner>,
    mirror: RwLock<MirrorState>,
    events: broadcast::Sender<TreeEvent>,
    init: watch::Sender<InitState>,
    started: AtomicBool,
    closed: AtomicBool,
    /// Startup throttle permit, held from acquisition until initialization
    /// completes or the holder closes. Dropping it is the single release
    /// path for the startup budget slot.
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TreeHolder {
    pub(crate) fn new(
        application: &str,
        type_name: NodeType,
        config: Arc<RegistryConfig>,
        store: Arc<dyn CoordinationStore>,
        hub: Weak<HubInner>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (init, _) = watch::channel(InitState::Pending);
        Arc::new(Self {
            application: application.to_string(),
            type_name,
            config,
            store,
            hub,
            mirror: RwLock::new(MirrorState::default()),
            events,
            init,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            permit: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn application_name(&self) -> &str {
        &self.application
    }

    pub fn type_name(&self) -> NodeType {
        self.type_name
    }

    /// Begin subtree synchronization. Consumes one slot of the startup
    /// concurrency budget until initialization completes or fails.
    pub(crate) fn start(self: &Arc<Self>, startup: Arc<Semaphore>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let holder = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let permit = match startup.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            {
                let mut slot = holder.permit.lock();
                if holder.closed.load(Ordering::SeqCst) {
                    // Closed while waiting for the budget; the permit drops
                    // here instead of leaking into a dead holder.
                    return;
                }
                *slot = Some(permit);
            }
            holder.run_watch().await;
        });
        *self.task.lock() = Some(handle);
    }

    async fn run_watch(&self) {
        let prefix = match StructuredPath::application(self.type_name, &self.application) {
            Ok(path) => path.render(&self.config.node_root),
            Err(error) => {
                warn!(application = %self.application, %error, "invalid application name");
                self.close();
                return;
            }
        };
        let mut watch = match self.store.watch_subtree(&prefix).await {
            Ok(watch) => watch,
            Err(error) => {
                warn!(
                    application = %self.application,
                    type_name = %self.type_name,
                    %error,
                    "subtree watch failed to start"
                );
                self.close();
                return;
            }
        };

        {
            let mut mirror = self.mirror.write();
            for (path, data) in watch.initial.drain(..) {
                self.apply_node(&mut mirror, &path, Some(data));
            }
        }
        self.init.send_replace(InitState::Ready);
        self.release_permit();
        info!(
            application = %self.application,
            type_name = %self.type_name,
            "tree holder initialized"
        );
        counter!("arbor_tree_initializations_total").increment(1);

        loop {
            match watch.events.recv().await {
                Ok(event) => self.dispatch(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        application = %self.application,
                        skipped,
                        "holder lagged behind the store event stream"
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Translate one raw node event into a mirror update plus a republished
    /// tree-changed notification.
    fn dispatch(&self, event: NodeEvent) {
        match event {
            NodeEvent::Suspended | NodeEvent::Reconnected | NodeEvent::Lost => {
                info!(
                    application = %self.application,
                    type_name = %self.type_name,
                    event = ?event,
                    "store connectivity changed"
                );
                counter!("arbor_store_connectivity_events_total").increment(1);
            }
            NodeEvent::Created { path, data } => {
                self.apply_and_publish(EventKind::Created, &path, Some(data));
            }
            NodeEvent::Updated { path, data } => {
                self.apply_and_publish(EventKind::Updated, &path, Some(data));
            }
            NodeEvent::Deleted { path } => {
                self.apply_and_publish(EventKind::Deleted, &path, None);
            }
        }
    }

    fn apply_and_publish(&self, kind: EventKind, path: &str, data: Option<String>) {
        let parsed = match StructuredPath::parse(&self.config.node_root, path) {
            Ok(parsed) => parsed,
            Err(error) => {
                debug!(path, %error, "ignoring event with unparsable path");
                return;
            }
        };
        if parsed.application_name() != Some(self.application.as_str())
            || parsed.type_name() != Some(self.type_name)
        {
            return;
        }
        {
            let mut mirror = self.mirror.write();
            match kind {
                EventKind::Deleted => self.remove_node(&mut mirror, &parsed),
                _ => self.apply_parsed(&mut mirror, &parsed, data.clone()),
            }
        }
        // Mirror first, then publish: a full dump triggered by this event
        // must reflect post-event state.
        let _ = self.events.send(TreeEvent {
            kind,
            path: parsed,
            data,
        });
    }

    fn apply_node(&self, mirror: &mut MirrorState, path: &str, data: Option<String>) {
        if let Ok(parsed) = StructuredPath::parse(&self.config.node_root, path) {
            self.apply_parsed(mirror, &parsed, data);
        }
    }

    fn apply_parsed(&self, mirror: &mut MirrorState, path: &StructuredPath, data: Option<String>) {
        match path.level() {
            2 => mirror.application_data = data,
            3 => {
                let cluster = path.cluster_name().unwrap_or_default();
                mirror.clusters.entry(cluster.to_string()).or_default().data = data;
            }
            4 => {
                let cluster = path.cluster_name().unwrap_or_default();
                let key = path.data_name().unwrap_or_default();
                mirror
                    .clusters
                    .entry(cluster.to_string())
                    .or_default()
                    .instances
                    .insert(key.to_string(), data.unwrap_or_default());
            }
            _ => {}
        }
    }

    fn remove_node(&self, mirror: &mut MirrorState, path: &StructuredPath) {
        match path.level() {
            2 => mirror.application_data = None,
            3 => {
                if let Some(cluster) = path.cluster_name() {
                    mirror.clusters.remove(cluster);
                }
            }
            4 => {
                if let (Some(cluster), Some(key)) = (path.cluster_name(), path.data_name()) {
                    if let Some(state) = mirror.clusters.get_mut(cluster) {
                        state.instances.remove(key);
                    }
                }
            }
            _ => {}
        }
    }

    /// Block until the initial full read completes or `timeout` elapses.
    /// On timeout the holder closes itself and vacates its hub slot so a
    /// later lookup gets a fresh attempt.
    pub async fn block_until_initialized(&self, timeout: Duration) -> RegistryResult<()> {
        let mut rx = self.init.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|state| *state != InitState::Pending))
            .await;
        match waited {
            Ok(Ok(state)) if *state == InitState::Ready => Ok(()),
            _ => {
                self.close();
                if let Some(hub) = self.hub.upgrade() {
                    hub.remove(&self.application, self.type_name, self);
                }
                counter!("arbor_tree_init_timeouts_total").increment(1);
                Err(RegistryError::TreeTimeout {
                    application: self.application.clone(),
                    type_name: self.type_name,
                })
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        *self.init.borrow() == InitState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to republished tree-changed notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    /// Idempotent teardown: releases the startup permit if initialization
    /// never finished and discards the local mirror.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_permit();
        self.init.send_replace(InitState::Closed);
        self.mirror.write().clusters.clear();
        gauge!("arbor_tree_holders").decrement(1.0);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn release_permit(&self) {
        self.permit.lock().take();
    }

    // Read-only snapshot queries against the local mirror.

    pub fn get_data(&self, cluster: &str, key: &str) -> Option<String> {
        self.mirror
            .read()
            .clusters
            .get(cluster)
            .and_then(|state| state.instances.get(key).cloned())
    }

    pub fn get_children(&self, cluster: &str) -> Vec<String> {
        self.mirror
            .read()
            .clusters
            .get(cluster)
            .map(|state| state.instances.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clusters(&self) -> Vec<String> {
        self.mirror.read().clusters.keys().cloned().collect()
    }

    pub fn application_data(&self) -> Option<String> {
        self.mirror.read().application_data.clone()
    }

    /// `(cluster_name, resolved_name)` for every cluster currently present,
    /// plus one pseudo-entry per configured intent carrying the resolution
    /// of the caller's own declared cluster. Watchers seed their
    /// `ClusterMap`s from this.
    pub fn list_cluster_routes(
        &self,
        from_application: Option<&str>,
        from_cluster: Option<&str>,
    ) -> Vec<(String, Option<String>)> {
        let resolver = ClusterResolver::new(&self.config, self);
        let mut routes: Vec<(String, Option<String>)> = self
            .clusters()
            .into_iter()
            .map(|cluster| {
                let resolved = resolver.resolve(&cluster, None, None, None);
                (cluster, resolved)
            })
            .collect();
        if let (Some(application), Some(cluster)) = (from_application, from_cluster) {
            for intent in &self.config.intents {
                let key = RouteKey::new(application, intent.as_str())
                    .serialize(self.config.default_intent());
                let resolved =
                    resolver.resolve(cluster, Some(application), Some(intent), Some(cluster));
                routes.push((key, resolved));
            }
        }
        routes
    }

    /// Snapshot of every live leaf node, as `(cluster, key, value)`.
    pub fn list_instance_nodes(&self) -> Vec<(String, String, String)> {
        let mirror = self.mirror.read();
        mirror
            .clusters
            .iter()
            .flat_map(|(cluster, state)| {
                state.instances.iter().map(move |(key, value)| {
                    (cluster.clone(), key.clone(), value.clone())
                })
            })
            .collect()
    }

    /// Body fragment `{cluster: {key: {"value": raw}}}` for a full dump.
    ///
    /// With a filter, every filtered cluster appears even when empty so
    /// subscribers can tell "no data yet" from "not watched".
    pub fn list_service_info(&self, cluster_filter: Option<&HashSet<String>>) -> Value {
        let mirror = self.mirror.read();
        let mut body = Map::new();
        if let Some(filter) = cluster_filter {
            for cluster in filter {
                body.insert(cluster.clone(), Value::Object(Map::new()));
            }
        }
        for (cluster, state) in &mirror.clusters {
            if let Some(filter) = cluster_filter {
                if !filter.contains(cluster) {
                    continue;
                }
            }
            let entry = body
                .entry(cluster.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = entry {
                for (key, value) in &state.instances {
                    map.insert(key.clone(), json!({ "value": value }));
                }
            }
        }
        Value::Object(body)
    }
}

impl RouteDataSource for TreeHolder {
    fn cluster_data(&self, cluster_name: &str) -> Option<String> {
        self.mirror
            .read()
            .clusters
            .get(cluster_name)
            .and_then(|state| state.data.clone())
    }
}
