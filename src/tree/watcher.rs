//! Tree watcher
//!
//! Per-session aggregator over one or more tree holders. A watcher turns
//! holder-level event streams into a single ordered message sequence for one
//! long-polling subscriber, applying cluster whitelisting, coalescing, and
//! route-change detection. Messages are pulled with [`TreeWatcher::next_message`];
//! the stream is infinite unless a life span is set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use metrics::counter;
use serde_json::{json, Map, Value};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::warn;

use crate::config::{HijackConfig, RegistryConfig};
use crate::error::RegistryResult;
use crate::route::{split_targets, ClusterMap, ClusterResolver, RouteKey};
use crate::store::NodeType;
use crate::tree::event::{EventKind, TreeEvent};
use crate::tree::holder::TreeHolder;
use crate::tree::hub::{HolderKey, TreeHub};

const HEARTBEAT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    All,
    Update,
    Delete,
    Ping,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::All => "all",
            MessageKind::Update => "update",
            MessageKind::Delete => "delete",
            MessageKind::Ping => "ping",
        }
    }
}

/// One message of the long-polling stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchMessage {
    pub kind: MessageKind,
    pub body: Value,
}

impl WatchMessage {
    fn ping() -> Self {
        Self {
            kind: MessageKind::Ping,
            body: json!({}),
        }
    }
}

enum Wakeup {
    Event(Option<(HolderKey, Result<TreeEvent, BroadcastStreamRecvError>)>),
    Heartbeat,
}

pub struct TreeWatcher {
    hub: TreeHub,
    config: Arc<RegistryConfig>,
    from_application: Option<String>,
    from_cluster: Option<String>,
    life_span: Option<Duration>,
    with_initial: bool,
    holders: HashMap<HolderKey, Arc<TreeHolder>>,
    streams: StreamMap<HolderKey, BroadcastStream<TreeEvent>>,
    cluster_maps: HashMap<HolderKey, ClusterMap>,
    whitelist: HashMap<HolderKey, HashSet<String>>,
    started_at: Option<Instant>,
    sent_initial: bool,
}

impl TreeWatcher {
    pub fn new(hub: TreeHub, config: Arc<RegistryConfig>) -> Self {
        Self {
            hub,
            config,
            from_application: None,
            from_cluster: None,
            life_span: None,
            with_initial: false,
            holders: HashMap::new(),
            streams: StreamMap::new(),
            cluster_maps: HashMap::new(),
            whitelist: HashMap::new(),
            started_at: None,
            sent_initial: false,
        }
    }

    /// Declare the caller's identity, enabling per-intent route tracking.
    pub fn with_from(mut self, application: &str, cluster: &str) -> Self {
        self.from_application = Some(application.to_string());
        self.from_cluster = Some(cluster.to_string());
        self
    }

    /// End the stream cleanly once this much time has passed.
    pub fn with_life_span(mut self, life_span: Duration) -> Self {
        self.life_span = Some(life_span);
        self
    }

    /// Emit a full snapshot as the first message.
    pub fn with_initial(mut self, with_initial: bool) -> Self {
        self.with_initial = with_initial;
        self
    }

    /// Register interest in one `(application, type)` subtree.
    ///
    /// Lazily starts the holder, waits (bounded) for its initial read, and
    /// seeds this session's cluster-resolution state. On timeout the holder
    /// is released so the next attempt starts clean.
    pub async fn watch(&mut self, application: &str, type_name: NodeType) -> RegistryResult<()> {
        let key = (application.to_string(), type_name);
        if self.holders.contains_key(&key) {
            return Ok(());
        }
        let holder = self.hub.get_tree_holder(application, type_name);
        if let Err(error) = holder
            .block_until_initialized(self.config.holder.init_timeout())
            .await
        {
            self.hub.release_tree_holder(application, type_name);
            return Err(error);
        }

        self.streams
            .insert(key.clone(), BroadcastStream::new(holder.subscribe()));
        let mut map = ClusterMap::new();
        for (name, resolved) in holder.list_cluster_routes(
            self.from_application.as_deref(),
            self.from_cluster.as_deref(),
        ) {
            map.replace(&name, resolved);
        }
        self.cluster_maps.insert(key.clone(), map);
        self.holders.insert(key, holder);
        Ok(())
    }

    /// Restrict reporting for `(application, type)` to the given cluster.
    /// Once any whitelist entry exists for a key, only those clusters are
    /// reported for it.
    pub fn limit_cluster_name(&mut self, application: &str, type_name: NodeType, cluster: &str) {
        self.whitelist
            .entry((application.to_string(), type_name))
            .or_default()
            .insert(cluster.to_string());
    }

    /// Drop all holder subscriptions. The stream ends after this.
    pub fn detach(&mut self) {
        self.streams.clear();
        self.holders.clear();
        self.cluster_maps.clear();
    }

    /// Produce the next message of the session stream.
    ///
    /// Returns `None` only once the configured life span has elapsed.
    pub async fn next_message(&mut self) -> Option<WatchMessage> {
        let started_at = *self.started_at.get_or_insert_with(Instant::now);
        let life_deadline = self.life_span.map(|life_span| started_at + life_span);

        if self.with_initial && !self.sent_initial {
            self.sent_initial = true;
            return Some(self.full_message());
        }

        let heartbeat_at = Instant::now() + HEARTBEAT;
        loop {
            if let Some(deadline) = life_deadline {
                if Instant::now() >= deadline {
                    return None;
                }
            }
            let wakeup = tokio::select! {
                event = self.streams.next(), if !self.streams.is_empty() => Wakeup::Event(event),
                _ = tokio::time::sleep_until(heartbeat_at) => Wakeup::Heartbeat,
            };
            match wakeup {
                Wakeup::Event(Some((key, Ok(event)))) => {
                    if let Some(message) = self.handle_event(&key, event) {
                        return Some(message);
                    }
                }
                Wakeup::Event(Some((key, Err(BroadcastStreamRecvError::Lagged(skipped))))) => {
                    warn!(
                        application = key.0.as_str(),
                        skipped, "watcher lagged behind holder events"
                    );
                    // Dropped events may include route changes; a full dump
                    // is the only safe recovery.
                    return Some(self.full_message());
                }
                Wakeup::Event(None) => {
                    // Every watched holder closed; only heartbeats remain.
                }
                Wakeup::Heartbeat => {
                    if let Some(deadline) = life_deadline {
                        if Instant::now() >= deadline {
                            return None;
                        }
                    }
                    return Some(WatchMessage::ping());
                }
            }
        }
    }

    fn handle_event(&mut self, key: &HolderKey, event: TreeEvent) -> Option<WatchMessage> {
        match event.path.level() {
            // Application- and cluster-level changes can redirect which leaf
            // nodes matter; any resolution change forces a full dump.
            2 | 3 => {
                let cluster = event.path.cluster_name().map(str::to_string);
                if self.update_cluster_route(key, cluster.as_deref()) {
                    counter!("arbor_route_changed_dumps_total").increment(1);
                    return Some(self.full_message());
                }
                None
            }
            4 => self.leaf_message(key, &event),
            _ => None,
        }
    }

    fn leaf_message(&mut self, key: &HolderKey, event: &TreeEvent) -> Option<WatchMessage> {
        let cluster = event.path.cluster_name()?;
        if let Some(relevant) = self.relevant_clusters(key) {
            if !relevant.contains(cluster) {
                return None;
            }
        }
        let data_name = event.path.data_name()?;
        let (kind, value) = match event.kind {
            EventKind::Deleted => (MessageKind::Delete, Value::Null),
            _ => (
                MessageKind::Update,
                Value::String(event.data.clone().unwrap_or_default()),
            ),
        };
        let (application, type_name) = key;
        let body = json!({
            type_name.as_str(): {
                application: {
                    cluster: {
                        data_name: { "value": value }
                    }
                }
            }
        });
        Some(WatchMessage { kind, body })
    }

    /// Recompute the cluster-resolution entries affected by an event and
    /// report whether the session's view of routing changed.
    fn update_cluster_route(&mut self, key: &HolderKey, event_cluster: Option<&str>) -> bool {
        let Some(holder) = self.holders.get(key) else {
            return false;
        };
        let Some(map) = self.cluster_maps.get_mut(key) else {
            return false;
        };
        let before = map.snapshot();
        let resolver = ClusterResolver::new(&self.config, holder.as_ref());

        let mut pseudo_keys = HashSet::new();
        if let (Some(application), Some(from_cluster)) =
            (&self.from_application, &self.from_cluster)
        {
            for intent in &self.config.intents {
                let route_key = RouteKey::new(application.as_str(), intent.as_str())
                    .serialize(self.config.default_intent());
                let resolved = resolver.resolve(
                    from_cluster,
                    Some(application),
                    Some(intent),
                    Some(from_cluster),
                );
                map.replace(&route_key, resolved);
                pseudo_keys.insert(route_key);
            }
        }
        if let Some(cluster) = event_cluster {
            map.replace(cluster, resolver.resolve(cluster, None, None, None));
        }

        let after = map.snapshot();
        let mut affected = HashSet::new();
        for name in before.keys().chain(after.keys()) {
            // A cluster appearing with no resolution redirects nothing, so
            // "absent" and "resolves to itself" count as the same state.
            let old = before.get(name).cloned().flatten();
            let new = after.get(name).cloned().flatten();
            if old == new {
                continue;
            }
            if pseudo_keys.contains(name) {
                if let Some(from_cluster) = &self.from_cluster {
                    affected.insert(from_cluster.clone());
                }
            } else {
                affected.insert(name.clone());
            }
            for resolved in [&old, &new].into_iter().flatten() {
                affected.extend(split_targets(resolved).map(str::to_string));
            }
        }
        if affected.is_empty() {
            return false;
        }
        match self.whitelist.get(key) {
            Some(whitelist) if !whitelist.is_empty() => {
                affected.iter().any(|name| whitelist.contains(name))
            }
            _ => true,
        }
    }

    /// The clusters currently worth reporting for one key: the whitelist
    /// plus every physical target the whitelisted (and caller-route)
    /// resolutions point at. `None` means no restriction.
    fn relevant_clusters(&self, key: &HolderKey) -> Option<HashSet<String>> {
        let whitelist = self.whitelist.get(key)?;
        if whitelist.is_empty() {
            return None;
        }
        let map = self.cluster_maps.get(key);
        let mut relevant = whitelist.clone();
        for cluster in whitelist {
            if let Some(Some(resolved)) = map.and_then(|map| map.resolved(cluster)) {
                relevant.extend(split_targets(resolved).map(str::to_string));
            }
        }
        if let Some(application) = &self.from_application {
            for intent in &self.config.intents {
                let route_key = RouteKey::new(application.as_str(), intent.as_str())
                    .serialize(self.config.default_intent());
                if let Some(Some(resolved)) = map.and_then(|map| map.resolved(&route_key)) {
                    relevant.extend(split_targets(resolved).map(str::to_string));
                }
            }
        }
        Some(relevant)
    }

    /// Build a full dump enumerating every watched `(type, application)`
    /// pair, even when empty.
    fn full_message(&self) -> WatchMessage {
        let mut body = Map::new();
        for ((application, type_name), holder) in &self.holders {
            let key = (application.clone(), *type_name);
            let filter = self.relevant_clusters(&key);
            let info = holder.list_service_info(filter.as_ref());
            let entry = body
                .entry(type_name.as_str().to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(types) = entry {
                types.insert(application.clone(), info);
            }
        }
        for (application, cluster) in self.detect_bad_routes(&body) {
            warn!(
                from_application = self.from_application.as_deref().unwrap_or(""),
                application = application.as_str(),
                cluster = cluster.as_str(),
                "route points at an empty cluster"
            );
            counter!("arbor_bad_routes_total", "application" => application).increment(1);
        }
        WatchMessage {
            kind: MessageKind::All,
            body: Value::Object(body),
        }
    }

    /// Watched `(application, cluster)` pairs that resolve somewhere yet
    /// came back empty in the dump. Detection only; the outgoing message is
    /// never altered, the caller just reports the pairs.
    fn detect_bad_routes(&self, body: &Map<String, Value>) -> Vec<(String, String)> {
        let mut detected = Vec::new();
        let Some(from_application) = &self.from_application else {
            return detected;
        };
        let hijack = &self.config.hijack;
        if hijack.legacy_applications.contains(from_application)
            || hijack.bad_route_source_blacklist.contains(from_application)
        {
            return detected;
        }
        for ((application, type_name), whitelist) in &self.whitelist {
            let Some(map) = self.cluster_maps.get(&(application.clone(), *type_name)) else {
                continue;
            };
            let fragment = body
                .get(type_name.as_str())
                .and_then(|types| types.get(application));
            for cluster in whitelist {
                let destination = HijackConfig::destination_key(application, cluster);
                if hijack.bad_route_destination_blacklist.contains(&destination) {
                    continue;
                }
                let Some(Some(resolved)) = map.resolved(cluster) else {
                    continue;
                };
                let all_empty = split_targets(resolved).all(|target| {
                    fragment
                        .and_then(|info| info.get(target))
                        .and_then(Value::as_object)
                        .map(Map::is_empty)
                        .unwrap_or(true)
                });
                if all_empty {
                    detected.push((application.clone(), cluster.clone()));
                }
            }
        }
        detected
    }
}
