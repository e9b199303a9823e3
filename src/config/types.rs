use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Main registry-core configuration
///
/// A read-only value object handed to each component at construction. The
/// bootstrap layer owns loading and live reloads; the core never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// First component of every store path
    #[serde(default = "default_node_root")]
    pub node_root: String,
    /// Known e-zone prefixes, used to split `ezone-cluster` names
    #[serde(default)]
    pub ezones: Vec<String>,
    /// Route intents; the first entry is the default intent
    #[serde(default = "default_intents")]
    pub intents: Vec<String>,
    /// Default-route fallback tiers
    #[serde(default)]
    pub default_route: DefaultRoutePolicy,
    /// Route hijack staging and force-routing tables
    #[serde(default)]
    pub hijack: HijackConfig,
    /// Tree holder startup settings
    #[serde(default)]
    pub holder: HolderConfig,
    /// Idle holder cleaner settings
    #[serde(default)]
    pub cleaner: CleanerConfig,
}

fn default_node_root() -> String {
    "arbor".to_string()
}

fn default_intents() -> Vec<String> {
    vec!["direct".to_string()]
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            node_root: default_node_root(),
            ezones: Vec::new(),
            intents: default_intents(),
            default_route: DefaultRoutePolicy::default(),
            hijack: HijackConfig::default(),
            holder: HolderConfig::default(),
            cleaner: CleanerConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// The intent implied when a route lookup names none.
    pub fn default_intent(&self) -> &str {
        self.intents.first().map(String::as_str).unwrap_or("direct")
    }

    /// Extract the e-zone prefix of a cluster name, if it names a known zone.
    pub fn ezone_of<'a>(&self, cluster_name: &'a str) -> Option<&'a str> {
        let (prefix, _) = cluster_name.split_once('-')?;
        self.ezones
            .iter()
            .any(|ezone| ezone == prefix)
            .then_some(prefix)
    }
}

/// Default-route fallback tiers, consulted when a destination cluster's
/// route table has no entry for the caller.
///
/// A tier that contains the intent key is authoritative even when it maps to
/// null; tiers advance only on a true miss.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultRoutePolicy {
    /// Per-e-zone `{intent -> cluster}` entries
    #[serde(default)]
    pub ezone: HashMap<String, HashMap<String, Option<String>>>,
    /// Zone-independent `{intent -> cluster}` entries
    #[serde(default)]
    pub overall: HashMap<String, Option<String>>,
    /// Global static fallback
    #[serde(default)]
    pub global: HashMap<String, Option<String>>,
}

/// Staged-rollout and force-routing tables for route hijacking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HijackConfig {
    /// Staged mode table: source application -> e-zone (or "overall") -> mode
    #[serde(default)]
    pub staged: HashMap<String, HashMap<String, String>>,
    /// Per-e-zone default mode for applications absent from the staged table
    #[serde(default)]
    pub ezone_default: HashMap<String, String>,
    /// Global override switch for the force-route table
    #[serde(default)]
    pub force_routing_enabled: bool,
    /// Force-route table: caller-declared cluster -> physical cluster
    #[serde(default)]
    pub force_routing_clusters: HashMap<String, String>,
    /// Destination applications rewritten regardless of computed mode
    #[serde(default)]
    pub force_enabled_destinations: HashSet<String>,
    /// Per-source exclusions from `force_enabled_destinations`
    #[serde(default)]
    pub force_enable_exclusions: HashMap<String, HashSet<String>>,
    /// Applications exempt from hijacking entirely
    #[serde(default)]
    pub legacy_applications: HashSet<String>,
    /// Source applications skipped by bad-route detection
    #[serde(default)]
    pub bad_route_source_blacklist: HashSet<String>,
    /// Destination `application/cluster` pairs skipped by bad-route detection
    #[serde(default)]
    pub bad_route_destination_blacklist: HashSet<String>,
}

impl HijackConfig {
    /// Key format of `bad_route_destination_blacklist`.
    pub fn destination_key(application: &str, cluster: &str) -> String {
        format!("{}/{}", application, cluster)
    }
}

/// Tree holder startup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolderConfig {
    /// How long a watcher waits for a holder's initial full read, in seconds
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    /// How many holders may be mid-initialization simultaneously
    #[serde(default = "default_startup_concurrency")]
    pub startup_concurrency: usize,
}

fn default_init_timeout_secs() -> u64 {
    10
}

fn default_startup_concurrency() -> usize {
    16
}

impl Default for HolderConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: default_init_timeout_secs(),
            startup_concurrency: default_startup_concurrency(),
        }
    }
}

impl HolderConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }
}

/// Idle holder cleaner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanerConfig {
    /// Record last-used timestamps at all
    #[serde(default)]
    pub track_enabled: bool,
    /// Run evictions at all
    #[serde(default)]
    pub clean_enabled: bool,
    /// Holders unused for longer than this are eviction candidates, in seconds
    #[serde(default = "default_idle_offset_secs")]
    pub idle_offset_secs: u64,
    /// Cleaner loop period, in seconds
    #[serde(default = "default_clean_period_secs")]
    pub period_secs: u64,
    /// Resource-pressure gate, e.g. `"cpu > 80 or memory > 75"`.
    /// Eviction only happens while this evaluates true.
    #[serde(default = "default_pressure_condition")]
    pub pressure_condition: String,
}

fn default_idle_offset_secs() -> u64 {
    3600
}

fn default_clean_period_secs() -> u64 {
    300
}

fn default_pressure_condition() -> String {
    "cpu > 80 or memory > 80".to_string()
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            track_enabled: false,
            clean_enabled: false,
            idle_offset_secs: default_idle_offset_secs(),
            period_secs: default_clean_period_secs(),
            pressure_condition: default_pressure_condition(),
        }
    }
}

impl CleanerConfig {
    pub fn idle_offset(&self) -> Duration {
        Duration::from_secs(self.idle_offset_secs)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}
