//! Cluster name resolution
//!
//! Resolves a nominal cluster name to a physical one through the route
//! table, the default-route fallback tiers, a single symlink hop, and the
//! force-route override table. Resolution reads cluster documents from a
//! local tree mirror and never performs a network round-trip.

use metrics::counter;
use tracing::warn;

use crate::config::RegistryConfig;
use crate::route::{ClusterDoc, RouteKey};

/// Read access to the cluster documents of one application's subtree.
/// Implemented by the tree holder's local mirror.
pub trait RouteDataSource {
    /// Raw payload of the cluster-level document, or `None` if absent.
    fn cluster_data(&self, cluster_name: &str) -> Option<String>;
}

impl RouteDataSource for std::collections::HashMap<String, String> {
    fn cluster_data(&self, cluster_name: &str) -> Option<String> {
        self.get(cluster_name).cloned()
    }
}

pub struct ClusterResolver<'a> {
    config: &'a RegistryConfig,
    source: &'a dyn RouteDataSource,
}

impl<'a> ClusterResolver<'a> {
    pub fn new(config: &'a RegistryConfig, source: &'a dyn RouteDataSource) -> Self {
        Self { config, source }
    }

    /// Resolve a nominal cluster name to a physical one.
    ///
    /// Returns `None` when the final name equals the input, signalling that
    /// no rewrite is needed.
    pub fn resolve(
        &self,
        cluster_name: &str,
        from_application: Option<&str>,
        intent: Option<&str>,
        force_route_cluster: Option<&str>,
    ) -> Option<String> {
        let intent = intent.unwrap_or_else(|| self.config.default_intent());
        let force_table = &self.config.hijack.force_routing_clusters;

        // The force-route table wins over the route table and symlinks, with
        // one guard: a destination that is itself a force-route *value* and
        // arrives without caller context is already physical and must not be
        // symlink-followed.
        if self.config.hijack.force_routing_enabled {
            if let Some(declared) = force_route_cluster {
                if let Some(target) = force_table.get(declared) {
                    return (target != cluster_name).then(|| target.clone());
                }
            } else if from_application.is_none()
                && force_table.values().any(|target| target == cluster_name)
            {
                return None;
            }
        }

        let mut name = cluster_name.to_string();

        if let Some(from_application) = from_application {
            name = self
                .route_step(cluster_name, from_application, intent, force_route_cluster)
                .unwrap_or(name);
        }

        // At most one symlink hop; chains are deliberately not followed.
        if let Some(doc) = self.load_doc(&name) {
            if let Some(link) = doc.link_name() {
                name = link;
            }
        }

        (name != cluster_name).then_some(name)
    }

    /// Route-table lookup with fallback to the default-route tiers.
    /// Returns `None` when neither yields a rewrite.
    fn route_step(
        &self,
        cluster_name: &str,
        from_application: &str,
        intent: &str,
        force_route_cluster: Option<&str>,
    ) -> Option<String> {
        let key =
            RouteKey::new(from_application, intent).serialize(self.config.default_intent());
        let route_entry = self
            .load_doc(cluster_name)
            .and_then(|doc| doc.route.get(&key).cloned());
        match route_entry {
            // Present and non-nil: the route table takes precedence over
            // every default-route tier.
            Some(Some(target)) => Some(target),
            // Present but nil: authoritative, no rewrite.
            Some(None) => None,
            // True miss: consult the fallback tiers.
            None => self.default_route_step(intent, force_route_cluster),
        }
    }

    /// Tiered default-route lookup: caller's e-zone entry, then the overall
    /// entry, then the global static policy. A tier containing the intent
    /// key is authoritative even when it maps to nil.
    fn default_route_step(
        &self,
        intent: &str,
        force_route_cluster: Option<&str>,
    ) -> Option<String> {
        let policy = &self.config.default_route;
        let ezone_tier = force_route_cluster
            .and_then(|cluster| self.config.ezone_of(cluster))
            .and_then(|ezone| policy.ezone.get(ezone))
            .and_then(|tier| tier.get(intent).cloned());
        ezone_tier
            .or_else(|| policy.overall.get(intent).cloned())
            .or_else(|| policy.global.get(intent).cloned())
            .flatten()
    }

    /// Decode one cluster document, degrading malformed payloads to "no
    /// document" so that resolution stays available.
    fn load_doc(&self, cluster_name: &str) -> Option<ClusterDoc> {
        let raw = self.source.cluster_data(cluster_name)?;
        if raw.is_empty() {
            return None;
        }
        match serde_json::from_str(&raw) {
            Ok(doc) => Some(doc),
            Err(error) => {
                warn!(cluster = cluster_name, %error, "malformed cluster document");
                counter!("arbor_malformed_documents_total").increment(1);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(cluster, doc)| (cluster.to_string(), doc.to_string()))
            .collect()
    }

    fn config() -> RegistryConfig {
        RegistryConfig {
            ezones: vec!["alta1".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_no_data_is_noop() {
        let config = config();
        let source = source(&[]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(resolver.resolve("stable", None, None, None), None);
        assert_eq!(resolver.resolve("stable", Some("bar"), None, None), None);
    }

    #[test]
    fn test_route_table_takes_precedence_over_default_policy() {
        let mut config = config();
        config
            .default_route
            .overall
            .insert("direct".to_string(), Some("fallback".to_string()));
        let source = source(&[("stable", r#"{"route": {"bar": "stable-2"}}"#)]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(
            resolver.resolve("stable", Some("bar"), None, None),
            Some("stable-2".to_string())
        );
    }

    #[test]
    fn test_route_miss_falls_back_to_default_policy() {
        let mut config = config();
        config
            .default_route
            .overall
            .insert("direct".to_string(), Some("channel-stable-1".to_string()));
        let source = source(&[("stable", r#"{"route": {"other": "stable-2"}}"#)]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(
            resolver.resolve("stable", Some("bar"), None, None),
            Some("channel-stable-1".to_string())
        );
    }

    #[test]
    fn test_nil_route_entry_is_authoritative() {
        let mut config = config();
        config
            .default_route
            .overall
            .insert("direct".to_string(), Some("fallback".to_string()));
        let source = source(&[("stable", r#"{"route": {"bar": null}}"#)]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(resolver.resolve("stable", Some("bar"), None, None), None);
    }

    #[test]
    fn test_ezone_tier_wins_over_overall() {
        let mut config = config();
        config.default_route.ezone.insert(
            "alta1".to_string(),
            HashMap::from([("direct".to_string(), Some("alta1-stable".to_string()))]),
        );
        config
            .default_route
            .overall
            .insert("direct".to_string(), Some("overall-stable".to_string()));
        let source = source(&[]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(
            resolver.resolve("stable", Some("bar"), None, Some("alta1-stable")),
            Some("alta1-stable".to_string())
        );
        // Unknown caller zone advances to the overall tier.
        assert_eq!(
            resolver.resolve("stable", Some("bar"), None, Some("stable")),
            Some("overall-stable".to_string())
        );
    }

    #[test]
    fn test_ezone_tier_nil_does_not_advance() {
        let mut config = config();
        config.default_route.ezone.insert(
            "alta1".to_string(),
            HashMap::from([("direct".to_string(), None)]),
        );
        config
            .default_route
            .overall
            .insert("direct".to_string(), Some("overall-stable".to_string()));
        let source = source(&[]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(
            resolver.resolve("stable", Some("bar"), None, Some("alta1-stable")),
            None
        );
    }

    #[test]
    fn test_symlink_single_hop_only() {
        let config = config();
        let source = source(&[
            ("a", r#"{"link": ["b"]}"#),
            ("b", r#"{"link": ["c"]}"#),
        ]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(resolver.resolve("a", None, None, None), Some("b".to_string()));
        assert_eq!(resolver.resolve("b", None, None, None), Some("c".to_string()));
    }

    #[test]
    fn test_symlink_applied_after_route() {
        let config = config();
        let source = source(&[
            ("stable", r#"{"route": {"bar": "stable-2"}}"#),
            ("stable-2", r#"{"link": ["phys-1", "phys-2"]}"#),
        ]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(
            resolver.resolve("stable", Some("bar"), None, None),
            Some("phys-1+phys-2".to_string())
        );
    }

    #[test]
    fn test_malformed_document_degrades_to_default_policy() {
        let mut config = config();
        config
            .default_route
            .overall
            .insert("direct".to_string(), Some("fallback".to_string()));
        let source = source(&[("stable", "corrupt payload")]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(
            resolver.resolve("stable", Some("bar"), None, None),
            Some("fallback".to_string())
        );
    }

    #[test]
    fn test_force_route_wins() {
        let mut config = config();
        config.hijack.force_routing_enabled = true;
        config
            .hijack
            .force_routing_clusters
            .insert("alta1-stable".to_string(), "forced".to_string());
        let source = source(&[("stable", r#"{"route": {"bar": "stable-2"}}"#)]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(
            resolver.resolve("stable", Some("bar"), None, Some("alta1-stable")),
            Some("forced".to_string())
        );
    }

    #[test]
    fn test_forced_destination_without_context_is_left_alone() {
        let mut config = config();
        config.hijack.force_routing_enabled = true;
        config
            .hijack
            .force_routing_clusters
            .insert("alta1-stable".to_string(), "forced".to_string());
        // "forced" has a symlink, but as an already-forced destination it
        // must not be followed.
        let source = source(&[("forced", r#"{"link": ["elsewhere"]}"#)]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(resolver.resolve("forced", None, None, None), None);
    }

    #[test]
    fn test_intent_route_key() {
        let mut config = config();
        config.intents = vec!["direct".to_string(), "mirror".to_string()];
        let source = source(&[(
            "stable",
            r#"{"route": {"bar": "stable-1", "bar@mirror": "stable-2"}}"#,
        )]);
        let resolver = ClusterResolver::new(&config, &source);
        assert_eq!(
            resolver.resolve("stable", Some("bar"), Some("direct"), None),
            Some("stable-1".to_string())
        );
        assert_eq!(
            resolver.resolve("stable", Some("bar"), Some("mirror"), None),
            Some("stable-2".to_string())
        );
    }
}
