//! Bidirectional cluster resolution map
//!
//! Tracks, per watcher session, what each nominal cluster currently resolves
//! to, plus the reverse multimap from resolved names back to the nominal
//! clusters pointing at them. The reverse side is what lets a watcher decide
//! whether an event on a physical cluster matters to a whitelisted nominal
//! one.

use std::collections::{HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum ClusterMapError {
    /// Registering a cluster twice without deregistering first is a
    /// programming error in the caller.
    #[error("cluster '{cluster}' is already registered")]
    AlreadyRegistered { cluster: String },
}

#[derive(Debug, Default)]
pub struct ClusterMap {
    forward: HashMap<String, Option<String>>,
    reverse: HashMap<String, HashSet<String>>,
}

impl ClusterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one nominal cluster and its resolved name (which may itself
    /// be a `+`-delimited multi-target symlink, or absent).
    pub fn register(
        &mut self,
        cluster: &str,
        resolved: Option<String>,
    ) -> Result<(), ClusterMapError> {
        if self.forward.contains_key(cluster) {
            return Err(ClusterMapError::AlreadyRegistered {
                cluster: cluster.to_string(),
            });
        }
        if let Some(resolved) = &resolved {
            self.reverse
                .entry(resolved.clone())
                .or_default()
                .insert(cluster.to_string());
        }
        self.forward.insert(cluster.to_string(), resolved);
        Ok(())
    }

    /// Remove one nominal cluster, returning its previous resolution.
    pub fn deregister(&mut self, cluster: &str) -> Option<Option<String>> {
        let resolved = self.forward.remove(cluster)?;
        if let Some(name) = &resolved {
            if let Some(clusters) = self.reverse.get_mut(name) {
                clusters.remove(cluster);
                if clusters.is_empty() {
                    self.reverse.remove(name);
                }
            }
        }
        Some(resolved)
    }

    /// Replace a cluster's resolution, registering it if absent.
    pub fn replace(&mut self, cluster: &str, resolved: Option<String>) {
        self.deregister(cluster);
        // Cannot fail: the key was just removed.
        let _ = self.register(cluster, resolved);
    }

    pub fn contains(&self, cluster: &str) -> bool {
        self.forward.contains_key(cluster)
    }

    /// Current resolution of a nominal cluster. Outer `None` means the
    /// cluster is not registered at all.
    pub fn resolved(&self, cluster: &str) -> Option<Option<&str>> {
        self.forward.get(cluster).map(Option::as_deref)
    }

    /// Nominal clusters currently resolving to the given name.
    pub fn clusters_of(&self, resolved: &str) -> Option<&HashSet<String>> {
        self.reverse.get(resolved)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.forward
            .iter()
            .map(|(cluster, resolved)| (cluster.as_str(), resolved.as_deref()))
    }

    /// Copy of the forward map, used for before/after diffing.
    pub fn snapshot(&self) -> HashMap<String, Option<String>> {
        self.forward.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_deregister_round_trip() {
        let mut map = ClusterMap::new();
        map.register("stable", Some("stable-1".to_string())).unwrap();
        map.register("beta", Some("stable-1".to_string())).unwrap();

        assert_eq!(map.resolved("stable"), Some(Some("stable-1")));
        assert_eq!(map.clusters_of("stable-1").unwrap().len(), 2);

        assert_eq!(
            map.deregister("stable"),
            Some(Some("stable-1".to_string()))
        );
        assert_eq!(map.resolved("stable"), None);
        assert_eq!(map.clusters_of("stable-1").unwrap().len(), 1);

        assert_eq!(map.deregister("beta"), Some(Some("stable-1".to_string())));
        assert!(map.clusters_of("stable-1").is_none());
        assert!(map.snapshot().is_empty());
    }

    #[test]
    fn test_double_register_rejected() {
        let mut map = ClusterMap::new();
        map.register("stable", None).unwrap();
        assert!(matches!(
            map.register("stable", Some("stable-1".to_string())),
            Err(ClusterMapError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn test_empty_resolution_has_no_reverse_entry() {
        let mut map = ClusterMap::new();
        map.register("stable", None).unwrap();
        assert_eq!(map.resolved("stable"), Some(None));
        assert!(map.clusters_of("stable").is_none());
    }

    #[test]
    fn test_replace_updates_reverse_map() {
        let mut map = ClusterMap::new();
        map.register("stable", Some("stable-1".to_string())).unwrap();
        map.replace("stable", Some("stable-2".to_string()));
        assert!(map.clusters_of("stable-1").is_none());
        assert_eq!(map.clusters_of("stable-2").unwrap().len(), 1);
    }
}
