//! Staged route hijacking
//!
//! A policy wrapper around [`ClusterResolver`] used to roll out
//! routing-table-driven behavior gradually: depending on the computed mode
//! it passes declared dependencies through, audits them against the
//! resolver's choice, or rewrites them outright. Mismatch diagnostics are
//! monitoring signals only and never change control flow.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use metrics::counter;
use tracing::{info, warn};

use crate::config::RegistryConfig;

#[derive(Debug, thiserror::Error)]
#[error("unknown hijack mode: {value}")]
pub struct ModeParseError {
    pub value: String,
}

/// Rollout stage of route hijacking for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HijackMode {
    /// Pass requests and responses through unchanged.
    Disabled,
    /// Resolve and compare without rewriting; report mismatches.
    Checking,
    /// Rewrite to the resolver's choice, still auditing mismatches.
    Enabled,
    /// Rewrite without the mismatch-detection pass.
    Standalone,
}

impl FromStr for HijackMode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(HijackMode::Disabled),
            "checking" => Ok(HijackMode::Checking),
            "enabled" => Ok(HijackMode::Enabled),
            "standalone" => Ok(HijackMode::Standalone),
            other => Err(ModeParseError {
                value: other.to_string(),
            }),
        }
    }
}

impl HijackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HijackMode::Disabled => "disabled",
            HijackMode::Checking => "checking",
            HijackMode::Enabled => "enabled",
            HijackMode::Standalone => "standalone",
        }
    }

    fn rewrites(&self) -> bool {
        matches!(self, HijackMode::Enabled | HijackMode::Standalone)
    }

    fn audits(&self) -> bool {
        matches!(self, HijackMode::Checking | HijackMode::Enabled)
    }
}

/// Per-request hijack policy for one caller identity.
pub struct RouteHijack<'a> {
    config: &'a RegistryConfig,
    from_application: Option<&'a str>,
    from_cluster: Option<&'a str>,
}

impl<'a> RouteHijack<'a> {
    pub fn new(
        config: &'a RegistryConfig,
        from_application: Option<&'a str>,
        from_cluster: Option<&'a str>,
    ) -> Self {
        Self {
            config,
            from_application,
            from_cluster,
        }
    }

    /// Compute the effective mode for this caller.
    ///
    /// Legacy-exempt callers and callers without a cluster identity are
    /// always `Disabled`; callers whose cluster appears in the forced-routing
    /// set are always `Standalone`; everyone else goes through the staged
    /// table and the per-e-zone default. Unparsable staged entries degrade to
    /// `Disabled`.
    pub fn mode(&self) -> HijackMode {
        let hijack = &self.config.hijack;
        let Some(application) = self.from_application else {
            return HijackMode::Disabled;
        };
        let Some(cluster) = self.from_cluster else {
            return HijackMode::Disabled;
        };
        if hijack.legacy_applications.contains(application) {
            return HijackMode::Disabled;
        }
        if hijack.force_routing_clusters.contains_key(cluster) {
            return HijackMode::Standalone;
        }

        let ezone = self.config.ezone_of(cluster);
        let staged = hijack.staged.get(application).and_then(|by_ezone| {
            ezone
                .and_then(|ezone| by_ezone.get(ezone))
                .or_else(|| by_ezone.get("overall"))
        });
        let raw = staged.or_else(|| ezone.and_then(|ezone| hijack.ezone_default.get(ezone)));
        match raw {
            Some(raw) => raw.parse().unwrap_or_else(|error: ModeParseError| {
                warn!(application, cluster, %error, "falling back to disabled hijack mode");
                HijackMode::Disabled
            }),
            None => HijackMode::Disabled,
        }
    }

    /// Whether rewriting is force-enabled for a destination application
    /// regardless of the computed mode.
    pub fn force_enabled_for(&self, dest_application: &str) -> bool {
        let hijack = &self.config.hijack;
        if !hijack.force_enabled_destinations.contains(dest_application) {
            return false;
        }
        match self.from_application {
            Some(source) => hijack
                .force_enable_exclusions
                .get(source)
                .map(|excluded| !excluded.contains(dest_application))
                .unwrap_or(true),
            None => true,
        }
    }

    /// Rewrite an inbound dependency map (destination application ->
    /// declared cluster set) according to the computed mode.
    ///
    /// `resolve` is the resolver's choice for one `(application, cluster)`
    /// pair; `None` means unchanged.
    pub fn hijack_watch_map<F>(
        &self,
        watch_map: HashMap<String, Vec<String>>,
        resolve: F,
    ) -> HashMap<String, Vec<String>>
    where
        F: Fn(&str, &str) -> Option<String>,
    {
        let mode = self.mode();
        watch_map
            .into_iter()
            .map(|(dest, clusters)| {
                if mode.audits() {
                    self.audit(&dest, &clusters, &resolve);
                }
                let rewrite = mode.rewrites() || self.force_enabled_for(&dest);
                let clusters = if rewrite {
                    self.rewrite_clusters(&dest, clusters, &resolve)
                } else {
                    clusters
                };
                (dest, clusters)
            })
            .collect()
    }

    /// Rewrite one outbound route response.
    pub fn hijack_route<F>(&self, dest_application: &str, declared_cluster: &str, resolve: F) -> String
    where
        F: Fn(&str, &str) -> Option<String>,
    {
        let mode = self.mode();
        if mode.audits() {
            self.audit(
                dest_application,
                std::slice::from_ref(&declared_cluster.to_string()),
                &resolve,
            );
        }
        if mode.rewrites() || self.force_enabled_for(dest_application) {
            resolve(dest_application, declared_cluster)
                .unwrap_or_else(|| declared_cluster.to_string())
        } else {
            declared_cluster.to_string()
        }
    }

    fn rewrite_clusters<F>(
        &self,
        dest_application: &str,
        clusters: Vec<String>,
        resolve: &F,
    ) -> Vec<String>
    where
        F: Fn(&str, &str) -> Option<String>,
    {
        let mut seen = HashSet::new();
        clusters
            .into_iter()
            .map(|cluster| resolve(dest_application, &cluster).unwrap_or(cluster))
            .filter(|cluster| seen.insert(cluster.clone()))
            .collect()
    }

    /// Compare declared clusters against the resolver's choice, emitting
    /// diagnostics on mismatch or on ambiguous multi-cluster declarations.
    /// Detection only: the declared set is never altered here.
    fn audit<F>(&self, dest_application: &str, clusters: &[String], resolve: &F)
    where
        F: Fn(&str, &str) -> Option<String>,
    {
        if clusters.len() > 1 {
            info!(
                from_application = self.from_application.unwrap_or(""),
                dest_application,
                declared = clusters.len(),
                "ambiguous declared cluster set"
            );
            counter!(
                "arbor_route_ambiguous_total",
                "dest_application" => dest_application.to_string()
            )
            .increment(1);
        }
        for cluster in clusters {
            if let Some(resolved) = resolve(dest_application, cluster) {
                if &resolved != cluster {
                    info!(
                        from_application = self.from_application.unwrap_or(""),
                        dest_application,
                        declared = cluster.as_str(),
                        resolved = resolved.as_str(),
                        "declared cluster disagrees with resolved route"
                    );
                    counter!(
                        "arbor_route_mismatch_total",
                        "dest_application" => dest_application.to_string()
                    )
                    .increment(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RegistryConfig {
        let mut config = RegistryConfig {
            ezones: vec!["alta1".to_string()],
            ..Default::default()
        };
        config.hijack.ezone_default.insert(
            "alta1".to_string(),
            "checking".to_string(),
        );
        config
    }

    #[test]
    fn test_mode_parse_fallback() {
        assert_eq!("enabled".parse::<HijackMode>().unwrap(), HijackMode::Enabled);
        assert!("Enabled".parse::<HijackMode>().is_err());
        assert!("sometimes".parse::<HijackMode>().is_err());
    }

    #[test]
    fn test_mode_selection_precedence() {
        let mut config = config();
        config.hijack.staged.insert(
            "bar".to_string(),
            HashMap::from([("alta1".to_string(), "enabled".to_string())]),
        );
        config
            .hijack
            .force_routing_clusters
            .insert("alta1-orig".to_string(), "forced".to_string());
        config.hijack.legacy_applications.insert("old".to_string());

        // Staged table beats the e-zone default.
        let hijack = RouteHijack::new(&config, Some("bar"), Some("alta1-stable"));
        assert_eq!(hijack.mode(), HijackMode::Enabled);

        // E-zone default applies to unstaged applications.
        let hijack = RouteHijack::new(&config, Some("baz"), Some("alta1-stable"));
        assert_eq!(hijack.mode(), HijackMode::Checking);

        // Forced-routing cluster forces standalone.
        let hijack = RouteHijack::new(&config, Some("bar"), Some("alta1-orig"));
        assert_eq!(hijack.mode(), HijackMode::Standalone);

        // Legacy exemption and missing cluster identity force disabled.
        let hijack = RouteHijack::new(&config, Some("old"), Some("alta1-stable"));
        assert_eq!(hijack.mode(), HijackMode::Disabled);
        let hijack = RouteHijack::new(&config, Some("bar"), None);
        assert_eq!(hijack.mode(), HijackMode::Disabled);
    }

    #[test]
    fn test_unparsable_staged_mode_degrades_to_disabled() {
        let mut config = config();
        config.hijack.staged.insert(
            "bar".to_string(),
            HashMap::from([("overall".to_string(), "bogus".to_string())]),
        );
        let hijack = RouteHijack::new(&config, Some("bar"), Some("plain"));
        assert_eq!(hijack.mode(), HijackMode::Disabled);
    }

    #[test]
    fn test_checking_mode_never_mutates() {
        let config = config();
        let hijack = RouteHijack::new(&config, Some("bar"), Some("alta1-stable"));
        assert_eq!(hijack.mode(), HijackMode::Checking);

        let watch_map = HashMap::from([(
            "foo".to_string(),
            vec!["stable".to_string(), "beta".to_string()],
        )]);
        let result = hijack.hijack_watch_map(watch_map.clone(), |_, _| {
            Some("elsewhere".to_string())
        });
        assert_eq!(result, watch_map);
    }

    #[test]
    fn test_enabled_mode_rewrites() {
        let mut config = config();
        config
            .hijack
            .ezone_default
            .insert("alta1".to_string(), "enabled".to_string());
        let hijack = RouteHijack::new(&config, Some("bar"), Some("alta1-stable"));

        let watch_map = HashMap::from([(
            "foo".to_string(),
            vec!["stable".to_string(), "beta".to_string()],
        )]);
        let result = hijack.hijack_watch_map(watch_map, |_, cluster| {
            (cluster == "stable").then(|| "stable-2".to_string())
        });
        assert_eq!(
            result.get("foo").unwrap(),
            &vec!["stable-2".to_string(), "beta".to_string()]
        );
    }

    #[test]
    fn test_rewrite_deduplicates_targets() {
        let mut config = config();
        config
            .hijack
            .ezone_default
            .insert("alta1".to_string(), "standalone".to_string());
        let hijack = RouteHijack::new(&config, Some("bar"), Some("alta1-stable"));

        let watch_map = HashMap::from([(
            "foo".to_string(),
            vec!["stable".to_string(), "beta".to_string()],
        )]);
        let result = hijack.hijack_watch_map(watch_map, |_, _| Some("phys".to_string()));
        assert_eq!(result.get("foo").unwrap(), &vec!["phys".to_string()]);
    }

    #[test]
    fn test_force_enable_override_and_exclusion() {
        let mut config = config();
        config
            .hijack
            .force_enabled_destinations
            .insert("foo".to_string());
        config.hijack.force_enable_exclusions.insert(
            "bar".to_string(),
            HashSet::from(["foo".to_string()]),
        );

        // Excluded source keeps the declared cluster.
        let hijack = RouteHijack::new(&config, Some("bar"), Some("plain"));
        assert_eq!(hijack.mode(), HijackMode::Disabled);
        assert!(!hijack.force_enabled_for("foo"));

        // Any other source is rewritten despite disabled mode.
        let hijack = RouteHijack::new(&config, Some("baz"), Some("plain"));
        assert_eq!(hijack.mode(), HijackMode::Disabled);
        assert!(hijack.force_enabled_for("foo"));
        assert_eq!(
            hijack.hijack_route("foo", "stable", |_, _| Some("stable-2".to_string())),
            "stable-2"
        );
    }
}
