//! Route-resolution layer
//!
//! Resolves nominal cluster names to physical ones through route tables,
//! default-route policy, symlinks, and staged hijack policies.

pub mod cluster_map;
pub mod hijack;
pub mod resolver;

pub use cluster_map::{ClusterMap, ClusterMapError};
pub use hijack::{HijackMode, ModeParseError, RouteHijack};
pub use resolver::{ClusterResolver, RouteDataSource};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Delimiter joining the targets of a multi-target symlink.
pub const LINK_DELIMITER: char = '+';

/// Split a resolved name into its physical targets.
pub fn split_targets(resolved: &str) -> impl Iterator<Item = &str> {
    resolved.split(LINK_DELIMITER).filter(|part| !part.is_empty())
}

/// Payload of a cluster-level document: the route table keyed by serialized
/// [`RouteKey`]s, and the optional symlink targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterDoc {
    #[serde(default)]
    pub route: HashMap<String, Option<String>>,
    #[serde(default)]
    pub link: Vec<String>,
}

impl ClusterDoc {
    /// The `+`-joined symlink target, if any targets are configured.
    pub fn link_name(&self) -> Option<String> {
        if self.link.is_empty() {
            None
        } else {
            Some(
                self.link
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(&LINK_DELIMITER.to_string()),
            )
        }
    }
}

/// `(application, intent)` key into a cluster's route table.
///
/// Serialized as the bare application name for the default intent, else
/// `application@intent`, letting one route table carry multiple intents per
/// source application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub application: String,
    pub intent: String,
}

impl RouteKey {
    pub fn new(application: impl Into<String>, intent: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            intent: intent.into(),
        }
    }

    pub fn serialize(&self, default_intent: &str) -> String {
        if self.intent == default_intent {
            self.application.clone()
        } else {
            format!("{}@{}", self.application, self.intent)
        }
    }

    pub fn parse(raw: &str, default_intent: &str) -> Self {
        match raw.split_once('@') {
            Some((application, intent)) => Self::new(application, intent),
            None => Self::new(raw, default_intent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_key_round_trip() {
        let key = RouteKey::new("bar", "direct");
        assert_eq!(key.serialize("direct"), "bar");
        assert_eq!(RouteKey::parse("bar", "direct"), key);

        let key = RouteKey::new("bar", "mirror");
        assert_eq!(key.serialize("direct"), "bar@mirror");
        assert_eq!(RouteKey::parse("bar@mirror", "direct"), key);
    }

    #[test]
    fn test_link_name() {
        let doc = ClusterDoc {
            link: vec!["stable-1".to_string(), "stable-2".to_string()],
            ..Default::default()
        };
        assert_eq!(doc.link_name().as_deref(), Some("stable-1+stable-2"));
        assert!(ClusterDoc::default().link_name().is_none());
    }

    #[test]
    fn test_split_targets() {
        let targets: Vec<_> = split_targets("stable-1+stable-2").collect();
        assert_eq!(targets, vec!["stable-1", "stable-2"]);
        let targets: Vec<_> = split_targets("stable").collect();
        assert_eq!(targets, vec!["stable"]);
    }

    #[test]
    fn test_cluster_doc_decoding() {
        let doc: ClusterDoc =
            serde_json::from_str(r#"{"route": {"bar": "stable-1", "baz@mirror": null}}"#).unwrap();
        assert_eq!(
            doc.route.get("bar"),
            Some(&Some("stable-1".to_string()))
        );
        assert_eq!(doc.route.get("baz@mirror"), Some(&None));
        assert!(doc.link.is_empty());
    }
}
