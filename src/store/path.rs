//! Structured coordination-store paths
//!
//! Every node the registry touches lives under
//! `/{root}/{type}/{application}/{cluster}/{key}`. `StructuredPath` is the
//! parsed form of such a path; any suffix may be absent.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Data types stored in the registry tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Service,
    Switch,
    Config,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Service => "service",
            NodeType::Switch => "switch",
            NodeType::Config => "config",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(NodeType::Service),
            "switch" => Ok(NodeType::Switch),
            "config" => Ok(NodeType::Config),
            other => Err(PathError::UnknownType {
                value: other.to_string(),
            }),
        }
    }
}

/// Errors raised while parsing or building structured paths.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("unknown node type: {value}")]
    UnknownType { value: String },

    #[error("illegal path component '{value}': {reason}")]
    IllegalComponent { value: String, reason: String },

    #[error("path '{path}' is not under root '{root}'")]
    WrongRoot { path: String, root: String },

    #[error("path '{path}' has too many components")]
    TooDeep { path: String },
}

/// Validate one path component against the path-illegal-character rule.
fn check_component(value: &str) -> Result<(), PathError> {
    let illegal = |reason: &str| PathError::IllegalComponent {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    if value.is_empty() {
        return Err(illegal("empty"));
    }
    if value.trim() != value {
        return Err(illegal("leading or trailing whitespace"));
    }
    if value.contains('/') {
        return Err(illegal("contains '/'"));
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(illegal("contains control character"));
    }
    Ok(())
}

/// A parsed `(type, application, cluster, key)` tuple.
///
/// Components are validated at construction, so a `StructuredPath` can always
/// be embedded in a store path without further checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructuredPath {
    type_name: Option<NodeType>,
    application: Option<String>,
    cluster: Option<String>,
    data: Option<String>,
}

impl StructuredPath {
    pub fn root() -> Self {
        Self {
            type_name: None,
            application: None,
            cluster: None,
            data: None,
        }
    }

    pub fn type_root(type_name: NodeType) -> Self {
        Self {
            type_name: Some(type_name),
            application: None,
            cluster: None,
            data: None,
        }
    }

    pub fn application(type_name: NodeType, application: &str) -> Result<Self, PathError> {
        check_component(application)?;
        Ok(Self {
            type_name: Some(type_name),
            application: Some(application.to_string()),
            cluster: None,
            data: None,
        })
    }

    pub fn cluster(
        type_name: NodeType,
        application: &str,
        cluster: &str,
    ) -> Result<Self, PathError> {
        let mut path = Self::application(type_name, application)?;
        check_component(cluster)?;
        path.cluster = Some(cluster.to_string());
        Ok(path)
    }

    pub fn data(
        type_name: NodeType,
        application: &str,
        cluster: &str,
        data: &str,
    ) -> Result<Self, PathError> {
        let mut path = Self::cluster(type_name, application, cluster)?;
        check_component(data)?;
        path.data = Some(data.to_string());
        Ok(path)
    }

    /// Parse an absolute store path under the given root component.
    pub fn parse(root: &str, path: &str) -> Result<Self, PathError> {
        let mut parts = path.trim_start_matches('/').split('/');
        match parts.next() {
            Some(first) if first == root => {}
            _ => {
                return Err(PathError::WrongRoot {
                    path: path.to_string(),
                    root: root.to_string(),
                })
            }
        }
        let mut parsed = Self::root();
        if let Some(type_name) = parts.next() {
            parsed.type_name = Some(type_name.parse()?);
        }
        for (slot, part) in [0usize, 1, 2].into_iter().zip(parts.by_ref()) {
            check_component(part)?;
            match slot {
                0 => parsed.application = Some(part.to_string()),
                1 => parsed.cluster = Some(part.to_string()),
                _ => parsed.data = Some(part.to_string()),
            }
        }
        if parts.next().is_some() {
            return Err(PathError::TooDeep {
                path: path.to_string(),
            });
        }
        Ok(parsed)
    }

    /// Render the absolute store path under the given root component.
    pub fn render(&self, root: &str) -> String {
        let mut out = format!("/{}", root);
        if let Some(type_name) = self.type_name {
            out.push('/');
            out.push_str(type_name.as_str());
        }
        for part in [&self.application, &self.cluster, &self.data]
            .into_iter()
            .flatten()
        {
            out.push('/');
            out.push_str(part);
        }
        out
    }

    /// Count of non-nil leading components (0..=4).
    pub fn level(&self) -> usize {
        let mut level = 0;
        if self.type_name.is_some() {
            level += 1;
            if self.application.is_some() {
                level += 1;
                if self.cluster.is_some() {
                    level += 1;
                    if self.data.is_some() {
                        level += 1;
                    }
                }
            }
        }
        level
    }

    pub fn type_name(&self) -> Option<NodeType> {
        self.type_name
    }

    pub fn application_name(&self) -> Option<&str> {
        self.application.as_deref()
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    pub fn data_name(&self) -> Option<&str> {
        self.data.as_deref()
    }
}
