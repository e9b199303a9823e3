//! Coordination-store interface
//!
//! The registry core mirrors subtrees of an external hierarchical
//! coordination store. This module defines the interface the core needs from
//! that store plus the in-memory implementation used by tests and local
//! development. Every node carries an opaque version used for
//! compare-and-set writes.

pub mod document;
pub mod memory;
pub mod path;

pub use document::VersionedDocument;
pub use memory::MemoryStore;
pub use path::{NodeType, PathError, StructuredPath};

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Errors surfaced by a coordination-store backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("node does not exist: {path}")]
    NoNode { path: String },

    #[error("node already exists: {path}")]
    NodeExists { path: String },

    #[error("version mismatch on {path}")]
    BadVersion { path: String },

    #[error("connection to the coordination store was lost")]
    ConnectionLoss,
}

/// A raw node-level event delivered by a subtree watch.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Created { path: String, data: String },
    Updated { path: String, data: String },
    Deleted { path: String },
    /// Connectivity transitions of the underlying session.
    Suspended,
    Reconnected,
    Lost,
}

impl NodeEvent {
    pub fn path(&self) -> Option<&str> {
        match self {
            NodeEvent::Created { path, .. }
            | NodeEvent::Updated { path, .. }
            | NodeEvent::Deleted { path } => Some(path),
            _ => None,
        }
    }
}

/// Initial dump plus live event stream for one subtree.
pub struct SubtreeWatch {
    /// Every node currently under the watched prefix, as `(path, data)`.
    pub initial: Vec<(String, String)>,
    /// Events after the snapshot, in store delivery order.
    pub events: broadcast::Receiver<NodeEvent>,
}

/// Async interface to the hierarchical coordination store.
///
/// Writes are versioned: `set` and `delete` succeed only when the caller's
/// version matches the node's current version.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Read one node, returning its payload and version.
    async fn get(&self, path: &str) -> Result<(String, i64), StoreError>;

    /// List child node names of one node.
    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Create a node, failing if it already exists. Missing parents are
    /// created with empty payloads. Returns the initial version.
    async fn create(&self, path: &str, data: &str) -> Result<i64, StoreError>;

    /// Compare-and-set a node's payload. Returns the new version.
    async fn set(&self, path: &str, data: &str, version: i64) -> Result<i64, StoreError>;

    /// Compare-and-delete a node.
    async fn delete(&self, path: &str, version: i64) -> Result<(), StoreError>;

    /// Snapshot a subtree and subscribe to its subsequent events.
    ///
    /// The snapshot and the subscription are atomic with respect to writes:
    /// no event is lost between the two, and all subscribers of one subtree
    /// observe events in the same order.
    async fn watch_subtree(&self, prefix: &str) -> Result<SubtreeWatch, StoreError>;
}
