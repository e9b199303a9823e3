//! Typed tree-change notifications
//!
//! Raw node events from the coordination store are republished by each tree
//! holder as `TreeEvent`s after its mirror is updated, so every attached
//! watcher interprets them against post-event state.

use crate::store::StructuredPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct TreeEvent {
    pub kind: EventKind,
    pub path: StructuredPath,
    /// Payload for created/updated nodes.
    pub data: Option<String>,
}
