//! In-memory subtree replication
//!
//! The tree layer mirrors `{type, application}` subtrees of the coordination
//! store into process memory and fans changes out to long-polling sessions:
//! holders own one mirror each, the hub registers holders and bounds their
//! concurrent startup, watchers turn holder events into per-session message
//! streams, and the cleaner evicts idle holders under resource pressure.

pub mod cleaner;
pub mod event;
pub mod holder;
pub mod hub;
pub mod watcher;

pub use cleaner::{PressureCondition, ResourceSample, ResourceUsage, SystemUsage, TreeHolderCleaner};
pub use event::{EventKind, TreeEvent};
pub use holder::TreeHolder;
pub use hub::{HolderKey, TreeHub};
pub use watcher::{MessageKind, TreeWatcher, WatchMessage};
