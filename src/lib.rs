//! Arbor: multi-tenant service-registry core
//!
//! Mirrors application subtrees of a coordination store into process memory,
//! resolves nominal cluster names to physical ones through route tables,
//! default-route tiers, symlinks, and force-route overrides, and serves
//! long-polling subscribers a coalesced per-session change stream.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod route;
pub mod store;
pub mod tree;

pub use error::{RegistryError, RegistryResult};
