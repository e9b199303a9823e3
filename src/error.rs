//! Error types shared across the registry core.
//!
//! Data-quality failures (`MalformedData`) are contained to the consumers of
//! the offending document and degrade gracefully; concurrency conflicts
//! (`OutOfSync`) and resource unavailability (`TreeTimeout`) always reach
//! the caller.

use crate::store::{NodeType, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A stored payload could not be decoded.
    #[error("malformed data at {path}")]
    MalformedData { path: String },

    /// Optimistic-concurrency violation on save or delete. Never retried
    /// here; retry policy belongs to the caller.
    #[error("out of sync write on {path}")]
    OutOfSync { path: String },

    /// A tree holder failed to initialize within its timeout. The holder is
    /// released so a later call gets a clean retry.
    #[error("tree of {application}/{type_name} timed out during initialization")]
    TreeTimeout {
        application: String,
        type_name: NodeType,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
