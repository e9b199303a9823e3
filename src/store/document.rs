//! Versioned document mapper
//!
//! One `VersionedDocument` instance covers one read-modify-write cycle of a
//! single store node. The version observed by `load` pins the instance to
//! that revision: `save` and `delete` are compare-and-set operations that
//! fail with [`RegistryError::OutOfSync`] when the node moved underneath.

use std::sync::Arc;

use tracing::warn;

use crate::error::RegistryError;
use crate::store::{CoordinationStore, StoreError};

pub struct VersionedDocument {
    store: Arc<dyn CoordinationStore>,
    path: String,
    data: Option<serde_json::Value>,
    version: Option<i64>,
}

impl VersionedDocument {
    /// Create an unloaded document for one node.
    pub fn new(store: Arc<dyn CoordinationStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            data: None,
            version: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }

    pub fn version(&self) -> Option<i64> {
        self.version
    }

    /// Fetch the node's payload and version.
    ///
    /// A missing node leaves the document unloaded so that a subsequent
    /// `save` attempts creation. A payload that fails to decode keeps the
    /// fetched version so the caller can still overwrite the node.
    pub async fn load(&mut self) -> Result<(), RegistryError> {
        match self.store.get(&self.path).await {
            Ok((raw, version)) => {
                self.version = Some(version);
                match serde_json::from_str(&raw) {
                    Ok(value) => {
                        self.data = Some(value);
                        Ok(())
                    }
                    Err(error) => {
                        warn!(path = %self.path, %error, "malformed document payload");
                        self.data = None;
                        Err(RegistryError::MalformedData {
                            path: self.path.clone(),
                        })
                    }
                }
            }
            Err(StoreError::NoNode { .. }) => {
                self.data = None;
                self.version = None;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Compare-and-set the node's payload.
    ///
    /// Without a version token this attempts creation; with one it attempts
    /// a versioned update. Either way a concurrent write surfaces as
    /// `OutOfSync` and the in-memory data is left untouched.
    pub async fn save(&mut self, data: serde_json::Value) -> Result<(), RegistryError> {
        let raw = serde_json::to_string(&data).map_err(|_| RegistryError::MalformedData {
            path: self.path.clone(),
        })?;
        let result = match self.version {
            None => self.store.create(&self.path, &raw).await,
            Some(version) => self.store.set(&self.path, &raw, version).await,
        };
        match result {
            Ok(version) => {
                self.version = Some(version);
                self.data = Some(data);
                Ok(())
            }
            Err(
                StoreError::NodeExists { .. }
                | StoreError::BadVersion { .. }
                | StoreError::NoNode { .. },
            ) => Err(RegistryError::OutOfSync {
                path: self.path.clone(),
            }),
            Err(error) => Err(error.into()),
        }
    }

    /// Compare-and-delete the node. Requires a loaded version token.
    pub async fn delete(&mut self) -> Result<(), RegistryError> {
        let version = self.version.ok_or_else(|| RegistryError::OutOfSync {
            path: self.path.clone(),
        })?;
        match self.store.delete(&self.path, version).await {
            Ok(()) => {
                self.data = None;
                self.version = None;
                Ok(())
            }
            Err(StoreError::BadVersion { .. } | StoreError::NoNode { .. }) => {
                Err(RegistryError::OutOfSync {
                    path: self.path.clone(),
                })
            }
            Err(error) => Err(error.into()),
        }
    }
}
