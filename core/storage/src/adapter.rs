//! Storage adapter: write-through access to a durable backend.

use std::sync::Arc;
use tracing::debug;

use crate::backend::{KeyValueBackend, KeyWatch};
use tandem_common::Result;

/// Thin translation layer over a [`KeyValueBackend`].
///
/// Every mutation is followed by a flush of the whole backend before the
/// call returns, so nothing acknowledged here is lost if the process exits
/// right afterwards.
#[derive(Clone)]
pub struct StorageAdapter {
    backend: Arc<dyn KeyValueBackend>,
}

impl StorageAdapter {
    /// Create an adapter over `backend`.
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    /// Read the value stored under `key`.
    ///
    /// # Postconditions
    /// - A missing key yields `Ok(None)`
    pub async fn read(&self, key: &str) -> Result<Option<String>> {
        debug!(key, backend = self.backend.name(), "read");
        self.backend.get(key).await
    }

    /// Store `value` under `key` and flush.
    ///
    /// # Errors
    /// - Backend write or flush failure
    pub async fn write(&self, key: &str, value: String) -> Result<()> {
        debug!(key, bytes = value.len(), backend = self.backend.name(), "write");
        self.backend.set(key, value).await?;
        self.backend.flush().await
    }

    /// Remove `key` and flush.
    ///
    /// Removing a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        debug!(key, backend = self.backend.name(), "delete");
        self.backend.delete(key).await?;
        self.backend.flush().await
    }

    /// Subscribe to changes of `key`.
    pub fn watch(&self, key: &str) -> KeyWatch {
        self.backend.watch(key)
    }
}

impl std::fmt::Debug for StorageAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdapter")
            .field("backend", &self.backend.name())
            .finish()
    }
}
