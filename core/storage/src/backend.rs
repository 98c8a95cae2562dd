//! Durable key-value backend trait definition.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::warn;

use tandem_common::Result;

/// Identifies the backend handle that performed a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriterId(u64);

impl WriterId {
    /// Writer used for changes observed on disk that no handle in this
    /// process made.
    pub const EXTERNAL: WriterId = WriterId(0);

    /// Allocate a fresh writer id, unique within the process.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        WriterId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Notification that a key's durable value changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    /// Key whose value changed.
    pub key: String,
    /// Handle that made the change.
    pub writer: WriterId,
}

/// Where a change observed by a [`KeyWatch`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Written by the same backend handle that created the watch.
    Local,
    /// Written by another handle, another process, or an editor.
    External,
}

/// Capacity of the change notification channel each backend owns.
pub const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Subscription to changes of a single key.
pub struct KeyWatch {
    key: String,
    own: WriterId,
    rx: broadcast::Receiver<KeyChange>,
}

impl KeyWatch {
    /// Create a watch filtering `rx` down to `key`.
    pub fn new(key: impl Into<String>, own: WriterId, rx: broadcast::Receiver<KeyChange>) -> Self {
        Self {
            key: key.into(),
            own,
            rx,
        }
    }

    /// The watched key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the next change to the watched key.
    ///
    /// Returns `None` once the backend has been dropped. Missed notifications
    /// (a lagging receiver) are reported as a single external change, since
    /// the backend only says "this key changed" and never carries a diff.
    pub async fn changed(&mut self) -> Option<ChangeOrigin> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.key == self.key => {
                    return Some(if change.writer == self.own {
                        ChangeOrigin::Local
                    } else {
                        ChangeOrigin::External
                    });
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "Change watch lagged");
                    return Some(ChangeOrigin::External);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for KeyWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyWatch").field("key", &self.key).finish()
    }
}

/// Async, crash-safe key-value backend for string-keyed string values.
///
/// Mutations become durable only after [`KeyValueBackend::flush`].
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Get the backend name (e.g., "file", "memory").
    fn name(&self) -> &str;

    /// Read a value.
    ///
    /// # Postconditions
    /// - Returns `Ok(None)` for a missing key, never an error
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, replacing any previous one.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove a key.
    ///
    /// # Returns
    /// Whether the key was present.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Make every mutation so far durable.
    ///
    /// # Errors
    /// - I/O failure while writing the backing store
    async fn flush(&self) -> Result<()>;

    /// Subscribe to changes of `key`.
    fn watch(&self, key: &str) -> KeyWatch;
}
