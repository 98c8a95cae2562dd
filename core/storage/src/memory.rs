//! In-memory key-value backend for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use crate::backend::{KeyChange, KeyValueBackend, KeyWatch, WriterId, CHANGE_CHANNEL_CAPACITY};
use tandem_common::{Error, Result};

/// State shared by every handle connected to the same memory store.
struct DurableCell {
    values: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<KeyChange>,
}

/// In-memory key-value backend.
///
/// Each handle buffers mutations until [`KeyValueBackend::flush`], then
/// commits them to a durable cell shared with every handle created through
/// [`MemoryBackend::connect`]. Connected handles therefore behave like
/// separate processes over one store file.
pub struct MemoryBackend {
    writer: WriterId,
    durable: Arc<DurableCell>,
    /// Unflushed mutations; `None` marks a deletion.
    pending: RwLock<HashMap<String, Option<String>>>,
    flushes: AtomicU64,
    failing: AtomicBool,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self::with_cell(Arc::new(DurableCell {
            values: RwLock::new(HashMap::new()),
            changes,
        }))
    }

    fn with_cell(durable: Arc<DurableCell>) -> Self {
        Self {
            writer: WriterId::next(),
            durable,
            pending: RwLock::new(HashMap::new()),
            flushes: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Open another handle over the same durable cell.
    pub fn connect(&self) -> Self {
        Self::with_cell(self.durable.clone())
    }

    /// Number of completed flushes on this handle.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Durable value of `key`, ignoring unflushed mutations of every handle.
    pub fn durable_value(&self, key: &str) -> Option<String> {
        self.durable
            .values
            .read()
            .ok()
            .and_then(|values| values.get(key).cloned())
    }

    /// Make every subsequent operation on this handle fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Backend("memory backend unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Backend("memory backend lock poisoned".to_string())
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;

        if let Some(pending) = self.pending.read().map_err(poisoned)?.get(key) {
            return Ok(pending.clone());
        }
        Ok(self.durable.values.read().map_err(poisoned)?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.check_available()?;
        self.pending
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.get(key).await?.is_some();
        self.pending
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), None);
        Ok(existed)
    }

    async fn flush(&self) -> Result<()> {
        self.check_available()?;

        let pending: Vec<(String, Option<String>)> =
            self.pending.write().map_err(poisoned)?.drain().collect();

        let mut changed = Vec::new();
        {
            let mut values = self.durable.values.write().map_err(poisoned)?;
            for (key, value) in pending {
                let changed_now = match value {
                    Some(value) => {
                        let previous = values.insert(key.clone(), value.clone());
                        previous.as_deref() != Some(value.as_str())
                    }
                    None => values.remove(&key).is_some(),
                };
                if changed_now {
                    changed.push(key);
                }
            }
        }

        self.flushes.fetch_add(1, Ordering::SeqCst);
        debug!(changed = changed.len(), "Memory backend flushed");

        for key in changed {
            // No receivers is fine: nobody is watching yet.
            let _ = self.durable.changes.send(KeyChange {
                key,
                writer: self.writer,
            });
        }
        Ok(())
    }

    fn watch(&self, key: &str) -> KeyWatch {
        KeyWatch::new(key, self.writer, self.durable.changes.subscribe())
    }
}
