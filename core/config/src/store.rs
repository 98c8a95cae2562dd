//! Persisted configuration store.
//!
//! The in-memory [`PersistedConfiguration`] is the working copy; every
//! mutation writes the whole configuration through the [`StorageAdapter`].
//! When the stored record changes underneath us (another window, another
//! process, a hand edit), the store rehydrates from it. A record that cannot
//! be decoded is rejected and the current state is kept.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use tandem_common::{ActionKind, Listeners, ResourceId, Result, Subscription};
use tandem_storage::{ChangeOrigin, StorageAdapter};

use crate::entry::ConfigEntry;
use crate::persisted::PersistedConfiguration;

/// Key the configuration record is stored under by default.
pub const DEFAULT_STORE_KEY: &str = "store";

/// Durable per-resource configuration with write-through persistence.
pub struct ConfigStore {
    adapter: StorageAdapter,
    key: String,
    state: RwLock<PersistedConfiguration>,
    listeners: Listeners<PersistedConfiguration>,
    /// Serializes persist and rehydrate so a record is never decoded halfway
    /// through our own write sequence.
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Create a store over `adapter` with empty state.
    ///
    /// Nothing is read until [`ConfigStore::load`] is called.
    pub fn new(adapter: StorageAdapter, key: impl Into<String>) -> Self {
        Self {
            adapter,
            key: key.into(),
            state: RwLock::new(PersistedConfiguration::default()),
            listeners: Listeners::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a store and load the stored record.
    ///
    /// # Errors
    /// - Backend read failure
    /// - Stored record is malformed
    pub async fn open(adapter: StorageAdapter, key: impl Into<String>) -> Result<Self> {
        let store = Self::new(adapter, key);
        store.load().await?;
        Ok(store)
    }

    /// Storage key of the record.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn read_state(&self) -> RwLockReadGuard<'_, PersistedConfiguration> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PersistedConfiguration> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Initial load of the stored record.
    ///
    /// # Returns
    /// `true` if a record existed.
    pub async fn load(&self) -> Result<bool> {
        let loaded = self.rehydrate().await?;
        if loaded {
            info!(key = %self.key, entries = self.read_state().entries.len(), "Configuration loaded");
        } else {
            info!(key = %self.key, "No stored configuration, starting empty");
        }
        Ok(loaded)
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> PersistedConfiguration {
        self.read_state().clone()
    }

    /// Entry for `id`, if any.
    pub fn entry(&self, id: &ResourceId) -> Option<ConfigEntry> {
        self.read_state().entries.get(id).cloned()
    }

    /// Currently disabled action kinds.
    pub fn disabled_actions(&self) -> BTreeSet<ActionKind> {
        self.read_state().disabled_action_kinds.clone()
    }

    pub fn is_action_disabled(&self, kind: ActionKind) -> bool {
        self.read_state().is_disabled(kind)
    }

    /// Register a listener called with the new configuration after every
    /// mutation and every rehydration that changed it.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PersistedConfiguration) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Replace the entry for `id` wholesale.
    ///
    /// # Errors
    /// - Persist failure; the in-memory change is kept
    pub async fn set_config(&self, id: ResourceId, entry: ConfigEntry) -> Result<()> {
        debug!(resource = %id, "set_config");
        self.mutate(move |config| {
            config.entries.insert(id, entry);
        })
        .await
    }

    /// Shallow-merge `partial` into the entry for `id`, creating it if absent.
    ///
    /// # Errors
    /// - Persist failure; the in-memory change is kept
    pub async fn merge_config(&self, id: ResourceId, partial: ConfigEntry) -> Result<()> {
        debug!(resource = %id, keys = partial.len(), "merge_config");
        self.mutate(move |config| {
            config.entries.entry(id).or_default().merge(partial);
        })
        .await
    }

    /// Remove the entry for `id`.
    ///
    /// # Returns
    /// `true` if an entry was removed. Removing a missing entry does not
    /// write.
    pub async fn remove_config(&self, id: &ResourceId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let mut state = self.write_state();
            if state.entries.remove(id).is_none() {
                return Ok(false);
            }
            state.clone()
        };
        debug!(resource = %id, "remove_config");
        self.listeners.notify(&snapshot);
        self.persist(&snapshot).await?;
        Ok(true)
    }

    /// Replace the set of disabled action kinds.
    pub async fn set_disabled_actions(&self, kinds: BTreeSet<ActionKind>) -> Result<()> {
        debug!(count = kinds.len(), "set_disabled_actions");
        self.mutate(move |config| config.disabled_action_kinds = kinds)
            .await
    }

    /// Forget everything: delete the stored record and reset to empty.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let mut state = self.write_state();
            *state = PersistedConfiguration::default();
            state.clone()
        };
        info!(key = %self.key, "Clearing stored configuration");
        self.listeners.notify(&snapshot);
        self.adapter.delete(&self.key).await
    }

    /// Reload the state from the stored record.
    ///
    /// An absent record leaves the state as it is. A record that cannot be
    /// decoded is rejected and the state is left untouched.
    ///
    /// # Returns
    /// `true` if a record was read and adopted.
    ///
    /// # Errors
    /// - Backend read failure
    /// - Stored record is malformed
    pub async fn rehydrate(&self) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let Some(raw) = self.adapter.read(&self.key).await? else {
            debug!(key = %self.key, "No stored record to rehydrate from");
            return Ok(false);
        };
        let loaded = PersistedConfiguration::from_record_json(&raw)?;

        let changed = {
            let mut state = self.write_state();
            if *state == loaded {
                false
            } else {
                *state = loaded.clone();
                true
            }
        };

        if changed {
            debug!(key = %self.key, entries = loaded.entries.len(), "Rehydrated configuration");
            self.listeners.notify(&loaded);
        }
        Ok(true)
    }

    /// Rehydrate whenever the stored record changes.
    ///
    /// Our own writes trigger a re-read too; it finds the state unchanged and
    /// notifies nobody. Failures are logged and the previous state is kept. The task ends when
    /// the store or the backend is dropped.
    pub fn spawn_rehydrate_on_change(self: &Arc<Self>) -> JoinHandle<()> {
        let mut watch = self.adapter.watch(&self.key);
        let store = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(origin) = watch.changed().await {
                let Some(store) = store.upgrade() else {
                    break;
                };
                if origin == ChangeOrigin::External {
                    info!(key = %store.key, "Stored configuration changed externally");
                }
                if let Err(e) = store.rehydrate().await {
                    error!(key = %store.key, "Rejected stored configuration: {}", e);
                }
            }
            debug!("Configuration watch ended");
        })
    }

    async fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut PersistedConfiguration),
    {
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let mut state = self.write_state();
            f(&mut state);
            state.clone()
        };
        self.listeners.notify(&snapshot);
        self.persist(&snapshot).await
    }

    async fn persist(&self, config: &PersistedConfiguration) -> Result<()> {
        let json = config.to_record_json()?;
        self.adapter.write(&self.key, json).await.map_err(|e| {
            error!(key = %self.key, "Failed to persist configuration: {}", e);
            e
        })
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("key", &self.key)
            .field("adapter", &self.adapter)
            .field("entries", &self.read_state().entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tandem_common::Error;
    use tandem_storage::{FileBackend, KeyValueBackend, MemoryBackend};
    use tempfile::TempDir;

    fn rid(s: &str) -> ResourceId {
        ResourceId::new(s).unwrap()
    }

    fn memory_store() -> (Arc<MemoryBackend>, ConfigStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = ConfigStore::new(StorageAdapter::new(backend.clone()), DEFAULT_STORE_KEY);
        (backend, store)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_set_config_persists_with_one_flush() {
        let (backend, store) = memory_store();

        store
            .set_config(rid("gdrive"), ConfigEntry::new().with("hideTray", true))
            .await
            .unwrap();

        assert_eq!(backend.flush_count(), 1);
        let stored = backend.durable_value(DEFAULT_STORE_KEY).unwrap();
        let reloaded = PersistedConfiguration::from_record_json(&stored).unwrap();
        assert_eq!(reloaded, store.snapshot());
    }

    #[tokio::test]
    async fn test_set_config_is_idempotent() {
        let (_backend, store) = memory_store();
        let entry = ConfigEntry::new().with("defaultMountPoint", "/mnt/g");

        store.set_config(rid("gdrive"), entry.clone()).await.unwrap();
        let once = store.snapshot();
        store.set_config(rid("gdrive"), entry).await.unwrap();

        assert_eq!(store.snapshot(), once);
    }

    #[tokio::test]
    async fn test_set_config_replaces_wholesale() {
        let (_backend, store) = memory_store();
        store
            .set_config(rid("r"), ConfigEntry::new().with("a", 1).with("b", 2))
            .await
            .unwrap();
        store
            .set_config(rid("r"), ConfigEntry::new().with("c", 3))
            .await
            .unwrap();

        assert_eq!(store.entry(&rid("r")).unwrap().into_value(), json!({"c": 3}));
    }

    #[tokio::test]
    async fn test_merge_keeps_other_keys_and_entries() {
        let (_backend, store) = memory_store();
        store
            .set_config(rid("r"), ConfigEntry::new().with("k", "v1").with("j", "v3"))
            .await
            .unwrap();
        store
            .set_config(rid("other"), ConfigEntry::new().with("x", 1))
            .await
            .unwrap();

        store
            .merge_config(rid("r"), ConfigEntry::new().with("k", "v2"))
            .await
            .unwrap();

        assert_eq!(
            store.entry(&rid("r")).unwrap().into_value(),
            json!({"k": "v2", "j": "v3"})
        );
        assert_eq!(store.entry(&rid("other")).unwrap().into_value(), json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_merge_into_absent_entry_creates_it() {
        let (_backend, store) = memory_store();
        store
            .merge_config(rid("new"), ConfigEntry::new().with("mountOnStart", true))
            .await
            .unwrap();

        assert_eq!(
            store.entry(&rid("new")).unwrap().into_value(),
            json!({"mountOnStart": true})
        );
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let (backend, store) = memory_store();
        store.set_config(rid("a"), ConfigEntry::new()).await.unwrap();

        assert!(store.remove_config(&rid("a")).await.unwrap());
        assert!(!store.remove_config(&rid("a")).await.unwrap());
        assert_eq!(backend.flush_count(), 2);

        store
            .set_disabled_actions([ActionKind::Serve].into_iter().collect())
            .await
            .unwrap();
        assert!(store.is_action_disabled(ActionKind::Serve));

        store.clear().await.unwrap();
        assert_eq!(store.snapshot(), PersistedConfiguration::default());
        assert_eq!(backend.durable_value(DEFAULT_STORE_KEY), None);
    }

    #[tokio::test]
    async fn test_rehydrate_adopts_external_record() {
        let (backend, store) = memory_store();
        store
            .set_config(rid("stale"), ConfigEntry::new().with("a", 1))
            .await
            .unwrap();

        let other = backend.connect();
        let external = r#"{"state":{"entries":{"fresh":{"hideTray":false}},"disabledActionKinds":["mount"]},"version":0}"#;
        other.set(DEFAULT_STORE_KEY, external.to_string()).await.unwrap();
        other.flush().await.unwrap();

        assert!(store.rehydrate().await.unwrap());
        let snapshot = store.snapshot();
        assert_eq!(snapshot, PersistedConfiguration::from_record_json(external).unwrap());
        assert!(snapshot.entry(&rid("stale")).is_none());
    }

    #[tokio::test]
    async fn test_rehydrate_rejects_malformed_record() {
        let (backend, store) = memory_store();
        store
            .set_config(rid("keep"), ConfigEntry::new().with("a", 1))
            .await
            .unwrap();
        let before = store.snapshot();

        let other = backend.connect();
        other
            .set(DEFAULT_STORE_KEY, "{\"state\": 42".to_string())
            .await
            .unwrap();
        other.flush().await.unwrap();

        let err = store.rehydrate().await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_rehydrate_without_record_keeps_state() {
        let (_backend, store) = memory_store();
        assert!(!store.load().await.unwrap());
        assert_eq!(store.snapshot(), PersistedConfiguration::default());
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory_state() {
        let (backend, store) = memory_store();
        backend.set_failing(true);

        let err = store
            .set_config(rid("r"), ConfigEntry::new().with("a", 1))
            .await
            .unwrap_err();
        assert!(err.is_backend());
        assert!(store.entry(&rid("r")).is_some());
        assert_eq!(backend.durable_value(DEFAULT_STORE_KEY), None);
    }

    #[tokio::test]
    async fn test_listeners_notified_on_mutation() {
        let (_backend, store) = memory_store();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = store.subscribe(move |config| {
            assert!(config.entries.contains_key(&ResourceId::new("r").unwrap()));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set_config(rid("r"), ConfigEntry::new()).await.unwrap();
        store
            .merge_config(rid("r"), ConfigEntry::new().with("a", 1))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        sub.unsubscribe();
        store.set_config(rid("r"), ConfigEntry::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disjoint_merges_commute_across_stores() {
        let partials = vec![
            (rid("r"), ConfigEntry::new().with("a", 1)),
            (rid("r"), ConfigEntry::new().with("b", 2)),
            (rid("s"), ConfigEntry::new().with("c", 3)),
        ];

        let (_b1, forward) = memory_store();
        for (id, p) in partials.iter().cloned() {
            forward.merge_config(id, p).await.unwrap();
        }
        let (_b2, reverse) = memory_store();
        for (id, p) in partials.into_iter().rev() {
            reverse.merge_config(id, p).await.unwrap();
        }

        assert_eq!(forward.snapshot(), reverse.snapshot());
    }

    #[tokio::test]
    async fn test_change_watch_rehydrates_from_sibling_store() {
        let backend = Arc::new(MemoryBackend::new());
        let a = Arc::new(ConfigStore::new(
            StorageAdapter::new(backend.clone()),
            DEFAULT_STORE_KEY,
        ));
        let b = Arc::new(ConfigStore::new(
            StorageAdapter::new(Arc::new(backend.connect())),
            DEFAULT_STORE_KEY,
        ));
        let _task = b.spawn_rehydrate_on_change();

        a.set_config(rid("gdrive"), ConfigEntry::new().with("hideTray", true))
            .await
            .unwrap();

        wait_until(|| b.entry(&rid("gdrive")).is_some()).await;
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[tokio::test]
    async fn test_own_write_notifies_once_with_watch_running() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(ConfigStore::new(
            StorageAdapter::new(backend.clone()),
            DEFAULT_STORE_KEY,
        ));
        let _task = store.spawn_rehydrate_on_change();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _sub = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store
            .set_config(rid("gdrive"), ConfigEntry::new().with("hideTray", true))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A later external write is seen only after the watch has handled
        // our own change notification.
        let sibling = ConfigStore::new(
            StorageAdapter::new(Arc::new(backend.connect())),
            DEFAULT_STORE_KEY,
        );
        sibling.load().await.unwrap();
        sibling.set_config(rid("dropbox"), ConfigEntry::new()).await.unwrap();

        wait_until(|| store.entry(&rid("dropbox")).is_some()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_change_watch_keeps_state_on_bad_record() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(ConfigStore::new(
            StorageAdapter::new(backend.clone()),
            DEFAULT_STORE_KEY,
        ));
        store
            .set_config(rid("keep"), ConfigEntry::new())
            .await
            .unwrap();
        let task = store.spawn_rehydrate_on_change();

        let other = backend.connect();
        other
            .set(DEFAULT_STORE_KEY, "garbage".to_string())
            .await
            .unwrap();
        other.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.entry(&rid("keep")).is_some());
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_survives_reopen_on_file_backend() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");

        {
            let backend = Arc::new(FileBackend::open(&path).unwrap());
            let store = ConfigStore::open(StorageAdapter::new(backend), DEFAULT_STORE_KEY)
                .await
                .unwrap();
            store
                .merge_config(rid("gdrive"), ConfigEntry::new().with("mountOnStart", true))
                .await
                .unwrap();
        }

        let backend = Arc::new(FileBackend::open(&path).unwrap());
        let store = ConfigStore::open(StorageAdapter::new(backend), DEFAULT_STORE_KEY)
            .await
            .unwrap();
        assert_eq!(
            store.entry(&rid("gdrive")).unwrap().into_value(),
            json!({"mountOnStart": true})
        );
    }
}
