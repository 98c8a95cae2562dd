//! Application context: the wired-up storage, configuration store and
//! shared-state replica of one window.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use tandem_common::{Error, Result};
use tandem_config::ConfigStore;
use tandem_storage::{create_default_registry, StorageAdapter};
use tandem_sync::{BroadcastHub, SharedStateSync};

use crate::config::AppConfig;

/// Everything a window needs, created once by [`AppContext::bootstrap`] and
/// passed to whoever needs it.
pub struct AppContext {
    config: AppConfig,
    adapter: StorageAdapter,
    store: Arc<ConfigStore>,
    shared: Arc<SharedStateSync>,
    joined_session: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl AppContext {
    /// Wire up storage, the configuration store and the shared-state
    /// replica.
    ///
    /// The store file is never touched here, so a window that fails to start
    /// on an undecodable file leaves it for the user to inspect.
    ///
    /// # Errors
    /// - `Error::NotFound` if no backend is registered under `config.backend`
    /// - The storage backend cannot be opened
    /// - The stored configuration cannot be read or decoded
    pub async fn bootstrap(config: AppConfig, hub: &BroadcastHub) -> Result<Self> {
        info!(
            backend = %config.backend,
            data_dir = %config.data_dir.display(),
            "Bootstrapping application context"
        );

        let registry = create_default_registry();
        if !registry.has_backend(&config.backend) {
            return Err(Error::NotFound(format!(
                "Unknown storage backend '{}' (available: {})",
                config.backend,
                registry.backends().join(", ")
            )));
        }
        let backend = registry.resolve(&config.backend, config.backend_config())?;
        let adapter = StorageAdapter::new(backend);

        let store = Arc::new(ConfigStore::new(adapter.clone(), config.store_key.clone()));
        store.load().await?;
        let rehydrate_task = store.spawn_rehydrate_on_change();

        let shared = Arc::new(SharedStateSync::new(Arc::new(
            hub.join(&config.channel_name),
        )));
        let listener_task = shared.spawn_listener();
        let joined_session = shared.join(config.snapshot_wait()).await?;

        info!(
            window = %shared.window_id(),
            joined_session,
            "Application context ready"
        );

        Ok(Self {
            config,
            adapter,
            store,
            shared,
            joined_session,
            tasks: vec![rehydrate_task, listener_task],
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn adapter(&self) -> &StorageAdapter {
        &self.adapter
    }

    /// The persisted configuration store.
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// This window's shared-state replica.
    pub fn shared(&self) -> &Arc<SharedStateSync> {
        &self.shared
    }

    /// Whether a sibling window handed us its state during bootstrap.
    pub fn joined_session(&self) -> bool {
        self.joined_session
    }

    /// Stop background tasks.
    pub fn shutdown(mut self) {
        info!(window = %self.shared.window_id(), "Shutting down application context");
        self.abort_tasks();
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("window", &self.shared.window_id())
            .field("store", &self.store)
            .field("joined_session", &self.joined_session)
            .finish()
    }
}
