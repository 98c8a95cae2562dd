//! JSON file key-value backend.
//!
//! The whole store lives in one JSON object file (`{"key": "value", ...}`).
//! The file is loaded lazily on first access, rewritten atomically on flush
//! (temp file, fsync, rename) and optionally watched for edits made by other
//! processes.

use async_trait::async_trait;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::backend::{KeyChange, KeyValueBackend, KeyWatch, WriterId, CHANGE_CHANNEL_CAPACITY};
use tandem_common::{Error, Result};

/// In-memory view of the store file.
#[derive(Debug, Default)]
struct Cache {
    values: BTreeMap<String, String>,
    /// Keys mutated locally since the last flush.
    dirty: BTreeSet<String>,
}

struct Inner {
    path: PathBuf,
    writer: WriterId,
    cache: Mutex<Option<Cache>>,
    changes: broadcast::Sender<KeyChange>,
    watcher: std::sync::Mutex<Option<RecommendedWatcher>>,
}

/// File-backed key-value backend.
#[derive(Clone)]
pub struct FileBackend {
    inner: Arc<Inner>,
}

impl FileBackend {
    /// Open the store at `path` without watching it.
    ///
    /// # Postconditions
    /// - The parent directory exists
    /// - The file itself is not read until first access
    ///
    /// # Errors
    /// - Parent directory cannot be created
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                writer: WriterId::next(),
                cache: Mutex::new(None),
                changes,
                watcher: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Open the store at `path` and watch it for external edits.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_watched(path: impl AsRef<Path>) -> Result<Self> {
        let backend = Self::open(path)?;
        backend.start_watching()?;
        Ok(backend)
    }

    /// Path of the store file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Start forwarding filesystem events for the store file to watchers.
    ///
    /// Calling this more than once has no effect.
    pub fn start_watching(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Backend(format!("File watcher needs a tokio runtime: {}", e)))?;

        let mut slot = self
            .inner
            .watcher
            .lock()
            .map_err(|_| Error::Backend("watcher lock poisoned".to_string()))?;
        if slot.is_some() {
            return Ok(());
        }

        let (event_tx, mut event_rx) = mpsc::channel::<notify::Result<Event>>(32);
        let mut watcher = recommended_watcher(move |res| {
            let _ = event_tx.blocking_send(res);
        })
        .map_err(|e| Error::Backend(format!("Failed to create file watcher: {}", e)))?;

        // The file is replaced by rename on every write, so watch its directory.
        let dir = match self.inner.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Backend(format!("Failed to watch {:?}: {}", dir, e)))?;
        *slot = Some(watcher);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let file_name = self.inner.path.file_name().map(|n| n.to_os_string());
        runtime.spawn(async move {
            while let Some(res) = event_rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        error!("watch error: {:?}", e);
                        continue;
                    }
                };

                if matches!(event.kind, EventKind::Access(_)) {
                    continue;
                }
                let touches_store = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if !touches_store {
                    continue;
                }

                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = inner.reload_from_disk().await {
                    warn!("Ignoring unreadable store file: {}", e);
                }
            }
            debug!("File watcher task finished");
        });

        info!("Watching {:?} for external changes", self.inner.path);
        Ok(())
    }
}

impl Inner {
    async fn read_file(&self) -> Result<BTreeMap<String, String>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)?;
        Ok(raw
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(s) => (key, s),
                other => (key, other.to_string()),
            })
            .collect())
    }

    /// Run `f` against the cache, loading the file first if needed.
    async fn with_cache<T>(&self, f: impl FnOnce(&mut Cache) -> T) -> Result<T> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            let values = self.read_file().await?;
            debug!(keys = values.len(), "Loaded store file {:?}", self.path);
            *guard = Some(Cache {
                values,
                dirty: BTreeSet::new(),
            });
        }
        match guard.as_mut() {
            Some(cache) => Ok(f(cache)),
            None => Err(Error::Backend("store cache unavailable".to_string())),
        }
    }

    /// Merge the on-disk contents into the cache and announce changed keys.
    ///
    /// Keys with unflushed local mutations keep their local value.
    async fn reload_from_disk(&self) -> Result<()> {
        let changed: Vec<String> = {
            // Read under the cache lock so a concurrent flush cannot be undone
            // by a stale snapshot of the file.
            let mut guard = self.cache.lock().await;
            let Some(cache) = guard.as_mut() else {
                // Nothing cached yet: the next access reads the new file anyway.
                return Ok(());
            };
            let disk = self.read_file().await?;

            let keys: BTreeSet<String> = cache.values.keys().chain(disk.keys()).cloned().collect();
            let mut changed = Vec::new();
            for key in keys {
                if cache.dirty.contains(&key) {
                    continue;
                }
                match disk.get(&key) {
                    Some(value) if cache.values.get(&key) != Some(value) => {
                        cache.values.insert(key.clone(), value.clone());
                        changed.push(key);
                    }
                    None if cache.values.remove(&key).is_some() => changed.push(key),
                    _ => {}
                }
            }
            changed
        };

        for key in changed {
            debug!(key = %key, "External change detected");
            let _ = self.changes.send(KeyChange {
                key,
                writer: WriterId::EXTERNAL,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner
            .with_cache(|cache| cache.values.get(key).cloned())
            .await
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.inner
            .with_cache(|cache| {
                cache.values.insert(key.to_string(), value);
                cache.dirty.insert(key.to_string());
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner
            .with_cache(|cache| {
                cache.dirty.insert(key.to_string());
                cache.values.remove(key).is_some()
            })
            .await
    }

    async fn flush(&self) -> Result<()> {
        let mut guard = self.inner.cache.lock().await;
        let Some(cache) = guard.as_mut() else {
            // Never loaded, so nothing was mutated.
            return Ok(());
        };

        let content = serde_json::to_string_pretty(&cache.values)?;

        let mut tmp_name = self
            .inner
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = self.inner.path.with_file_name(tmp_name);

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.inner.path).await?;

        let changed = std::mem::take(&mut cache.dirty);
        debug!(keys = cache.values.len(), "Flushed store file {:?}", self.inner.path);

        for key in changed {
            let _ = self.inner.changes.send(KeyChange {
                key,
                writer: self.inner.writer,
            });
        }
        Ok(())
    }

    fn watch(&self, key: &str) -> KeyWatch {
        KeyWatch::new(key, self.inner.writer, self.inner.changes.subscribe())
    }
}
