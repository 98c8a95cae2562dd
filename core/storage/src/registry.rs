//! Backend registry for resolving a backend from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::KeyValueBackend;
use tandem_common::{Error, Result};

/// Factory function type for creating backends.
pub type BackendFactory = Box<dyn Fn(Value) -> Result<Arc<dyn KeyValueBackend>> + Send + Sync>;

/// Registry for key-value backend factories.
///
/// Allows dynamic registration and resolution of backends by name and
/// configuration.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a backend by name and configuration.
    ///
    /// # Errors
    /// - Backend not found
    /// - Configuration invalid
    /// - Backend construction failed
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn KeyValueBackend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Backend '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered backend names.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in backends.
///
/// - `memory`: no configuration
/// - `file`: `{"path": "...", "watch": true}`; `watch` defaults to true and
///   requires a tokio runtime
pub fn create_default_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();

    registry.factories.insert(
        "memory".to_string(),
        Box::new(|_config| {
            let backend: Arc<dyn KeyValueBackend> = Arc::new(crate::memory::MemoryBackend::new());
            Ok(backend)
        }),
    );

    registry.factories.insert(
        "file".to_string(),
        Box::new(|config| {
            let path = config
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::InvalidInput("File backend requires 'path'".to_string()))?;
            let watch = config.get("watch").and_then(|v| v.as_bool()).unwrap_or(true);

            let backend: Arc<dyn KeyValueBackend> = if watch {
                Arc::new(crate::file::FileBackend::open_watched(path)?)
            } else {
                Arc::new(crate::file::FileBackend::open(path)?)
            };
            Ok(backend)
        }),
    );

    registry
}
