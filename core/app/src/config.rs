//! Application configuration.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use tandem_common::{Error, Result};

/// Environment variable overriding [`AppConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "TANDEM_DATA_DIR";

/// Where and how the application keeps its state.
///
/// Every field has a default, so a config file only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the store file.
    pub data_dir: PathBuf,
    /// Storage backend name, resolved through the backend registry.
    pub backend: String,
    /// File name of the store inside `data_dir`.
    pub store_file: String,
    /// Key the persisted configuration is stored under.
    pub store_key: String,
    /// Name of the broadcast channel shared by all windows.
    pub channel_name: String,
    /// Reload the store when the file is changed by another process.
    pub watch_store: bool,
    /// How long a new window waits for a sibling's snapshot.
    pub snapshot_wait_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            backend: "file".to_string(),
            store_file: "store.json".to_string(),
            store_key: "store".to_string(),
            channel_name: "shared-store".to_string(),
            watch_store: true,
            snapshot_wait_ms: 250,
        }
    }
}

impl AppConfig {
    /// Platform data directory joined with `tandem`.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tandem")
    }

    /// Load configuration.
    ///
    /// Reads `path` when given, otherwise starts from the defaults, then
    /// applies environment overrides.
    ///
    /// # Errors
    /// - The file cannot be read
    /// - The file is not a valid configuration
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                let raw = std::fs::read_to_string(path)?;
                Self::from_json(&raw)?
            }
            None => Self::default(),
        };
        Ok(config.with_data_dir_override(std::env::var_os(DATA_DIR_ENV)))
    }

    /// Parse configuration from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.store_file.is_empty() {
            return Err(Error::InvalidInput("store_file must not be empty".to_string()));
        }
        if self.store_key.is_empty() {
            return Err(Error::InvalidInput("store_key must not be empty".to_string()));
        }
        if self.channel_name.is_empty() {
            return Err(Error::InvalidInput("channel_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Use `dir` as the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    fn with_data_dir_override(self, value: Option<OsString>) -> Self {
        match value {
            Some(dir) if !dir.is_empty() => {
                debug!("{} overrides data directory", DATA_DIR_ENV);
                self.with_data_dir(dir)
            }
            _ => self,
        }
    }

    /// Full path of the store file.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.store_file)
    }

    pub fn snapshot_wait(&self) -> Duration {
        Duration::from_millis(self.snapshot_wait_ms)
    }

    /// Backend configuration handed to the registry factory.
    pub fn backend_config(&self) -> serde_json::Value {
        match self.backend.as_str() {
            "file" => json!({
                "path": self.store_path().to_string_lossy(),
                "watch": self.watch_store,
            }),
            _ => json!({}),
        }
    }
}
