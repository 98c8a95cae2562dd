//! Persisted configuration for Tandem.
//!
//! Per-resource settings and global action toggles, written through a
//! [`tandem_storage::StorageAdapter`] on every change and reloaded when the
//! stored record changes externally.

pub mod entry;
pub mod persisted;
pub mod store;

pub use entry::{keys, ConfigEntry};
pub use persisted::{FormatVersion, PersistedConfiguration};
pub use store::{ConfigStore, DEFAULT_STORE_KEY};
