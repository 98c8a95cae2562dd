//! Durable key-value storage for Tandem.
//!
//! This module provides a trait-based interface for durable key-value
//! backends, two implementations (a JSON file and an in-memory store for
//! tests), a registry for resolving a backend from configuration, and the
//! write-through [`StorageAdapter`] used by the configuration store.
//!
//! # Design Principles
//! - Async operations: All I/O operations are async
//! - Explicit durability: mutations are durable only after `flush`
//! - Change notification: every backend reports changed keys to watchers

pub mod adapter;
pub mod backend;
pub mod file;
pub mod memory;
pub mod registry;

pub use adapter::StorageAdapter;
pub use backend::{ChangeOrigin, KeyChange, KeyValueBackend, KeyWatch, WriterId};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use registry::{create_default_registry, BackendFactory, BackendRegistry};
