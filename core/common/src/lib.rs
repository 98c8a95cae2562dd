//! Common utilities and types shared across Tandem modules.
//!
//! This module provides the error type, identifiers and the listener
//! registry used by both the shared-state synchronizer and the persisted
//! configuration store.

pub mod error;
pub mod observer;
pub mod types;

pub use error::{Error, Result};
pub use observer::{Listener, Listeners, Subscription};
pub use types::{ActionKind, ResourceId, WindowId};
