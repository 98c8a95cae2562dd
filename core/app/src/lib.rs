//! Application wiring for Tandem.
//!
//! [`AppConfig`] says where state lives, [`AppContext::bootstrap`] builds the
//! storage backend, configuration store and shared-state replica of one
//! window, and [`init_tracing`] installs the log subscriber.

pub mod config;
pub mod context;

pub use config::{AppConfig, DATA_DIR_ENV};
pub use context::AppContext;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
