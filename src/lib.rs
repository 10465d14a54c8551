//! Offline-first synchronization engine for field maintenance work.
//!
//! Mutations made while disconnected land in a durable local store together
//! with a sync queue entry, in one transaction. A [`SyncManager`] drains the
//! queue against a pluggable [`RemoteService`] whenever connectivity allows,
//! with bounded retries, delete-wins supersede, and explicit conflict
//! resolution.

pub mod modules;
pub mod shared;

pub use modules::connectivity::ConnectivityMonitor;
pub use modules::remote::{RemoteError, RemoteResult, RemoteService};
pub use modules::store::{Database, LocalStore};
pub use modules::sync::{ConflictStrategy, SyncManager, SyncStatus, Subscription};
pub use shared::config::AppConfig;
pub use shared::error::{AppError, Result};

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Call once at startup; later calls are ignored.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("worksync=debug,info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
