mod apply;
pub mod manager;
pub mod models;
pub mod notifier;


pub use manager::SyncManager;
pub use models::{BatchOutcome, ConflictStrategy, SyncError, SyncStatus};
pub use notifier::{StatusNotifier, Subscription};
