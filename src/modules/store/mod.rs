pub mod connection;
pub mod local_store;
pub mod models;

#[cfg(test)]
mod tests;

pub use connection::{Database, DbPool};
pub use local_store::LocalStore;
pub use models::{
    Attachment, ChecklistItem, ConsistencyReport, EntityKind, QueueAction, QueuedPayload,
    StorageStats, SyncQueueItem, SyncState, WorkOrder,
};
