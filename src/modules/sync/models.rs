use serde::{Deserialize, Serialize};

use crate::modules::store::models::{EntityKind, QueueAction, QueuedPayload, SyncQueueItem};

/// Point-in-time view of the engine for UI consumers. Derived on demand from
/// the durable tables; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync: Option<i64>,
    pub pending_items: u64,
    pub sync_errors: Vec<SyncError>,
}

/// A queue item that has failed at least once or is parked on a conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncError {
    pub id: i64,
    pub table: EntityKind,
    pub action: QueueAction,
    pub error: String,
    pub timestamp: i64,
    pub retry_count: i64,
}

impl From<&SyncQueueItem> for SyncError {
    fn from(item: &SyncQueueItem) -> Self {
        Self {
            id: item.id,
            table: item.table,
            action: item.action,
            error: item
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
            timestamp: item.enqueued_at,
            retry_count: item.retry_count,
        }
    }
}

/// Operator's choice when resolving a detected write/write conflict.
#[derive(Debug, Clone)]
pub enum ConflictStrategy {
    /// Re-apply the local payload, overwriting remote state.
    Local,
    /// Keep the remote record, discarding the local mutation.
    Remote,
    /// Apply a caller-supplied pre-merged payload as a fresh update.
    Merge(QueuedPayload),
}

/// Per-pass accounting, logged after every drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: u32,
    pub failed: u32,
    pub conflicts: u32,
    pub superseded: u64,
}
