use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Sync lifecycle of a local record. `Synced` records carry no offline
/// changes; `Conflict` records are parked until explicitly resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Synced,
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
            SyncState::Conflict => "conflict",
        }
    }
}

/// The synchronizable tables. Queue rows and apply dispatch are keyed by this
/// enum rather than raw table names.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EntityKind {
    WorkOrders,
    ChecklistItems,
    Attachments,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::WorkOrders => "work_orders",
            EntityKind::ChecklistItems => "checklist_items",
            EntityKind::Attachments => "attachments",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum QueueAction {
    Create,
    Update,
    Delete,
}

impl QueueAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueAction::Create => "create",
            QueueAction::Update => "update",
            QueueAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkOrder {
    pub id: String,
    pub work_order_number: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: String,
    pub assigned_to: Option<String>,
    pub equipment_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub sync_state: SyncState,
    pub last_modified_offline: i64,
    #[sqlx(json)]
    pub offline_changes: Vec<String>,
}

impl WorkOrder {
    /// A fresh locally-created work order awaiting its first sync.
    pub fn new_local(work_order_number: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            work_order_number: work_order_number.into(),
            title: title.into(),
            description: None,
            status: "open".to_string(),
            priority: "medium".to_string(),
            assigned_to: None,
            equipment_id: None,
            created_at: now,
            updated_at: now,
            sync_state: SyncState::Pending,
            last_modified_offline: now,
            offline_changes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ChecklistItem {
    pub id: String,
    pub work_order_id: String,
    pub label: String,
    pub order_index: i64,
    pub is_completed: bool,
    pub notes: Option<String>,
    pub sync_state: SyncState,
    pub last_modified_offline: i64,
    #[sqlx(json)]
    pub offline_changes: Vec<String>,
}

impl ChecklistItem {
    pub fn new_local(
        work_order_id: impl Into<String>,
        label: impl Into<String>,
        order_index: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            work_order_id: work_order_id.into(),
            label: label.into(),
            order_index,
            is_completed: false,
            notes: None,
            sync_state: SyncState::Pending,
            last_modified_offline: Utc::now().timestamp(),
            offline_changes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Attachment {
    pub id: String,
    pub work_order_id: String,
    pub file_name: String,
    pub file_path: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    /// File bytes captured while offline; uploaded before the metadata
    /// record is created remotely.
    pub local_blob: Option<Vec<u8>>,
    pub sync_state: SyncState,
    pub last_modified_offline: i64,
    #[sqlx(json)]
    pub offline_changes: Vec<String>,
}

impl Attachment {
    pub fn new_local(
        work_order_id: impl Into<String>,
        file_name: impl Into<String>,
        file_path: impl Into<String>,
        blob: Option<Vec<u8>>,
    ) -> Self {
        let size = blob.as_ref().map(|b| b.len() as i64).unwrap_or(0);
        Self {
            id: Uuid::new_v4().to_string(),
            work_order_id: work_order_id.into(),
            file_name: file_name.into(),
            file_path: file_path.into(),
            content_type: None,
            size_bytes: size,
            local_blob: blob,
            sync_state: SyncState::Pending,
            last_modified_offline: Utc::now().timestamp(),
            offline_changes: Vec::new(),
        }
    }
}

/// Queue payload as a tagged union over the synchronizable kinds, so the
/// per-table apply dispatch is exhaustive. Deletes carry a tombstone with
/// just the record id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuedPayload {
    WorkOrder(WorkOrder),
    ChecklistItem(ChecklistItem),
    Attachment(Attachment),
    Tombstone { id: String },
}

impl QueuedPayload {
    pub fn record_id(&self) -> &str {
        match self {
            QueuedPayload::WorkOrder(wo) => &wo.id,
            QueuedPayload::ChecklistItem(item) => &item.id,
            QueuedPayload::Attachment(att) => &att.id,
            QueuedPayload::Tombstone { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SyncQueueItem {
    pub id: i64,
    #[sqlx(rename = "tbl")]
    #[serde(rename = "table")]
    pub table: EntityKind,
    pub record_id: String,
    pub action: QueueAction,
    /// JSON-encoded [`QueuedPayload`].
    pub payload: String,
    pub enqueued_at: i64,
    pub retry_count: i64,
    pub last_error: Option<String>,
    /// Parked by conflict detection; excluded from automatic draining.
    pub blocked: bool,
}

impl SyncQueueItem {
    pub fn decode_payload(&self) -> serde_json::Result<QueuedPayload> {
        serde_json::from_str(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub work_orders: u64,
    pub checklist_items: u64,
    pub attachments: u64,
    pub pending_sync: u64,
    /// Best-effort byte estimate of the local database.
    pub total_size: u64,
}

/// Result of reconstructing queue/entity pairing after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Queue rows whose entity no longer exists (tombstones excluded).
    pub orphan_queue_items: Vec<i64>,
    /// Pending entities with no queue row left to carry them remotely.
    pub unqueued_pending: Vec<(EntityKind, String)>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.orphan_queue_items.is_empty() && self.unqueued_pending.is_empty()
    }
}
