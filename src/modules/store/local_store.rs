use chrono::Utc;
use serde_json::Value;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info};

use super::connection::{Database, DbPool};
use super::models::{
    Attachment, ChecklistItem, ConsistencyReport, EntityKind, QueueAction, QueuedPayload,
    StorageStats, SyncQueueItem, SyncState, WorkOrder,
};
use crate::shared::config::AppConfig;
use crate::shared::error::{AppError, Result};

// Fallback per-record size estimates when the pragma is unavailable.
const WORK_ORDER_EST_BYTES: u64 = 2048;
const CHECKLIST_ITEM_EST_BYTES: u64 = 512;
const ATTACHMENT_EST_BYTES: u64 = 1_048_576;

/// Typed, durable on-device store for synchronizable entities, the mutation
/// queue, and engine metadata. Every local mutation writes the entity and its
/// queue row in one transaction, so neither can survive a crash without the
/// other.
pub struct LocalStore {
    pool: DbPool,
    max_retry: u32,
}

impl LocalStore {
    pub fn new(pool: DbPool, max_retry: u32) -> Self {
        Self { pool, max_retry }
    }

    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let pool = Database::initialize(&config.database).await?;
        Ok(Self::new(pool, config.sync.max_retry))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // ---- work orders -----------------------------------------------------

    pub async fn get_work_order(&self, id: &str) -> Result<Option<WorkOrder>> {
        let record = sqlx::query_as::<_, WorkOrder>("SELECT * FROM work_orders WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn all_work_orders(&self) -> Result<Vec<WorkOrder>> {
        let records =
            sqlx::query_as::<_, WorkOrder>("SELECT * FROM work_orders ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(records)
    }

    /// Writes the record as given, replacing any existing row. Used to store
    /// server-canonical copies; local mutations go through the `_local` ops.
    pub async fn put_work_order(&self, wo: &WorkOrder) -> Result<()> {
        Self::write_work_order(&self.pool, wo).await
    }

    /// Creates a work order offline: entity insert and queue insert in one
    /// transaction.
    pub async fn create_work_order_local(&self, wo: &WorkOrder) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_work_order(&mut *tx, wo).await?;
        Self::enqueue_in(
            &mut tx,
            EntityKind::WorkOrders,
            &wo.id,
            QueueAction::Create,
            &QueuedPayload::WorkOrder(wo.clone()),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Applies a local edit: merges `changed_fields` into the offline-change
    /// set, marks the record pending, and enqueues the full payload.
    pub async fn update_work_order_local(
        &self,
        updated: &WorkOrder,
        changed_fields: &[&str],
    ) -> Result<WorkOrder> {
        let mut tx = self.pool.begin().await?;

        let existing =
            sqlx::query_as::<_, WorkOrder>("SELECT * FROM work_orders WHERE id = ?1")
                .bind(&updated.id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("work order {} not in offline store", updated.id))
                })?;

        let mut record = updated.clone();
        record.sync_state = SyncState::Pending;
        record.last_modified_offline = Utc::now().timestamp();
        record.offline_changes = merge_changes(&existing.offline_changes, changed_fields);

        Self::write_work_order(&mut *tx, &record).await?;
        Self::enqueue_in(
            &mut tx,
            EntityKind::WorkOrders,
            &record.id,
            QueueAction::Update,
            &QueuedPayload::WorkOrder(record.clone()),
        )
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn delete_work_order_local(&self, id: &str) -> Result<()> {
        self.delete_entity_local(EntityKind::WorkOrders, id).await
    }

    async fn write_work_order<'e, E>(executor: E, wo: &WorkOrder) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO work_orders (
                id, work_order_number, title, description, status, priority,
                assigned_to, equipment_id, created_at, updated_at,
                sync_state, last_modified_offline, offline_changes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&wo.id)
        .bind(&wo.work_order_number)
        .bind(&wo.title)
        .bind(&wo.description)
        .bind(&wo.status)
        .bind(&wo.priority)
        .bind(&wo.assigned_to)
        .bind(&wo.equipment_id)
        .bind(wo.created_at)
        .bind(wo.updated_at)
        .bind(wo.sync_state)
        .bind(wo.last_modified_offline)
        .bind(serde_json::to_string(&wo.offline_changes)?)
        .execute(executor)
        .await?;
        Ok(())
    }

    // ---- checklist items ---------------------------------------------------

    pub async fn get_checklist_item(&self, id: &str) -> Result<Option<ChecklistItem>> {
        let record =
            sqlx::query_as::<_, ChecklistItem>("SELECT * FROM checklist_items WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    pub async fn checklist_items_for(&self, work_order_id: &str) -> Result<Vec<ChecklistItem>> {
        let records = sqlx::query_as::<_, ChecklistItem>(
            "SELECT * FROM checklist_items WHERE work_order_id = ?1 ORDER BY order_index ASC",
        )
        .bind(work_order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn put_checklist_item(&self, item: &ChecklistItem) -> Result<()> {
        Self::write_checklist_item(&self.pool, item).await
    }

    pub async fn create_checklist_item_local(&self, item: &ChecklistItem) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_checklist_item(&mut *tx, item).await?;
        Self::enqueue_in(
            &mut tx,
            EntityKind::ChecklistItems,
            &item.id,
            QueueAction::Create,
            &QueuedPayload::ChecklistItem(item.clone()),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_checklist_item_local(
        &self,
        updated: &ChecklistItem,
        changed_fields: &[&str],
    ) -> Result<ChecklistItem> {
        let mut tx = self.pool.begin().await?;

        let existing =
            sqlx::query_as::<_, ChecklistItem>("SELECT * FROM checklist_items WHERE id = ?1")
                .bind(&updated.id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "checklist item {} not in offline store",
                        updated.id
                    ))
                })?;

        let mut record = updated.clone();
        record.sync_state = SyncState::Pending;
        record.last_modified_offline = Utc::now().timestamp();
        record.offline_changes = merge_changes(&existing.offline_changes, changed_fields);

        Self::write_checklist_item(&mut *tx, &record).await?;
        Self::enqueue_in(
            &mut tx,
            EntityKind::ChecklistItems,
            &record.id,
            QueueAction::Update,
            &QueuedPayload::ChecklistItem(record.clone()),
        )
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn delete_checklist_item_local(&self, id: &str) -> Result<()> {
        self.delete_entity_local(EntityKind::ChecklistItems, id).await
    }

    async fn write_checklist_item<'e, E>(executor: E, item: &ChecklistItem) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO checklist_items (
                id, work_order_id, label, order_index, is_completed, notes,
                sync_state, last_modified_offline, offline_changes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&item.id)
        .bind(&item.work_order_id)
        .bind(&item.label)
        .bind(item.order_index)
        .bind(item.is_completed)
        .bind(&item.notes)
        .bind(item.sync_state)
        .bind(item.last_modified_offline)
        .bind(serde_json::to_string(&item.offline_changes)?)
        .execute(executor)
        .await?;
        Ok(())
    }

    // ---- attachments -------------------------------------------------------

    pub async fn get_attachment(&self, id: &str) -> Result<Option<Attachment>> {
        let record = sqlx::query_as::<_, Attachment>("SELECT * FROM attachments WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn attachments_for(&self, work_order_id: &str) -> Result<Vec<Attachment>> {
        let records = sqlx::query_as::<_, Attachment>(
            "SELECT * FROM attachments WHERE work_order_id = ?1 ORDER BY last_modified_offline ASC",
        )
        .bind(work_order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn put_attachment(&self, att: &Attachment) -> Result<()> {
        Self::write_attachment(&self.pool, att).await
    }

    pub async fn create_attachment_local(&self, att: &Attachment) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_attachment(&mut *tx, att).await?;
        Self::enqueue_in(
            &mut tx,
            EntityKind::Attachments,
            &att.id,
            QueueAction::Create,
            &QueuedPayload::Attachment(att.clone()),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_attachment_local(&self, id: &str) -> Result<()> {
        self.delete_entity_local(EntityKind::Attachments, id).await
    }

    async fn write_attachment<'e, E>(executor: E, att: &Attachment) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO attachments (
                id, work_order_id, file_name, file_path, content_type,
                size_bytes, local_blob, sync_state, last_modified_offline,
                offline_changes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&att.id)
        .bind(&att.work_order_id)
        .bind(&att.file_name)
        .bind(&att.file_path)
        .bind(&att.content_type)
        .bind(att.size_bytes)
        .bind(&att.local_blob)
        .bind(att.sync_state)
        .bind(att.last_modified_offline)
        .bind(serde_json::to_string(&att.offline_changes)?)
        .execute(executor)
        .await?;
        Ok(())
    }

    // ---- generic entity helpers ---------------------------------------------

    /// Stores a canonical entity payload into its table.
    pub async fn put_entity(&self, payload: &QueuedPayload) -> Result<()> {
        match payload {
            QueuedPayload::WorkOrder(wo) => self.put_work_order(wo).await,
            QueuedPayload::ChecklistItem(item) => self.put_checklist_item(item).await,
            QueuedPayload::Attachment(att) => self.put_attachment(att).await,
            QueuedPayload::Tombstone { id } => Err(AppError::InvalidInput(format!(
                "cannot store tombstone payload for record {id}"
            ))),
        }
    }

    /// Deletes an entity row and enqueues its tombstone. The same transaction
    /// removes any queued create/update for the record: a delete supersedes
    /// earlier pending mutations.
    async fn delete_entity_local(&self, kind: EntityKind, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DELETE FROM {} WHERE id = ?1", kind.as_str()))
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let superseded = sqlx::query(
            "DELETE FROM sync_queue WHERE tbl = ?1 AND record_id = ?2 AND action IN ('create', 'update')",
        )
        .bind(kind)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        Self::enqueue_in(
            &mut tx,
            kind,
            id,
            QueueAction::Delete,
            &QueuedPayload::Tombstone { id: id.to_string() },
        )
        .await?;
        tx.commit().await?;

        if superseded > 0 {
            debug!(
                table = kind.as_str(),
                record_id = id,
                superseded,
                "delete superseded queued mutations"
            );
        }
        Ok(())
    }

    /// Removes an entity row without touching the queue. Used when a create
    /// comes back with a server-assigned id and the placeholder row keyed by
    /// the local id is obsolete.
    pub async fn delete_entity_row(&self, kind: EntityKind, id: &str) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?1", kind.as_str()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_synced(&self, kind: EntityKind, id: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET sync_state = 'synced', offline_changes = '[]' WHERE id = ?1",
            kind.as_str()
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_conflict(&self, kind: EntityKind, id: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET sync_state = 'conflict' WHERE id = ?1",
            kind.as_str()
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_pending(&self, kind: EntityKind, id: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET sync_state = 'pending' WHERE id = ?1",
            kind.as_str()
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- sync queue ----------------------------------------------------------

    async fn enqueue_in(
        tx: &mut Transaction<'_, Sqlite>,
        kind: EntityKind,
        record_id: &str,
        action: QueueAction,
        payload: &QueuedPayload,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_queue (tbl, record_id, action, payload, enqueued_at, retry_count, blocked)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, 0)
            "#,
        )
        .bind(kind)
        .bind(record_id)
        .bind(action)
        .bind(serde_json::to_string(payload)?)
        .bind(Utc::now().timestamp())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Oldest eligible queue items in enqueue order. Exhausted items
    /// (`retry_count >= max_retry`) and conflict-parked items are excluded
    /// from automatic draining but stay in the table.
    pub async fn dequeue_batch(&self, limit: u32) -> Result<Vec<SyncQueueItem>> {
        let items = sqlx::query_as::<_, SyncQueueItem>(
            r#"
            SELECT * FROM sync_queue
            WHERE blocked = 0 AND retry_count < ?1
            ORDER BY id ASC
            LIMIT ?2
            "#,
        )
        .bind(self.max_retry as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn get_queue_item(&self, id: i64) -> Result<Option<SyncQueueItem>> {
        let item = sqlx::query_as::<_, SyncQueueItem>("SELECT * FROM sync_queue WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    /// Removes a confirmed queue item.
    pub async fn complete_queue_item(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Explicit failure transition: bumps the retry counter and records the
    /// error. The item itself is retained.
    pub async fn fail_queue_item(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sync_queue SET retry_count = retry_count + 1, last_error = ?2 WHERE id = ?1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Parks a conflicted item until it is explicitly resolved.
    pub async fn block_queue_item(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE sync_queue SET blocked = 1, last_error = ?2 WHERE id = ?1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn unblock_queue_item(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE sync_queue SET blocked = 0 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Operator re-arm of an exhausted item.
    pub async fn reset_retries(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE sync_queue SET retry_count = 0, last_error = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Operator-initiated removal of a queue item, pending or not.
    pub async fn purge_queue_item(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        info!(queue_id = id, "queue item purged");
        Ok(())
    }

    /// Rewrites a parked item as a fresh update carrying the given payload
    /// (merge-strategy conflict resolution).
    pub async fn convert_to_update(&self, id: i64, payload: &QueuedPayload) -> Result<()> {
        sqlx::query(
            "UPDATE sync_queue SET action = 'update', payload = ?2, blocked = 0, \
             retry_count = 0, last_error = NULL WHERE id = ?1",
        )
        .bind(id)
        .bind(serde_json::to_string(payload)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete-wins sweep: drops any queued create/update that a later queued
    /// delete for the same record makes pointless. Returns the number of rows
    /// discarded.
    pub async fn collapse_superseded(&self) -> Result<u64> {
        let removed = sqlx::query(
            r#"
            DELETE FROM sync_queue
            WHERE action IN ('create', 'update')
              AND EXISTS (
                  SELECT 1 FROM sync_queue later
                  WHERE later.tbl = sync_queue.tbl
                    AND later.record_id = sync_queue.record_id
                    AND later.action = 'delete'
                    AND later.id > sync_queue.id
              )
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed)
    }

    /// Items still eligible for automatic draining. Conflict-parked and
    /// retry-exhausted rows are reported through [`Self::queue_errors`]
    /// instead, so this reads as "will go out on the next pass".
    pub async fn pending_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sync_queue WHERE blocked = 0 AND retry_count < ?1",
        )
        .bind(self.max_retry as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Items that have failed at least once or are parked on a conflict.
    /// These back the `sync_errors` surface of the status model.
    pub async fn queue_errors(&self) -> Result<Vec<SyncQueueItem>> {
        let items = sqlx::query_as::<_, SyncQueueItem>(
            "SELECT * FROM sync_queue WHERE retry_count > 0 OR blocked = 1 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    // ---- metadata --------------------------------------------------------------

    pub async fn set_metadata(&self, key: &str, value: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<Value>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM metadata WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((raw,)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // ---- maintenance --------------------------------------------------------------

    /// Wipes every table in one transaction (logout/reset).
    pub async fn clear_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "work_orders",
            "checklist_items",
            "attachments",
            "sync_queue",
            "metadata",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!("all offline data cleared");
        Ok(())
    }

    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let work_orders = self.count_table("work_orders").await?;
        let checklist_items = self.count_table("checklist_items").await?;
        let attachments = self.count_table("attachments").await?;
        let pending_sync = self.pending_count().await?;

        let total_size = match self.database_size().await {
            Ok(size) if size > 0 => size,
            _ => {
                work_orders * WORK_ORDER_EST_BYTES
                    + checklist_items * CHECKLIST_ITEM_EST_BYTES
                    + attachments * ATTACHMENT_EST_BYTES
            }
        };

        Ok(StorageStats {
            work_orders,
            checklist_items,
            attachments,
            pending_sync,
            total_size,
        })
    }

    async fn count_table(&self, table: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn database_size(&self) -> Result<u64> {
        let (pages,): (i64,) = sqlx::query_as("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let (page_size,): (i64,) = sqlx::query_as("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        Ok((pages as u64).saturating_mul(page_size as u64))
    }

    /// Reconstructs the queue/entity pairing from the durable tables. After a
    /// recovery, every pending entity must have a queue row and every
    /// non-tombstone queue row must have its entity.
    pub async fn verify_consistency(&self) -> Result<ConsistencyReport> {
        let mut report = ConsistencyReport::default();

        for kind in [
            EntityKind::WorkOrders,
            EntityKind::ChecklistItems,
            EntityKind::Attachments,
        ] {
            let orphans: Vec<(i64,)> = sqlx::query_as(&format!(
                r#"
                SELECT q.id FROM sync_queue q
                WHERE q.tbl = ?1 AND q.action != 'delete'
                  AND NOT EXISTS (SELECT 1 FROM {} e WHERE e.id = q.record_id)
                "#,
                kind.as_str()
            ))
            .bind(kind)
            .fetch_all(&self.pool)
            .await?;
            report
                .orphan_queue_items
                .extend(orphans.into_iter().map(|(id,)| id));

            let unqueued: Vec<(String,)> = sqlx::query_as(&format!(
                r#"
                SELECT e.id FROM {} e
                WHERE e.sync_state = 'pending'
                  AND NOT EXISTS (
                      SELECT 1 FROM sync_queue q
                      WHERE q.tbl = ?1 AND q.record_id = e.id
                  )
                "#,
                kind.as_str()
            ))
            .bind(kind)
            .fetch_all(&self.pool)
            .await?;
            report
                .unqueued_pending
                .extend(unqueued.into_iter().map(|(id,)| (kind, id)));
        }

        Ok(report)
    }
}

fn merge_changes(existing: &[String], changed: &[&str]) -> Vec<String> {
    let mut merged: Vec<String> = existing.to_vec();
    for field in changed {
        if !merged.iter().any(|f| f == field) {
            merged.push((*field).to_string());
        }
    }
    merged
}
