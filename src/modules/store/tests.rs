use sqlx::sqlite::SqlitePoolOptions;

use super::models::{EntityKind, QueueAction, QueuedPayload, SyncState, WorkOrder};
use super::LocalStore;

async fn setup_store() -> LocalStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    LocalStore::new(pool, 3)
}

#[tokio::test]
async fn test_create_writes_entity_and_queue_together() {
    let store = setup_store().await;
    let wo = WorkOrder::new_local("WO-1", "Replace pump seal");

    store.create_work_order_local(&wo).await.unwrap();

    let stored = store.get_work_order(&wo.id).await.unwrap().unwrap();
    assert_eq!(stored.sync_state, SyncState::Pending);

    let batch = store.dequeue_batch(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].table, EntityKind::WorkOrders);
    assert_eq!(batch[0].action, QueueAction::Create);
    assert_eq!(batch[0].record_id, wo.id);

    let report = store.verify_consistency().await.unwrap();
    assert!(report.is_consistent());
}

#[tokio::test]
async fn test_update_merges_offline_changes_without_duplicates() {
    let store = setup_store().await;
    let wo = WorkOrder::new_local("WO-2", "Inspect conveyor");
    store.create_work_order_local(&wo).await.unwrap();

    let mut edited = wo.clone();
    edited.status = "in_progress".to_string();
    let first = store
        .update_work_order_local(&edited, &["status"])
        .await
        .unwrap();
    assert_eq!(first.offline_changes, vec!["status".to_string()]);

    let mut edited_again = first.clone();
    edited_again.priority = "high".to_string();
    let second = store
        .update_work_order_local(&edited_again, &["status", "priority"])
        .await
        .unwrap();
    assert_eq!(
        second.offline_changes,
        vec!["status".to_string(), "priority".to_string()]
    );
    assert_eq!(second.sync_state, SyncState::Pending);

    // create + two updates
    assert_eq!(store.pending_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_delete_supersedes_queued_mutations() {
    let store = setup_store().await;
    let wo = WorkOrder::new_local("WO-3", "Lubricate bearings");
    store.create_work_order_local(&wo).await.unwrap();

    let mut edited = wo.clone();
    edited.status = "in_progress".to_string();
    store
        .update_work_order_local(&edited, &["status"])
        .await
        .unwrap();

    store.delete_work_order_local(&wo.id).await.unwrap();

    let batch = store.dequeue_batch(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].action, QueueAction::Delete);
    assert_eq!(batch[0].record_id, wo.id);
    assert!(matches!(
        batch[0].decode_payload().unwrap(),
        QueuedPayload::Tombstone { .. }
    ));

    assert!(store.get_work_order(&wo.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_collapse_superseded_sweeps_stale_rows() {
    let store = setup_store().await;

    // Simulate a queue state an older engine version could have left behind:
    // create/update rows that precede a delete for the same record.
    for (action, payload) in [
        ("create", r#"{"kind":"tombstone","id":"rec-1"}"#),
        ("update", r#"{"kind":"tombstone","id":"rec-1"}"#),
        ("delete", r#"{"kind":"tombstone","id":"rec-1"}"#),
    ] {
        sqlx::query(
            "INSERT INTO sync_queue (tbl, record_id, action, payload, enqueued_at) VALUES ('work_orders', 'rec-1', ?1, ?2, 0)",
        )
        .bind(action)
        .bind(payload)
        .execute(store.pool())
        .await
        .unwrap();
    }

    let removed = store.collapse_superseded().await.unwrap();
    assert_eq!(removed, 2);

    let batch = store.dequeue_batch(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].action, QueueAction::Delete);
}

#[tokio::test]
async fn test_dequeue_excludes_exhausted_and_blocked_items() {
    let store = setup_store().await;

    for n in 1..=3 {
        let wo = WorkOrder::new_local(format!("WO-{n}"), "Task");
        store.create_work_order_local(&wo).await.unwrap();
    }

    let batch = store.dequeue_batch(10).await.unwrap();
    assert_eq!(batch.len(), 3);
    let (first, second) = (batch[0].id, batch[1].id);

    // Exhaust the first item.
    for _ in 0..3 {
        store.fail_queue_item(first, "remote unavailable").await.unwrap();
    }
    // Park the second on a conflict.
    store.block_queue_item(second, "version mismatch").await.unwrap();

    let batch = store.dequeue_batch(10).await.unwrap();
    assert_eq!(batch.len(), 1);

    let errors = store.queue_errors().await.unwrap();
    assert_eq!(errors.len(), 2);
    let exhausted = errors.iter().find(|i| i.id == first).unwrap();
    assert_eq!(exhausted.retry_count, 3);
    assert_eq!(exhausted.last_error.as_deref(), Some("remote unavailable"));
    assert!(errors.iter().find(|i| i.id == second).unwrap().blocked);

    // Operator re-arm brings the exhausted item back.
    store.reset_retries(first).await.unwrap();
    store.unblock_queue_item(second).await.unwrap();
    let batch = store.dequeue_batch(10).await.unwrap();
    assert_eq!(batch.len(), 3);
}

#[tokio::test]
async fn test_pending_count_excludes_parked_items() {
    let store = setup_store().await;

    for n in 1..=3 {
        let wo = WorkOrder::new_local(format!("WO-{n}"), "Task");
        store.create_work_order_local(&wo).await.unwrap();
    }
    assert_eq!(store.pending_count().await.unwrap(), 3);

    let batch = store.dequeue_batch(10).await.unwrap();
    let (first, second) = (batch[0].id, batch[1].id);
    for _ in 0..3 {
        store.fail_queue_item(first, "remote unavailable").await.unwrap();
    }
    store.block_queue_item(second, "version mismatch").await.unwrap();

    // Parked rows stay in the table but no longer read as pending.
    assert_eq!(store.pending_count().await.unwrap(), 1);
    assert_eq!(store.queue_errors().await.unwrap().len(), 2);

    store.reset_retries(first).await.unwrap();
    store.unblock_queue_item(second).await.unwrap();
    assert_eq!(store.pending_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_dequeue_respects_limit_and_order() {
    let store = setup_store().await;

    let mut ids = Vec::new();
    for n in 0..5 {
        let wo = WorkOrder::new_local(format!("WO-{n}"), "Task");
        ids.push(wo.id.clone());
        store.create_work_order_local(&wo).await.unwrap();
    }

    let batch = store.dequeue_batch(2).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].record_id, ids[0]);
    assert_eq!(batch[1].record_id, ids[1]);
}

#[tokio::test]
async fn test_metadata_roundtrip_and_overwrite() {
    let store = setup_store().await;

    assert!(store.get_metadata("last_sync").await.unwrap().is_none());

    store
        .set_metadata("last_sync", &serde_json::json!(1_700_000_000))
        .await
        .unwrap();
    store
        .set_metadata("last_sync", &serde_json::json!(1_700_000_060))
        .await
        .unwrap();

    let value = store.get_metadata("last_sync").await.unwrap().unwrap();
    assert_eq!(value, serde_json::json!(1_700_000_060));
}

#[tokio::test]
async fn test_mark_synced_clears_offline_changes() {
    let store = setup_store().await;
    let wo = WorkOrder::new_local("WO-9", "Calibrate sensor");
    store.create_work_order_local(&wo).await.unwrap();

    let mut edited = wo.clone();
    edited.status = "completed".to_string();
    store
        .update_work_order_local(&edited, &["status"])
        .await
        .unwrap();

    store
        .mark_synced(EntityKind::WorkOrders, &wo.id)
        .await
        .unwrap();

    let stored = store.get_work_order(&wo.id).await.unwrap().unwrap();
    assert_eq!(stored.sync_state, SyncState::Synced);
    assert!(stored.offline_changes.is_empty());
}

#[tokio::test]
async fn test_clear_all_wipes_every_table() {
    let store = setup_store().await;
    let wo = WorkOrder::new_local("WO-4", "Swap filter");
    store.create_work_order_local(&wo).await.unwrap();
    store
        .set_metadata("last_sync", &serde_json::json!(1))
        .await
        .unwrap();

    store.clear_all().await.unwrap();

    assert!(store.all_work_orders().await.unwrap().is_empty());
    assert_eq!(store.pending_count().await.unwrap(), 0);
    assert!(store.get_metadata("last_sync").await.unwrap().is_none());
}

#[tokio::test]
async fn test_storage_stats_counts_records() {
    let store = setup_store().await;

    let wo = WorkOrder::new_local("WO-5", "Check belts");
    store.create_work_order_local(&wo).await.unwrap();
    let item = super::models::ChecklistItem::new_local(&wo.id, "Tension check", 0);
    store.create_checklist_item_local(&item).await.unwrap();
    let att = super::models::Attachment::new_local(&wo.id, "photo.jpg", "wo/photo.jpg", Some(vec![0u8; 64]));
    store.create_attachment_local(&att).await.unwrap();

    let stats = store.storage_stats().await.unwrap();
    assert_eq!(stats.work_orders, 1);
    assert_eq!(stats.checklist_items, 1);
    assert_eq!(stats.attachments, 1);
    assert_eq!(stats.pending_sync, 3);
    assert!(stats.total_size > 0);
}

#[tokio::test]
async fn test_verify_consistency_flags_torn_writes() {
    let store = setup_store().await;

    // A pending entity written without its queue row...
    let wo = WorkOrder::new_local("WO-6", "Torn write");
    store.put_work_order(&wo).await.unwrap();
    // ...and a queue row whose entity never landed.
    sqlx::query(
        "INSERT INTO sync_queue (tbl, record_id, action, payload, enqueued_at) VALUES ('work_orders', 'ghost', 'update', '{}', 0)",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let report = store.verify_consistency().await.unwrap();
    assert!(!report.is_consistent());
    assert_eq!(report.orphan_queue_items.len(), 1);
    assert_eq!(
        report.unqueued_pending,
        vec![(EntityKind::WorkOrders, wo.id.clone())]
    );

    // The normal mutation path never produces either half on its own.
    let wo2 = WorkOrder::new_local("WO-7", "Paired write");
    store.create_work_order_local(&wo2).await.unwrap();
    let report = store.verify_consistency().await.unwrap();
    assert_eq!(report.orphan_queue_items.len(), 1);
    assert_eq!(report.unqueued_pending.len(), 1);
}
