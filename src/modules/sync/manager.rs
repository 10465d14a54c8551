use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::apply::{self, ApplyError};
use super::models::{BatchOutcome, ConflictStrategy, SyncError, SyncStatus};
use super::notifier::{StatusNotifier, Subscription};
use crate::modules::connectivity::ConnectivityMonitor;
use crate::modules::remote::{RemoteError, RemoteService};
use crate::modules::store::models::{QueueAction, QueuedPayload};
use crate::modules::store::LocalStore;
use crate::shared::config::SyncConfig;
use crate::shared::error::{AppError, Result};

const LAST_SYNC_KEY: &str = "last_sync";

/// Orchestrates synchronization: drains the queue in bounded batches against
/// the remote service, updates local sync state, and reports status.
///
/// One instance per running application, constructed explicitly and shared by
/// reference. At most one sync pass runs at a time; concurrent `sync()` calls
/// collapse into a status read. Offline is a property of the connectivity
/// monitor, not a manager state.
pub struct SyncManager {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteService>,
    connectivity: ConnectivityMonitor,
    notifier: StatusNotifier,
    config: SyncConfig,
    is_syncing: RwLock<bool>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
    watcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteService>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            notifier: StatusNotifier::new(),
            config,
            is_syncing: RwLock::new(false),
            timer_task: Mutex::new(None),
            watcher_task: Mutex::new(None),
        }
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Registers a status observer; the returned disposer unregisters it.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.notifier.subscribe(listener)
    }

    /// Current status snapshot, computed from the durable tables.
    pub async fn status(&self) -> Result<SyncStatus> {
        let pending_items = self.store.pending_count().await?;
        let sync_errors: Vec<SyncError> = self
            .store
            .queue_errors()
            .await?
            .iter()
            .map(SyncError::from)
            .collect();
        let last_sync = self
            .store
            .get_metadata(LAST_SYNC_KEY)
            .await?
            .and_then(|v| v.as_i64());

        Ok(SyncStatus {
            is_online: self.connectivity.is_online(),
            is_syncing: *self.is_syncing.read().await,
            last_sync,
            pending_items,
            sync_errors,
        })
    }

    /// Runs one sync pass. No-op returning the current status when offline or
    /// when a pass is already in flight. Per-item failures are contained and
    /// recorded on the queue items; the call itself only fails on storage
    /// errors.
    pub async fn sync(&self) -> Result<SyncStatus> {
        if !self.connectivity.is_online() {
            debug!("sync skipped: offline");
            return self.status().await;
        }

        {
            let mut syncing = self.is_syncing.write().await;
            if *syncing {
                debug!("sync already in progress");
                drop(syncing);
                return self.status().await;
            }
            *syncing = true;
        }

        if let Ok(status) = self.status().await {
            self.notifier.notify(&status);
        }

        let outcome = self.run_batch().await;
        match &outcome {
            Ok(o) => info!(
                applied = o.applied,
                failed = o.failed,
                conflicts = o.conflicts,
                superseded = o.superseded,
                "sync pass completed"
            ),
            Err(e) => error!(error = %e, "sync pass aborted"),
        }

        if outcome.is_ok() {
            let now = Utc::now().timestamp();
            if let Err(e) = self.store.set_metadata(LAST_SYNC_KEY, &json!(now)).await {
                warn!(error = %e, "failed to persist last_sync");
            }
        }

        *self.is_syncing.write().await = false;

        let status = self.status().await?;
        self.notifier.notify(&status);
        Ok(status)
    }

    /// Drains one bounded batch, strictly in order. A failing item never
    /// aborts the rest of the batch.
    async fn run_batch(&self) -> Result<BatchOutcome> {
        let superseded = self.store.collapse_superseded().await?;
        if superseded > 0 {
            debug!(superseded, "discarded queue items superseded by deletes");
        }

        let batch = self.store.dequeue_batch(self.config.batch_size).await?;
        let mut outcome = BatchOutcome {
            superseded,
            ..Default::default()
        };

        for item in &batch {
            match apply::apply_item(self.store.as_ref(), self.remote.as_ref(), item).await {
                Ok(()) => {
                    self.store.complete_queue_item(item.id).await?;
                    outcome.applied += 1;
                    debug!(
                        table = item.table.as_str(),
                        record_id = %item.record_id,
                        action = item.action.as_str(),
                        "queue item applied"
                    );
                }
                Err(ApplyError::Remote(RemoteError::NotFound))
                    if item.action != QueueAction::Create =>
                {
                    // Record already gone upstream; applying again would never
                    // succeed, so treat it as done.
                    info!(
                        table = item.table.as_str(),
                        record_id = %item.record_id,
                        action = item.action.as_str(),
                        "record not found upstream, treating as applied"
                    );
                    self.store.complete_queue_item(item.id).await?;
                    if item.action == QueueAction::Update {
                        self.store.mark_synced(item.table, &item.record_id).await?;
                    }
                    outcome.applied += 1;
                }
                Err(ApplyError::Remote(RemoteError::Conflict { .. })) => {
                    self.store
                        .block_queue_item(item.id, "remote version conflict")
                        .await?;
                    self.store.mark_conflict(item.table, &item.record_id).await?;
                    outcome.conflicts += 1;
                    warn!(
                        table = item.table.as_str(),
                        record_id = %item.record_id,
                        "conflict detected, awaiting resolution"
                    );
                }
                Err(err) => {
                    let message = describe(err);
                    self.store.fail_queue_item(item.id, &message).await?;
                    outcome.failed += 1;
                    warn!(
                        table = item.table.as_str(),
                        record_id = %item.record_id,
                        error = %message,
                        "queue item failed"
                    );
                }
            }
        }

        Ok(outcome)
    }

    /// Explicitly resolves a conflicted queue item. Until this (or
    /// [`Self::unblock_conflict`]) is called, the item stays parked and the
    /// entity stays in the conflict state.
    pub async fn resolve_conflict(
        &self,
        queue_item_id: i64,
        remote_data: Option<Value>,
        strategy: ConflictStrategy,
    ) -> Result<()> {
        let item = self
            .store
            .get_queue_item(queue_item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("queue item {queue_item_id}")))?;

        match strategy {
            ConflictStrategy::Local => {
                // Push the local payload through unconditionally.
                apply::apply_item(self.store.as_ref(), self.remote.as_ref(), &item)
                    .await
                    .map_err(|e| {
                        AppError::Internal(format!("local re-apply failed: {}", describe(e)))
                    })?;
                self.store.complete_queue_item(item.id).await?;
                info!(queue_id = item.id, "conflict resolved keeping local changes");
            }
            ConflictStrategy::Remote => {
                let remote_value = remote_data.ok_or_else(|| {
                    AppError::InvalidInput(
                        "remote conflict resolution requires the remote record".to_string(),
                    )
                })?;
                let canonical = match item.decode_payload() {
                    Ok(QueuedPayload::WorkOrder(wo)) => QueuedPayload::WorkOrder(
                        apply::merge_canonical(&wo, &remote_value).map_err(into_app_error)?,
                    ),
                    Ok(QueuedPayload::ChecklistItem(ci)) => QueuedPayload::ChecklistItem(
                        apply::merge_canonical(&ci, &remote_value).map_err(into_app_error)?,
                    ),
                    Ok(QueuedPayload::Attachment(att)) => QueuedPayload::Attachment(
                        apply::merge_canonical(&att, &remote_value).map_err(into_app_error)?,
                    ),
                    // Tombstone or undecodable payload: rebuild from the
                    // remote record alone.
                    _ => apply::entity_from_remote(item.table, &remote_value)
                        .map_err(into_app_error)?,
                };
                self.store.put_entity(&canonical).await?;
                self.store.purge_queue_item(item.id).await?;
                info!(queue_id = item.id, "conflict resolved keeping remote state");
            }
            ConflictStrategy::Merge(merged) => {
                if apply::kind_of(&merged) != Some(item.table) {
                    return Err(AppError::InvalidInput(format!(
                        "merged payload kind does not match queue item table {}",
                        item.table
                    )));
                }
                // The merged payload replaces the queued mutation and goes out
                // as a fresh update.
                self.store.convert_to_update(item.id, &merged).await?;
                let fresh = self
                    .store
                    .get_queue_item(item.id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("queue item {queue_item_id}")))?;
                match apply::apply_item(self.store.as_ref(), self.remote.as_ref(), &fresh).await {
                    Ok(()) => {
                        self.store.complete_queue_item(fresh.id).await?;
                        info!(queue_id = fresh.id, "conflict resolved with merged payload");
                    }
                    Err(e) => {
                        // Re-armed as a normal pending update; the next batch
                        // retries it.
                        let message = describe(e);
                        self.store.fail_queue_item(fresh.id, &message).await?;
                        self.store.mark_pending(fresh.table, &fresh.record_id).await?;
                        warn!(
                            queue_id = fresh.id,
                            error = %message,
                            "merged payload did not apply, queued for retry"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Re-arms a conflicted item for automatic retry without resolving it.
    pub async fn unblock_conflict(&self, queue_item_id: i64) -> Result<()> {
        let item = self
            .store
            .get_queue_item(queue_item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("queue item {queue_item_id}")))?;
        self.store.unblock_queue_item(item.id).await?;
        self.store.mark_pending(item.table, &item.record_id).await?;
        Ok(())
    }

    /// Operator re-arm of an item that exhausted its retries.
    pub async fn retry_exhausted(&self, queue_item_id: i64) -> Result<()> {
        self.store.reset_retries(queue_item_id).await
    }

    /// Operator removal of a queue item that will never apply.
    pub async fn purge_queue_item(&self, queue_item_id: i64) -> Result<()> {
        self.store.purge_queue_item(queue_item_id).await
    }

    /// Wipes all offline data (logout/reset) and notifies listeners.
    pub async fn clear_all_data(&self) -> Result<()> {
        self.store.clear_all().await?;
        if let Ok(status) = self.status().await {
            self.notifier.notify(&status);
        }
        Ok(())
    }

    /// Starts reacting to connectivity: a reconnect triggers an immediate
    /// sync and (when auto-sync is on) the periodic timer; going offline
    /// stops the timer.
    pub async fn start(self: &Arc<Self>) {
        if self.connectivity.is_online() && self.config.auto_sync {
            self.start_timer().await;
        }

        let manager = Arc::clone(self);
        let mut rx = self.connectivity.subscribe();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online {
                    if manager.config.auto_sync {
                        manager.start_timer().await;
                    }
                    if let Err(e) = manager.sync().await {
                        error!(error = %e, "reconnect sync failed");
                    }
                } else {
                    manager.stop_timer().await;
                }
            }
        });

        let mut watcher = self.watcher_task.lock().await;
        if let Some(previous) = watcher.replace(handle) {
            previous.abort();
        }
    }

    async fn start_timer(self: &Arc<Self>) {
        let mut guard = self.timer_task.lock().await;
        if guard.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        let interval_secs = self.config.sync_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            // The immediate first tick is covered by the reconnect sync.
            interval.tick().await;
            loop {
                interval.tick().await;
                if !manager.connectivity.is_online() {
                    continue;
                }
                if let Err(e) = manager.sync().await {
                    error!(error = %e, "periodic sync failed");
                }
            }
        });
        *guard = Some(handle);
        debug!(interval_secs, "periodic sync timer started");
    }

    async fn stop_timer(&self) {
        if let Some(handle) = self.timer_task.lock().await.take() {
            handle.abort();
            debug!("periodic sync timer stopped");
        }
    }

    /// Stops the timer and the connectivity watcher.
    pub async fn shutdown(&self) {
        self.stop_timer().await;
        if let Some(handle) = self.watcher_task.lock().await.take() {
            handle.abort();
        }
    }
}

fn describe(err: ApplyError) -> String {
    match err {
        ApplyError::Remote(e) => e.to_string(),
        ApplyError::Internal(msg) => msg,
    }
}

fn into_app_error(err: ApplyError) -> AppError {
    AppError::Internal(describe(err))
}
