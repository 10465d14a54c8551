use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::modules::remote::{RemoteError, RemoteService};
use crate::modules::store::models::{EntityKind, QueueAction, QueuedPayload, SyncQueueItem};
use crate::modules::store::LocalStore;

/// Outcome of one queue item's apply attempt, as the manager consumes it.
#[derive(Debug)]
pub(crate) enum ApplyError {
    Remote(RemoteError),
    /// Undecodable payload or a local store failure; retried like a
    /// transient error until the retry bound parks it.
    Internal(String),
}

impl From<RemoteError> for ApplyError {
    fn from(err: RemoteError) -> Self {
        ApplyError::Remote(err)
    }
}

/// Applies a single queued mutation against the remote service and reflects
/// the confirmed result locally. Dispatch over (table, action) is exhaustive
/// through the payload union.
pub(crate) async fn apply_item(
    store: &LocalStore,
    remote: &dyn RemoteService,
    item: &SyncQueueItem,
) -> Result<(), ApplyError> {
    let payload = item
        .decode_payload()
        .map_err(|e| ApplyError::Internal(format!("undecodable queue payload: {e}")))?;

    match item.action {
        QueueAction::Delete => {
            remote.delete(item.table, &item.record_id).await?;
            Ok(())
        }
        QueueAction::Create => apply_upsert(store, remote, item, &payload, true).await,
        QueueAction::Update => apply_upsert(store, remote, item, &payload, false).await,
    }
}

async fn apply_upsert(
    store: &LocalStore,
    remote: &dyn RemoteService,
    item: &SyncQueueItem,
    payload: &QueuedPayload,
    is_create: bool,
) -> Result<(), ApplyError> {
    match payload {
        QueuedPayload::WorkOrder(wo) => {
            let wire = to_wire(wo)?;
            let canonical = send_upsert(remote, item, &wire, is_create).await?;
            let merged = merge_canonical(wo, &canonical)?;
            store
                .put_work_order(&merged)
                .await
                .map_err(|e| ApplyError::Internal(e.to_string()))?;
            drop_stale_placeholder(store, item.table, &wo.id, &merged.id).await
        }
        QueuedPayload::ChecklistItem(ci) => {
            let wire = to_wire(ci)?;
            let canonical = send_upsert(remote, item, &wire, is_create).await?;
            let merged = merge_canonical(ci, &canonical)?;
            store
                .put_checklist_item(&merged)
                .await
                .map_err(|e| ApplyError::Internal(e.to_string()))?;
            drop_stale_placeholder(store, item.table, &ci.id, &merged.id).await
        }
        QueuedPayload::Attachment(att) => {
            let mut att = att.clone();
            // Binary upload precedes the metadata record. Upload is
            // overwrite-idempotent, so a metadata failure retries the whole
            // item safely.
            if let Some(blob) = att.local_blob.as_deref() {
                let stored_path = remote.upload_binary(&att.file_path, blob).await?;
                debug!(
                    attachment_id = %att.id,
                    path = %stored_path,
                    "attachment binary uploaded"
                );
                att.file_path = stored_path;
            }
            let wire = to_wire(&att)?;
            let canonical = send_upsert(remote, item, &wire, is_create).await?;
            let mut merged = merge_canonical(&att, &canonical)?;
            // The blob has reached remote storage; no need to keep it locally.
            merged.local_blob = None;
            store
                .put_attachment(&merged)
                .await
                .map_err(|e| ApplyError::Internal(e.to_string()))?;
            drop_stale_placeholder(store, item.table, &att.id, &merged.id).await
        }
        QueuedPayload::Tombstone { id } => Err(ApplyError::Internal(format!(
            "tombstone payload on a {} action for record {id}",
            item.action.as_str()
        ))),
    }
}

/// A create may come back with a server-assigned id; the locally keyed
/// placeholder row is removed once the canonical copy is stored.
async fn drop_stale_placeholder(
    store: &LocalStore,
    kind: EntityKind,
    local_id: &str,
    canonical_id: &str,
) -> Result<(), ApplyError> {
    if local_id != canonical_id {
        store
            .delete_entity_row(kind, local_id)
            .await
            .map_err(|e| ApplyError::Internal(e.to_string()))?;
    }
    Ok(())
}

async fn send_upsert(
    remote: &dyn RemoteService,
    item: &SyncQueueItem,
    wire: &Value,
    is_create: bool,
) -> Result<Value, ApplyError> {
    let canonical = if is_create {
        remote.create(item.table, wire).await?
    } else {
        remote.update(item.table, &item.record_id, wire).await?
    };
    Ok(canonical)
}

/// Domain fields only: engine bookkeeping and locally-held binaries never
/// cross the adapter boundary.
fn to_wire<T: Serialize>(entity: &T) -> Result<Value, ApplyError> {
    let mut value = serde_json::to_value(entity)
        .map_err(|e| ApplyError::Internal(format!("unserializable entity: {e}")))?;
    if let Some(map) = value.as_object_mut() {
        map.remove("sync_state");
        map.remove("last_modified_offline");
        map.remove("offline_changes");
        map.remove("local_blob");
    }
    Ok(value)
}

/// Overlays the server-returned canonical representation onto the local
/// record (server-assigned ids and derived fields win) and marks it synced.
pub(crate) fn merge_canonical<T>(local: &T, canonical: &Value) -> Result<T, ApplyError>
where
    T: Serialize + DeserializeOwned,
{
    let mut base = serde_json::to_value(local)
        .map_err(|e| ApplyError::Internal(format!("unserializable entity: {e}")))?;

    if let (Some(base_map), Some(remote_map)) = (base.as_object_mut(), canonical.as_object()) {
        for (key, value) in remote_map {
            base_map.insert(key.clone(), value.clone());
        }
        base_map.insert("sync_state".to_string(), json!("synced"));
        base_map.insert("offline_changes".to_string(), json!([]));
    }

    serde_json::from_value(base)
        .map_err(|e| ApplyError::Internal(format!("canonical record does not fit the schema: {e}")))
}

/// Builds a synced local entity from a remote canonical record alone, for
/// conflict resolutions where the queued payload cannot seed the merge (a
/// tombstone, or a payload that no longer decodes).
pub(crate) fn entity_from_remote(
    kind: EntityKind,
    remote: &Value,
) -> Result<QueuedPayload, ApplyError> {
    let mut base = remote.clone();
    if let Some(map) = base.as_object_mut() {
        map.insert("sync_state".to_string(), json!("synced"));
        map.insert("offline_changes".to_string(), json!([]));
        map.entry("last_modified_offline")
            .or_insert(json!(chrono::Utc::now().timestamp()));
        if kind == EntityKind::Attachments {
            map.entry("local_blob").or_insert(json!(null));
        }
    }

    let fits = |e: serde_json::Error| {
        ApplyError::Internal(format!("remote record does not fit the schema: {e}"))
    };
    match kind {
        EntityKind::WorkOrders => Ok(QueuedPayload::WorkOrder(
            serde_json::from_value(base).map_err(fits)?,
        )),
        EntityKind::ChecklistItems => Ok(QueuedPayload::ChecklistItem(
            serde_json::from_value(base).map_err(fits)?,
        )),
        EntityKind::Attachments => Ok(QueuedPayload::Attachment(
            serde_json::from_value(base).map_err(fits)?,
        )),
    }
}

pub(crate) fn kind_of(payload: &QueuedPayload) -> Option<EntityKind> {
    match payload {
        QueuedPayload::WorkOrder(_) => Some(EntityKind::WorkOrders),
        QueuedPayload::ChecklistItem(_) => Some(EntityKind::ChecklistItems),
        QueuedPayload::Attachment(_) => Some(EntityKind::Attachments),
        QueuedPayload::Tombstone { .. } => None,
    }
}
