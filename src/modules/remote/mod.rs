use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::modules::store::EntityKind;

/// How the remote persistence API answered a call, as far as the sync engine
/// cares: not-found is an idempotent success for updates and deletes, a
/// conflict parks the record for explicit resolution, and everything else
/// (network failure, timeout, server error) is retryable.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("record not found")]
    NotFound,

    #[error("remote version conflict")]
    Conflict {
        /// The diverged remote record, when the service returns it.
        remote: Option<Value>,
    },

    #[error("remote call failed: {0}")]
    Failure(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Thin typed client over the remote persistence API. The engine never
/// mutates remote state except through this port, and only reflects the
/// effect locally once a result is known. Request/response serialization is
/// the implementor's business.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Creates a record and returns the server-canonical representation
    /// (server-assigned ids and derived fields included).
    async fn create(&self, kind: EntityKind, payload: &Value) -> RemoteResult<Value>;

    /// Updates a record by id and returns the canonical representation.
    async fn update(&self, kind: EntityKind, id: &str, payload: &Value) -> RemoteResult<Value>;

    async fn delete(&self, kind: EntityKind, id: &str) -> RemoteResult<()>;

    /// Uploads attachment bytes and returns the stored path. Upload is
    /// overwrite-idempotent: re-sending the same path is safe.
    async fn upload_binary(&self, path: &str, bytes: &[u8]) -> RemoteResult<String>;
}
