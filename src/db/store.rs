use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{repo, Pool};
use crate::model::{ActionKind, PendingAction, StoreStats, UploadJob, UploadPayload, UploadStatus};

/// Durable queues consumed by the sync manager.
///
/// Every mutation is committed before the call returns, so a process killed
/// between two calls loses at most the in-flight network result, never a
/// queued item.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// All upload jobs, any status, in queue order.
    async fn get_pending_uploads(&self) -> Result<Vec<UploadJob>>;

    async fn get_failed_uploads(&self) -> Result<Vec<UploadJob>>;

    /// Inserts a new `pending` job and returns it with its assigned id.
    async fn queue_upload(&self, payload: UploadPayload, idempotency_key: Uuid)
        -> Result<UploadJob>;

    async fn update_upload_status(
        &self,
        id: Uuid,
        status: UploadStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Bumps the attempt counter and returns the new value.
    async fn increment_upload_attempts(&self, id: Uuid) -> Result<u32>;

    async fn remove_upload(&self, id: Uuid) -> Result<bool>;

    /// Returns a `failed` job to `pending` with its attempts reset.
    async fn requeue_failed_upload(&self, id: Uuid) -> Result<bool>;

    async fn get_pending_actions(&self) -> Result<Vec<PendingAction>>;

    async fn add_pending_action(&self, kind: ActionKind) -> Result<PendingAction>;

    async fn record_action_failure(&self, id: Uuid, error: &str) -> Result<()>;

    async fn remove_pending_action(&self, id: Uuid) -> Result<bool>;

    async fn cache_memorial(&self, id: &str, record: &Value) -> Result<()>;

    async fn get_cached_memorial(&self, id: &str) -> Result<Option<Value>>;

    async fn cache_photo(&self, id: &str, memorial_id: &str, record: &Value) -> Result<()>;

    async fn get_cached_photos(&self, memorial_id: &str) -> Result<Vec<Value>>;

    async fn clear_all(&self) -> Result<()>;

    async fn get_stats(&self) -> Result<StoreStats>;
}

/// `LocalStore` backed by the SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get_pending_uploads(&self) -> Result<Vec<UploadJob>> {
        repo::list_uploads(&self.pool).await
    }

    async fn get_failed_uploads(&self) -> Result<Vec<UploadJob>> {
        repo::list_failed_uploads(&self.pool).await
    }

    async fn queue_upload(
        &self,
        payload: UploadPayload,
        idempotency_key: Uuid,
    ) -> Result<UploadJob> {
        repo::insert_upload(&self.pool, &payload, idempotency_key).await
    }

    async fn update_upload_status(
        &self,
        id: Uuid,
        status: UploadStatus,
        error: Option<&str>,
    ) -> Result<()> {
        repo::set_upload_status(&self.pool, id, status, error).await
    }

    async fn increment_upload_attempts(&self, id: Uuid) -> Result<u32> {
        repo::increment_upload_attempts(&self.pool, id).await
    }

    async fn remove_upload(&self, id: Uuid) -> Result<bool> {
        repo::delete_upload(&self.pool, id).await
    }

    async fn requeue_failed_upload(&self, id: Uuid) -> Result<bool> {
        repo::requeue_failed_upload(&self.pool, id).await
    }

    async fn get_pending_actions(&self) -> Result<Vec<PendingAction>> {
        repo::list_actions(&self.pool).await
    }

    async fn add_pending_action(&self, kind: ActionKind) -> Result<PendingAction> {
        repo::insert_action(&self.pool, &kind).await
    }

    async fn record_action_failure(&self, id: Uuid, error: &str) -> Result<()> {
        repo::record_action_failure(&self.pool, id, error).await
    }

    async fn remove_pending_action(&self, id: Uuid) -> Result<bool> {
        repo::delete_action(&self.pool, id).await
    }

    async fn cache_memorial(&self, id: &str, record: &Value) -> Result<()> {
        repo::upsert_cached_memorial(&self.pool, id, record).await
    }

    async fn get_cached_memorial(&self, id: &str) -> Result<Option<Value>> {
        repo::cached_memorial(&self.pool, id).await
    }

    async fn cache_photo(&self, id: &str, memorial_id: &str, record: &Value) -> Result<()> {
        repo::upsert_cached_photo(&self.pool, id, memorial_id, record).await
    }

    async fn get_cached_photos(&self, memorial_id: &str) -> Result<Vec<Value>> {
        repo::cached_photos_for(&self.pool, memorial_id).await
    }

    async fn clear_all(&self) -> Result<()> {
        repo::clear_all(&self.pool).await
    }

    async fn get_stats(&self) -> Result<StoreStats> {
        repo::store_stats(&self.pool).await
    }
}
