use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    Photo,
    Memory,
    Candle,
}

impl UploadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadKind::Photo => "photo",
            UploadKind::Memory => "memory",
            UploadKind::Candle => "candle",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    /// Terminal: retries exhausted, waits for an operator.
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadStatus::Pending),
            "uploading" => Some(UploadStatus::Uploading),
            "failed" => Some(UploadStatus::Failed),
            _ => None,
        }
    }
}

/// Content of a queued write that creates a new resource under a memorial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadPayload {
    Photo {
        memorial_id: String,
        file_name: String,
        content_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        /// Stored out of line as a BLOB.
        #[serde(skip)]
        bytes: Vec<u8>,
    },
    Memory {
        memorial_id: String,
        record: Value,
    },
    Candle {
        memorial_id: String,
        record: Value,
    },
}

impl UploadPayload {
    pub fn kind(&self) -> UploadKind {
        match self {
            UploadPayload::Photo { .. } => UploadKind::Photo,
            UploadPayload::Memory { .. } => UploadKind::Memory,
            UploadPayload::Candle { .. } => UploadKind::Candle,
        }
    }

    pub fn memorial_id(&self) -> &str {
        match self {
            UploadPayload::Photo { memorial_id, .. }
            | UploadPayload::Memory { memorial_id, .. }
            | UploadPayload::Candle { memorial_id, .. } => memorial_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadJob {
    pub id: Uuid,
    pub payload: UploadPayload,
    pub status: UploadStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Forwarded to the API so a replayed create is recognised server-side.
    pub idempotency_key: Uuid,
    pub queued_at: DateTime<Utc>,
}

/// A queued mutation against an existing resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    UpdateMemorial { memorial_id: String, data: Value },
    DeleteMemorial { memorial_id: String },
    DeletePhoto { memorial_id: String, photo_id: String },
    DeleteMemory { memorial_id: String, memory_id: String },
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::UpdateMemorial { .. } => "update_memorial",
            ActionKind::DeleteMemorial { .. } => "delete_memorial",
            ActionKind::DeletePhoto { .. } => "delete_photo",
            ActionKind::DeleteMemory { .. } => "delete_memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingAction {
    pub id: Uuid,
    pub kind: ActionKind,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub queued_at: DateTime<Utc>,
}

/// Aggregate counts kept by the local store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub pending_uploads: i64,
    pub failed_uploads: i64,
    pub pending_actions: i64,
    pub cached_memorials: i64,
    pub cached_photos: i64,
}

/// Point-in-time view of the sync manager, for dashboards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub sync_in_progress: bool,
    pub pending_uploads: i64,
    pub failed_uploads: i64,
    pub pending_actions: i64,
    pub cached_memorials: i64,
    pub cached_photos: i64,
}

/// Notices surfaced to the user while syncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    WentOffline,
    BackOnline,
    UploadSynced { id: Uuid, kind: UploadKind },
    UploadFailed { id: Uuid, attempts: u32 },
    ActionSynced { id: Uuid },
}
