use crate::model::{ActionKind, PendingAction, StoreStats, UploadJob, UploadPayload, UploadStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use super::Pool;

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.get(column);
    Uuid::parse_str(&raw).with_context(|| format!("invalid uuid in column {column}: {raw}"))
}

fn upload_from_row(row: &SqliteRow) -> Result<UploadJob> {
    let payload_json: String = row.get("payload");
    let mut payload: UploadPayload =
        serde_json::from_str(&payload_json).context("invalid upload payload JSON")?;
    if let UploadPayload::Photo { bytes, .. } = &mut payload {
        *bytes = row.get::<Option<Vec<u8>>, _>("content").unwrap_or_default();
    }
    let status: String = row.get("status");
    let status = UploadStatus::parse(&status).ok_or_else(|| anyhow!("unknown upload status {status}"))?;
    let attempts: i64 = row.get("attempts");
    Ok(UploadJob {
        id: parse_uuid(row, "id")?,
        payload,
        status,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.get("last_error"),
        idempotency_key: parse_uuid(row, "idempotency_key")?,
        queued_at: row.get::<DateTime<Utc>, _>("queued_at"),
    })
}

fn action_from_row(row: &SqliteRow) -> Result<PendingAction> {
    let payload_json: String = row.get("payload");
    let kind: ActionKind =
        serde_json::from_str(&payload_json).context("invalid pending action JSON")?;
    let attempts: i64 = row.get("attempts");
    Ok(PendingAction {
        id: parse_uuid(row, "id")?,
        kind,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.get("last_error"),
        queued_at: row.get::<DateTime<Utc>, _>("queued_at"),
    })
}

const UPLOAD_COLUMNS: &str =
    "id, payload, content, status, attempts, last_error, idempotency_key, queued_at";

#[instrument(skip_all)]
pub async fn insert_upload(
    pool: &Pool,
    payload: &UploadPayload,
    idempotency_key: Uuid,
) -> Result<UploadJob> {
    let id = Uuid::new_v4();
    let queued_at = Utc::now();
    let content = match payload {
        UploadPayload::Photo { bytes, .. } => Some(bytes.as_slice()),
        _ => None,
    };
    sqlx::query(
        "INSERT INTO upload_jobs (id, kind, memorial_id, payload, content, status, attempts, idempotency_key, queued_at) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(id.to_string())
    .bind(payload.kind().as_str())
    .bind(payload.memorial_id())
    .bind(serde_json::to_string(payload)?)
    .bind(content)
    .bind(UploadStatus::Pending.as_str())
    .bind(idempotency_key.to_string())
    .bind(queued_at)
    .execute(pool)
    .await?;
    Ok(UploadJob {
        id,
        payload: payload.clone(),
        status: UploadStatus::Pending,
        attempts: 0,
        last_error: None,
        idempotency_key,
        queued_at,
    })
}

/// All upload jobs in insertion order, whatever their status.
#[instrument(skip_all)]
pub async fn list_uploads(pool: &Pool) -> Result<Vec<UploadJob>> {
    let rows = sqlx::query(&format!("SELECT {UPLOAD_COLUMNS} FROM upload_jobs ORDER BY seq ASC"))
        .fetch_all(pool)
        .await?;
    rows.iter().map(upload_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_failed_uploads(pool: &Pool) -> Result<Vec<UploadJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {UPLOAD_COLUMNS} FROM upload_jobs WHERE status = ? ORDER BY seq ASC"
    ))
    .bind(UploadStatus::Failed.as_str())
    .fetch_all(pool)
    .await?;
    rows.iter().map(upload_from_row).collect()
}

/// Sets the status; a `Some` error replaces `last_error`, `None` keeps it.
#[instrument(skip_all)]
pub async fn set_upload_status(
    pool: &Pool,
    id: Uuid,
    status: UploadStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE upload_jobs SET status = ?, last_error = COALESCE(?, last_error) WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn increment_upload_attempts(pool: &Pool, id: Uuid) -> Result<u32> {
    let attempts: i64 = sqlx::query_scalar(
        "UPDATE upload_jobs SET attempts = attempts + 1 WHERE id = ? RETURNING attempts",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| anyhow!("upload job {id} not found"))?;
    Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
}

/// Operator retry: puts a failed job back in the queue with a fresh budget.
#[instrument(skip_all)]
pub async fn requeue_failed_upload(pool: &Pool, id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE upload_jobs SET status = ?, attempts = 0 WHERE id = ? AND status = ?",
    )
    .bind(UploadStatus::Pending.as_str())
    .bind(id.to_string())
    .bind(UploadStatus::Failed.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn delete_upload(pool: &Pool, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM upload_jobs WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn insert_action(pool: &Pool, kind: &ActionKind) -> Result<PendingAction> {
    let id = Uuid::new_v4();
    let queued_at = Utc::now();
    sqlx::query(
        "INSERT INTO pending_actions (id, kind, payload, attempts, queued_at) VALUES (?, ?, ?, 0, ?)",
    )
    .bind(id.to_string())
    .bind(kind.as_str())
    .bind(serde_json::to_string(kind)?)
    .bind(queued_at)
    .execute(pool)
    .await?;
    Ok(PendingAction {
        id,
        kind: kind.clone(),
        attempts: 0,
        last_error: None,
        queued_at,
    })
}

#[instrument(skip_all)]
pub async fn list_actions(pool: &Pool) -> Result<Vec<PendingAction>> {
    let rows = sqlx::query(
        "SELECT id, payload, attempts, last_error, queued_at FROM pending_actions ORDER BY seq ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(action_from_row).collect()
}

#[instrument(skip_all)]
pub async fn record_action_failure(pool: &Pool, id: Uuid, error: &str) -> Result<()> {
    sqlx::query("UPDATE pending_actions SET attempts = attempts + 1, last_error = ? WHERE id = ?")
        .bind(error)
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_action(pool: &Pool, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM pending_actions WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn upsert_cached_memorial(pool: &Pool, id: &str, record: &Value) -> Result<()> {
    sqlx::query(
        "INSERT INTO cached_memorials (id, record, cached_at) VALUES (?, ?, ?) ON CONFLICT(id) DO UPDATE SET record = excluded.record, cached_at = excluded.cached_at",
    )
    .bind(id)
    .bind(record.to_string())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn cached_memorial(pool: &Pool, id: &str) -> Result<Option<Value>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT record FROM cached_memorials WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    raw.map(|r| serde_json::from_str(&r).context("invalid cached memorial JSON"))
        .transpose()
}

#[instrument(skip_all)]
pub async fn upsert_cached_photo(
    pool: &Pool,
    id: &str,
    memorial_id: &str,
    record: &Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO cached_photos (id, memorial_id, record, cached_at) VALUES (?, ?, ?, ?) ON CONFLICT(id) DO UPDATE SET memorial_id = excluded.memorial_id, record = excluded.record, cached_at = excluded.cached_at",
    )
    .bind(id)
    .bind(memorial_id)
    .bind(record.to_string())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn cached_photos_for(pool: &Pool, memorial_id: &str) -> Result<Vec<Value>> {
    let raws: Vec<String> =
        sqlx::query_scalar("SELECT record FROM cached_photos WHERE memorial_id = ? ORDER BY id")
            .bind(memorial_id)
            .fetch_all(pool)
            .await?;
    raws.iter()
        .map(|r| serde_json::from_str(r).context("invalid cached photo JSON"))
        .collect()
}

#[instrument(skip_all)]
pub async fn store_stats(pool: &Pool) -> Result<StoreStats> {
    let row = sqlx::query(
        "SELECT \
            (SELECT COUNT(*) FROM upload_jobs WHERE status != 'failed') AS pending_uploads, \
            (SELECT COUNT(*) FROM upload_jobs WHERE status = 'failed') AS failed_uploads, \
            (SELECT COUNT(*) FROM pending_actions) AS pending_actions, \
            (SELECT COUNT(*) FROM cached_memorials) AS cached_memorials, \
            (SELECT COUNT(*) FROM cached_photos) AS cached_photos",
    )
    .fetch_one(pool)
    .await?;
    Ok(StoreStats {
        pending_uploads: row.get("pending_uploads"),
        failed_uploads: row.get("failed_uploads"),
        pending_actions: row.get("pending_actions"),
        cached_memorials: row.get("cached_memorials"),
        cached_photos: row.get("cached_photos"),
    })
}

#[instrument(skip_all)]
pub async fn clear_all(pool: &Pool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in ["upload_jobs", "pending_actions", "cached_memorials", "cached_photos"] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}
