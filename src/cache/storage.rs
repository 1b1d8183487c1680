use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use tracing::instrument;

use super::Response;
use crate::db::Pool;

/// Named, versioned response caches shared by all strategies.
///
/// Writes to one key are last-write-wins; entries are derived data.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Creates the generation if missing.
    async fn open(&self, name: &str) -> Result<()>;

    /// Names of every existing generation.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Drops the generation and all its entries. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    async fn match_in(&self, name: &str, key: &str) -> Result<Option<Response>>;

    /// Looks the key up across all generations, newest entry first.
    async fn match_any(&self, key: &str) -> Result<Option<Response>>;

    /// Stores under `name`, opening the generation if needed.
    async fn put(&self, name: &str, key: &str, response: &Response) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteCacheStorage {
    pool: Pool,
}

impl SqliteCacheStorage {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn response_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Response> {
    let status: i64 = row.get("status");
    let headers: String = row.get("headers");
    Ok(Response {
        status: u16::try_from(status).context("stored status out of range")?,
        headers: serde_json::from_str(&headers).context("invalid stored headers")?,
        body: row.get("body"),
    })
}

#[async_trait]
impl CacheStorage for SqliteCacheStorage {
    #[instrument(skip_all)]
    async fn open(&self, name: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO cache_generations (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn keys(&self) -> Result<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM cache_generations ORDER BY created_at, name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    #[instrument(skip_all)]
    async fn delete(&self, name: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cache_entries WHERE cache_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let res = sqlx::query("DELETE FROM cache_generations WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }

    #[instrument(skip_all)]
    async fn match_in(&self, name: &str, key: &str) -> Result<Option<Response>> {
        let row = sqlx::query(
            "SELECT status, headers, body FROM cache_entries WHERE cache_name = ? AND request_key = ?",
        )
        .bind(name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(response_from_row).transpose()
    }

    #[instrument(skip_all)]
    async fn match_any(&self, key: &str) -> Result<Option<Response>> {
        let row = sqlx::query(
            "SELECT status, headers, body FROM cache_entries WHERE request_key = ? ORDER BY stored_at DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(response_from_row).transpose()
    }

    #[instrument(skip_all)]
    async fn put(&self, name: &str, key: &str, response: &Response) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO cache_generations (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO cache_entries (cache_name, request_key, status, headers, body, stored_at) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(cache_name, request_key) DO UPDATE SET status = excluded.status, headers = excluded.headers, body = excluded.body, stored_at = excluded.stored_at",
        )
        .bind(name)
        .bind(key)
        .bind(i64::from(response.status))
        .bind(serde_json::to_string(&response.headers)?)
        .bind(response.body.as_slice())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn storage() -> SqliteCacheStorage {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteCacheStorage::new(pool)
    }

    fn body(text: &str) -> Response {
        Response::new(200, vec![("Content-Type".into(), "text/plain".into())], text.into())
    }

    #[tokio::test]
    async fn put_then_match() {
        let storage = storage().await;
        storage.put("api-v1", "http://x/a", &body("one")).await.unwrap();
        let hit = storage.match_in("api-v1", "http://x/a").await.unwrap().unwrap();
        assert_eq!(hit.body, b"one");
        assert_eq!(hit.header("content-type"), Some("text/plain"));
        assert!(storage.match_in("runtime-v1", "http://x/a").await.unwrap().is_none());
        assert_eq!(storage.keys().await.unwrap(), vec!["api-v1".to_string()]);
    }

    #[tokio::test]
    async fn put_overwrites_same_key() {
        let storage = storage().await;
        storage.put("api-v1", "http://x/a", &body("old")).await.unwrap();
        storage.put("api-v1", "http://x/a", &body("new")).await.unwrap();
        let hit = storage.match_any("http://x/a").await.unwrap().unwrap();
        assert_eq!(hit.body, b"new");
    }

    #[tokio::test]
    async fn delete_drops_entries() {
        let storage = storage().await;
        storage.open("static-v1").await.unwrap();
        storage.put("static-v0", "http://x/", &body("old shell")).await.unwrap();
        assert!(storage.delete("static-v0").await.unwrap());
        assert!(!storage.delete("static-v0").await.unwrap());
        assert!(storage.match_any("http://x/").await.unwrap().is_none());
        assert_eq!(storage.keys().await.unwrap(), vec!["static-v1".to_string()]);
    }
}
