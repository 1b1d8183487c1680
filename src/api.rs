use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Upper bound on one API call, connect through body.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Photo content as sent to the upload endpoint.
#[derive(Debug, Clone, Copy)]
pub struct PhotoUpload<'a> {
    pub file_name: &'a str,
    pub content_type: &'a str,
    pub caption: Option<&'a str>,
    pub bytes: &'a [u8],
}

/// Write endpoints of the memorial API used by queued work.
#[async_trait]
pub trait MemorialApi: Send + Sync {
    async fn upload_photo(
        &self,
        memorial_id: &str,
        photo: PhotoUpload<'_>,
        idempotency_key: Uuid,
    ) -> Result<()>;

    async fn create_memory(&self, memorial_id: &str, record: &Value, idempotency_key: Uuid)
        -> Result<()>;

    async fn light_candle(&self, memorial_id: &str, record: &Value, idempotency_key: Uuid)
        -> Result<()>;

    async fn update_memorial(&self, memorial_id: &str, data: &Value) -> Result<()>;

    async fn delete_memorial(&self, memorial_id: &str) -> Result<()>;

    async fn delete_photo(&self, memorial_id: &str, photo_id: &str) -> Result<()>;

    async fn delete_memory(&self, memorial_id: &str, memory_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("memorial-offline/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/api/memorials/{memorial_id}/{rest...}` with each segment escaped.
    pub fn memorial_endpoint(&self, memorial_id: &str, rest: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("API base URL cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(["api", "memorials", memorial_id])
            .extend(rest);
        Ok(url)
    }

    pub fn build_json_request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        idempotency_key: Option<Uuid>,
    ) -> Result<reqwest::Request> {
        let mut builder = self.http.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(key) = idempotency_key {
            builder = builder.header(IDEMPOTENCY_HEADER, key.to_string());
        }
        builder.build().context("failed to build API request")
    }

    pub fn build_photo_request(
        &self,
        memorial_id: &str,
        photo: PhotoUpload<'_>,
        idempotency_key: Uuid,
    ) -> Result<reqwest::Request> {
        let url = self.memorial_endpoint(memorial_id, &["photos"])?;
        let part = Part::bytes(photo.bytes.to_vec())
            .file_name(photo.file_name.to_string())
            .mime_str(photo.content_type)
            .context("invalid photo content type")?;
        let mut form = Form::new().part("photo", part);
        if let Some(caption) = photo.caption.filter(|c| !c.is_empty()) {
            form = form.text("caption", caption.to_string());
        }
        self.http
            .post(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .multipart(form)
            .build()
            .context("failed to build photo upload request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<()> {
        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, %url, "sending API request");
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach API for {method} {url}"))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("API error {} for {} {}: {}", status, method, url, body));
        }
        Ok(())
    }
}

#[async_trait]
impl MemorialApi for ApiClient {
    async fn upload_photo(
        &self,
        memorial_id: &str,
        photo: PhotoUpload<'_>,
        idempotency_key: Uuid,
    ) -> Result<()> {
        let request = self.build_photo_request(memorial_id, photo, idempotency_key)?;
        self.execute(request).await
    }

    async fn create_memory(
        &self,
        memorial_id: &str,
        record: &Value,
        idempotency_key: Uuid,
    ) -> Result<()> {
        let url = self.memorial_endpoint(memorial_id, &["memories"])?;
        let request =
            self.build_json_request(Method::POST, url, Some(record), Some(idempotency_key))?;
        self.execute(request).await
    }

    async fn light_candle(
        &self,
        memorial_id: &str,
        record: &Value,
        idempotency_key: Uuid,
    ) -> Result<()> {
        let url = self.memorial_endpoint(memorial_id, &["candles"])?;
        let request =
            self.build_json_request(Method::POST, url, Some(record), Some(idempotency_key))?;
        self.execute(request).await
    }

    async fn update_memorial(&self, memorial_id: &str, data: &Value) -> Result<()> {
        let url = self.memorial_endpoint(memorial_id, &[])?;
        let request = self.build_json_request(Method::PATCH, url, Some(data), None)?;
        self.execute(request).await
    }

    async fn delete_memorial(&self, memorial_id: &str) -> Result<()> {
        let url = self.memorial_endpoint(memorial_id, &[])?;
        let request = self.build_json_request(Method::DELETE, url, None, None)?;
        self.execute(request).await
    }

    async fn delete_photo(&self, memorial_id: &str, photo_id: &str) -> Result<()> {
        let url = self.memorial_endpoint(memorial_id, &["photos", photo_id])?;
        let request = self.build_json_request(Method::DELETE, url, None, None)?;
        self.execute(request).await
    }

    async fn delete_memory(&self, memorial_id: &str, memory_id: &str) -> Result<()> {
        let url = self.memorial_endpoint(memorial_id, &["memories", memory_id])?;
        let request = self.build_json_request(Method::DELETE, url, None, None)?;
        self.execute(request).await
    }
}
