//! Local HTTP front for the web client.
//!
//! Every request that is not a control route goes through the
//! [`RequestRouter`]; requests it declines (all non-`GET`) are forwarded to
//! the upstream unchanged.
//!
//! Writes the page wants delivered even while offline are handed to the
//! [`SyncManager`] through `/_worker/queue/*`: sent now when possible,
//! queued otherwise.

use anyhow::{Context, Result};
use axum::body::{to_bytes, Body};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, Request as HttpRequest, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::cache::{
    Fetcher, LifecycleController, Request, RequestMode, RequestRouter, Response, WorkerMessage,
};
use crate::model::{ActionKind, UploadPayload};
use crate::sync::{Submission, SyncError, SyncManager};

/// Large enough for a photo upload passing through.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    pub upstream: Url,
    pub router: Arc<RequestRouter>,
    pub fetcher: Arc<dyn Fetcher>,
    pub lifecycle: Arc<LifecycleController>,
    pub sync: Arc<SyncManager>,
}

pub fn app(state: ProxyState) -> Router {
    Router::new()
        .route("/_worker/message", post(worker_message))
        .route("/_worker/status", get(worker_status))
        .route("/_worker/sync", post(worker_sync))
        .route("/_worker/queue/upload", post(queue_upload))
        .route(
            "/_worker/queue/photo/{memorial_id}",
            post(queue_photo).layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .route("/_worker/queue/action", post(queue_action))
        .fallback(intercept)
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, state: ProxyState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no address")?;
    info!(%addr, upstream = %state.upstream, "offline proxy listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("proxy server error")
}

async fn worker_message(
    State(state): State<ProxyState>,
    Json(message): Json<WorkerMessage>,
) -> HttpResponse {
    match state.lifecycle.handle_message(message).await {
        Ok(activated) => Json(json!({
            "state": state.lifecycle.state(),
            "activated": activated.is_some(),
        }))
        .into_response(),
        Err(err) => {
            error!(?err, "worker message failed");
            (StatusCode::CONFLICT, format!("{err:#}")).into_response()
        }
    }
}

async fn worker_status(State(state): State<ProxyState>) -> HttpResponse {
    match state.sync.sync_status().await {
        Ok(status) => Json(json!({
            "worker": state.lifecycle.state(),
            "sync": status,
        }))
        .into_response(),
        Err(err) => {
            error!(?err, "failed to read sync status");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn worker_sync(State(state): State<ProxyState>) -> HttpResponse {
    match state.sync.force_sync_now().await {
        Ok(Some(report)) => Json(json!({
            "ran": true,
            "passes": report.passes,
            "uploadsSynced": report.uploads_synced,
            "uploadsFailed": report.uploads_failed,
            "actionsSynced": report.actions_synced,
        }))
        .into_response(),
        Ok(None) => Json(json!({ "ran": false })).into_response(),
        Err(SyncError::Offline) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "offline", "offline": true })),
        )
            .into_response(),
        Err(err) => {
            error!(?err, "manual sync failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn submission_response(result: Result<Submission>) -> HttpResponse {
    match result {
        Ok(Submission::Sent) => Json(json!({ "queued": false })).into_response(),
        Ok(Submission::Queued(id)) => (
            StatusCode::ACCEPTED,
            Json(json!({ "queued": true, "id": id })),
        )
            .into_response(),
        Err(err) => {
            error!(?err, "failed to hand write to sync manager");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("{err:#}") })),
            )
                .into_response()
        }
    }
}

/// Memory and candle creates as JSON. Photos carry raw bytes and use
/// `/_worker/queue/photo/{memorial_id}`.
async fn queue_upload(
    State(state): State<ProxyState>,
    Json(payload): Json<UploadPayload>,
) -> HttpResponse {
    if matches!(payload, UploadPayload::Photo { .. }) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            "photos are posted to /_worker/queue/photo/{memorial_id}",
        )
            .into_response();
    }
    submission_response(state.sync.upload_or_queue(payload).await)
}

#[derive(Debug, Deserialize)]
struct PhotoParams {
    file_name: String,
    #[serde(default)]
    caption: Option<String>,
}

async fn queue_photo(
    State(state): State<ProxyState>,
    Path(memorial_id): Path<String>,
    Query(params): Query<PhotoParams>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty photo body").into_response();
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let payload = UploadPayload::Photo {
        memorial_id,
        file_name: params.file_name,
        content_type,
        caption: params.caption,
        bytes: body.to_vec(),
    };
    submission_response(state.sync.upload_or_queue(payload).await)
}

async fn queue_action(
    State(state): State<ProxyState>,
    Json(kind): Json<ActionKind>,
) -> HttpResponse {
    submission_response(state.sync.act_or_queue(kind).await)
}

async fn intercept(State(state): State<ProxyState>, req: HttpRequest) -> HttpResponse {
    let request = match to_request(&state.upstream, req).await {
        Ok(request) => request,
        Err(err) => {
            warn!(?err, "rejecting malformed request");
            return (StatusCode::BAD_REQUEST, format!("{err:#}")).into_response();
        }
    };
    if let Some(response) = state.router.handle(&request).await {
        return into_http_response(response);
    }
    debug!(method = %request.method, url = %request.url, "passing through");
    match state.fetcher.fetch(&request).await {
        Ok(response) => into_http_response(response),
        Err(err) => {
            warn!(?err, method = %request.method, url = %request.url, "upstream unreachable");
            (StatusCode::BAD_GATEWAY, "upstream unreachable").into_response()
        }
    }
}

/// Rebases an incoming request onto the upstream origin.
pub async fn to_request(upstream: &Url, req: HttpRequest) -> Result<Request> {
    let (parts, body) = req.into_parts();
    let method = Method::from_bytes(parts.method.as_str().as_bytes())
        .with_context(|| format!("unsupported method {}", parts.method))?;
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = upstream
        .join(path)
        .with_context(|| format!("invalid request path {path}"))?;
    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .context("failed to read request body")?;

    let mut request = Request::new(method, url);
    if request.method == Method::GET && is_navigation(&headers) {
        request.mode = RequestMode::Navigate;
    }
    request.headers = headers;
    request.body = body.to_vec();
    Ok(request)
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_navigation(headers: &[(String, String)]) -> bool {
    if let Some(mode) = header_value(headers, "sec-fetch-mode") {
        return mode.eq_ignore_ascii_case("navigate");
    }
    header_value(headers, header::ACCEPT.as_str()).is_some_and(|accept| accept.contains("text/html"))
}

pub fn into_http_response(response: Response) -> HttpResponse {
    let mut builder = axum::http::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    match builder.body(Body::from(response.body)) {
        Ok(res) => res,
        Err(err) => {
            error!(?err, "invalid response from cache or upstream");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
