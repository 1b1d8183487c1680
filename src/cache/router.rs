use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::{CacheGenerations, CacheStorage, Fetcher, Request, Response};
use crate::db::LocalStore;

/// A single memorial read, not one of its sub-resources.
static MEMORIAL_DETAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/api/memorials/([^/]+)/?$").expect("valid route pattern"));

static MEMORIAL_PHOTOS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/api/memorials/([^/]+)/photos/?$").expect("valid route pattern"));

/// Endpoints that create visitor contributions; replaying them from a cache
/// would hide a server-side effect.
static WRITE_ORIENTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/api/memorials/[^/]+/(candles|memories|reactions|comments)(/|$)")
        .expect("valid route pattern")
});

static API_NAMESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/api(/|$)").expect("valid route pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    StaleWhileRevalidate,
    NetworkOnly,
    NetworkFirst,
    CacheFirst,
}

/// Picks the strategy for a request; `None` means the request is not
/// intercepted at all (every non-`GET`).
pub fn classify(request: &Request) -> Option<Strategy> {
    if request.method != Method::GET {
        return None;
    }
    let path = request.path();
    let strategy = if MEMORIAL_DETAIL.is_match(path) {
        Strategy::StaleWhileRevalidate
    } else if WRITE_ORIENTED.is_match(path) {
        Strategy::NetworkOnly
    } else if API_NAMESPACE.is_match(path) {
        Strategy::NetworkFirst
    } else {
        Strategy::CacheFirst
    };
    Some(strategy)
}

fn offline_response(request: &Request) -> Response {
    if request.is_navigation() {
        Response::offline_page()
    } else {
        Response::offline_json()
    }
}

/// Cache write failures (quota, I/O) only cost a future hit.
async fn store(storage: &dyn CacheStorage, cache: &str, key: &str, response: &Response) {
    if !response.is_ok() {
        return;
    }
    if let Err(err) = storage.put(cache, key, response).await {
        warn!(?err, cache, key, "cache write failed");
    }
}

/// Structured copies of memorial and photo reads, kept in the local store.
/// They survive a cache generation being dropped on activation.
#[derive(Debug, Clone, PartialEq)]
enum OfflineCopy {
    Memorial(String),
    Photos(String),
}

impl OfflineCopy {
    fn for_path(path: &str) -> Option<Self> {
        if let Some(caps) = MEMORIAL_DETAIL.captures(path) {
            return Some(OfflineCopy::Memorial(caps[1].to_string()));
        }
        MEMORIAL_PHOTOS
            .captures(path)
            .map(|caps| OfflineCopy::Photos(caps[1].to_string()))
    }

    async fn keep(&self, store: &dyn LocalStore, response: &Response) -> anyhow::Result<()> {
        if !response.is_ok() {
            return Ok(());
        }
        let body: Value = serde_json::from_slice(&response.body)?;
        match self {
            OfflineCopy::Memorial(id) => store.cache_memorial(id, &body).await,
            OfflineCopy::Photos(memorial_id) => {
                for photo in photo_records(&body) {
                    let Some(id) = record_id(photo) else { continue };
                    store.cache_photo(&id, memorial_id, photo).await?;
                }
                Ok(())
            }
        }
    }

    async fn load(&self, store: &dyn LocalStore) -> anyhow::Result<Option<Response>> {
        let body = match self {
            OfflineCopy::Memorial(id) => store.get_cached_memorial(id).await?,
            OfflineCopy::Photos(memorial_id) => {
                let photos = store.get_cached_photos(memorial_id).await?;
                (!photos.is_empty()).then(|| Value::Array(photos))
            }
        };
        Ok(body.map(|body| {
            Response::new(
                200,
                vec![("Content-Type".into(), "application/json".into())],
                body.to_string().into_bytes(),
            )
        }))
    }
}

/// Photo lists come back either bare or wrapped as `{"photos": [...]}`.
fn photo_records(body: &Value) -> &[Value] {
    body.as_array()
        .or_else(|| body.get("photos").and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

async fn keep_offline_copy(store: &dyn LocalStore, request: &Request, response: &Response) {
    let Some(copy) = OfflineCopy::for_path(request.path()) else {
        return;
    };
    if let Err(err) = copy.keep(store, response).await {
        warn!(?err, ?copy, "failed to keep offline copy");
    }
}

#[derive(Clone)]
pub struct RequestRouter {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    generations: CacheGenerations,
    offline_copies: Option<Arc<dyn LocalStore>>,
}

impl RequestRouter {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        generations: CacheGenerations,
    ) -> Self {
        Self {
            storage,
            fetcher,
            generations,
            offline_copies: None,
        }
    }

    /// Also records memorial and photo reads in `store` and answers from
    /// those records when both network and cache miss.
    pub fn with_offline_copies(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.offline_copies = Some(store);
        self
    }

    /// Answers an intercepted request, or returns `None` for requests that
    /// must go to the network untouched.
    #[instrument(skip_all, fields(method = %request.method, path = request.path()))]
    pub async fn handle(&self, request: &Request) -> Option<Response> {
        let strategy = classify(request)?;
        debug!(?strategy, "routing request");
        let response = match strategy {
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
            Strategy::NetworkOnly => self.network_only(request).await,
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::CacheFirst => self.cache_first(request).await,
        };
        Some(response)
    }

    async fn lookup(&self, cache: Option<&str>, key: &str) -> Option<Response> {
        let res = match cache {
            Some(name) => self.storage.match_in(name, key).await,
            None => self.storage.match_any(key).await,
        };
        match res {
            Ok(hit) => hit,
            Err(err) => {
                warn!(?err, key, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Last stop before the generic offline response.
    async fn offline_fallback(&self, request: &Request) -> Response {
        let (Some(store), Some(copy)) = (&self.offline_copies, OfflineCopy::for_path(request.path()))
        else {
            return offline_response(request);
        };
        match copy.load(store.as_ref()).await {
            Ok(Some(response)) => {
                debug!(?copy, "served offline copy");
                response
            }
            Ok(None) => offline_response(request),
            Err(err) => {
                warn!(?err, ?copy, "offline copy unreadable");
                offline_response(request)
            }
        }
    }

    fn spawn_refresh(&self, request: Request) -> JoinHandle<Option<Response>> {
        let storage = Arc::clone(&self.storage);
        let fetcher = Arc::clone(&self.fetcher);
        let copies = self.offline_copies.clone();
        let cache = self.generations.api.clone();
        tokio::spawn(async move {
            match fetcher.fetch(&request).await {
                Ok(response) => {
                    store(storage.as_ref(), &cache, request.cache_key(), &response).await;
                    if let Some(copies) = copies {
                        keep_offline_copy(copies.as_ref(), &request, &response).await;
                    }
                    Some(response)
                }
                Err(err) => {
                    debug!(?err, url = %request.url, "background refresh failed");
                    None
                }
            }
        })
    }

    async fn stale_while_revalidate(&self, request: &Request) -> Response {
        let cached = self
            .lookup(Some(&self.generations.api), request.cache_key())
            .await;
        let refresh = self.spawn_refresh(request.clone());
        if let Some(hit) = cached {
            return hit;
        }
        match refresh.await {
            Ok(Some(response)) => response,
            Ok(None) => self.offline_fallback(request).await,
            Err(err) => {
                warn!(?err, "refresh task failed");
                self.offline_fallback(request).await
            }
        }
    }

    async fn network_only(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(?err, "network-only request failed");
                offline_response(request)
            }
        }
    }

    async fn network_first(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                store(
                    self.storage.as_ref(),
                    &self.generations.api,
                    request.cache_key(),
                    &response,
                )
                .await;
                if let Some(copies) = &self.offline_copies {
                    keep_offline_copy(copies.as_ref(), request, &response).await;
                }
                response
            }
            Err(err) => {
                debug!(?err, "network failed; falling back to cache");
                match self
                    .lookup(Some(&self.generations.api), request.cache_key())
                    .await
                {
                    Some(hit) => hit,
                    None => self.offline_fallback(request).await,
                }
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Response {
        if let Some(hit) = self.lookup(None, request.cache_key()).await {
            return hit;
        }
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                store(
                    self.storage.as_ref(),
                    &self.generations.runtime,
                    request.cache_key(),
                    &response,
                )
                .await;
                response
            }
            Err(err) => {
                debug!(?err, "cache miss and network failed");
                offline_response(request)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    fn get(path: &str) -> Request {
        Request::get(Url::parse("http://localhost:8787").unwrap().join(path).unwrap())
    }

    #[test]
    fn memorial_detail_is_stale_while_revalidate() {
        assert_eq!(
            classify(&get("/api/memorials/abc123")),
            Some(Strategy::StaleWhileRevalidate)
        );
        assert_eq!(
            classify(&get("/api/memorials/abc123/")),
            Some(Strategy::StaleWhileRevalidate)
        );
    }

    #[test]
    fn reaction_paths_are_network_only() {
        assert_eq!(
            classify(&get("/api/memorials/abc123/candles")),
            Some(Strategy::NetworkOnly)
        );
        assert_eq!(
            classify(&get("/api/memorials/abc123/comments/9")),
            Some(Strategy::NetworkOnly)
        );
        assert_eq!(
            classify(&get("/api/memorials/abc123/memories")),
            Some(Strategy::NetworkOnly)
        );
    }

    #[test]
    fn other_api_paths_are_network_first() {
        assert_eq!(classify(&get("/api/memorials")), Some(Strategy::NetworkFirst));
        assert_eq!(
            classify(&get("/api/memorials/abc123/photos")),
            Some(Strategy::NetworkFirst)
        );
        assert_eq!(classify(&get("/api/health")), Some(Strategy::NetworkFirst));
    }

    #[test]
    fn everything_else_is_cache_first() {
        assert_eq!(classify(&get("/")), Some(Strategy::CacheFirst));
        assert_eq!(classify(&get("/icons/icon-192.png")), Some(Strategy::CacheFirst));
        assert_eq!(classify(&get("/apiary")), Some(Strategy::CacheFirst));
        assert_eq!(
            classify(&Request::navigate(
                Url::parse("http://localhost/memorial/abc123").unwrap()
            )),
            Some(Strategy::CacheFirst)
        );
    }

    #[test]
    fn offline_copies_cover_memorials_and_photo_lists() {
        assert_eq!(
            OfflineCopy::for_path("/api/memorials/abc123"),
            Some(OfflineCopy::Memorial("abc123".into()))
        );
        assert_eq!(
            OfflineCopy::for_path("/api/memorials/abc123/photos"),
            Some(OfflineCopy::Photos("abc123".into()))
        );
        assert_eq!(OfflineCopy::for_path("/api/memorials"), None);
        assert_eq!(OfflineCopy::for_path("/api/memorials/abc123/candles"), None);
    }

    #[test]
    fn photo_lists_may_be_wrapped() {
        let bare = serde_json::json!([{ "id": "p1" }, { "id": 2 }, { "url": "x" }]);
        let ids: Vec<_> = photo_records(&bare).iter().filter_map(record_id).collect();
        assert_eq!(ids, vec!["p1".to_string(), "2".to_string()]);

        let wrapped = serde_json::json!({ "photos": [{ "id": "p1" }] });
        assert_eq!(photo_records(&wrapped).len(), 1);
        assert!(photo_records(&serde_json::json!({ "id": "m" })).is_empty());
    }

    #[test]
    fn non_get_is_never_intercepted() {
        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            let mut req = get("/api/memorials/abc123/candles");
            req.method = method.clone();
            assert_eq!(classify(&req), None, "{method} must pass through");
            let mut req = get("/api/memorials/abc123");
            req.method = method;
            assert_eq!(classify(&req), None);
        }
    }
}
