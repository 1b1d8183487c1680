use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::{Request, Response};

/// Network access for the router. `Err` means the network was unreachable;
/// HTTP error statuses come back as `Ok` responses.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Hop-by-hop headers that must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "host",
    "content-length",
];

fn forwardable(name: &str) -> bool {
    !HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    /// A request still unanswered after `timeout` counts as unreachable, so
    /// the router falls back to its cache.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("memorial-offline/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    pub fn build_request(&self, request: &Request) -> Result<reqwest::Request> {
        let mut builder = self.http.request(request.method.clone(), request.url.clone());
        for (name, value) in request.headers.iter().filter(|(n, _)| forwardable(n)) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let value = HeaderValue::from_str(value).context("invalid header value")?;
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        builder.build().context("failed to build upstream request")
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let outgoing = self.build_request(request)?;
        debug!(method = %request.method, url = %request.url, "fetching from network");
        let res = self
            .http
            .execute(outgoing)
            .await
            .with_context(|| format!("network unreachable for {}", request.url))?;
        let status = res.status().as_u16();
        let headers = res
            .headers()
            .iter()
            .filter(|(name, _)| forwardable(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = res
            .bytes()
            .await
            .with_context(|| format!("connection dropped reading {}", request.url))?;
        Ok(Response::new(status, headers, body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::{Method, Url};

    #[test]
    fn build_request_drops_hop_by_hop_headers() {
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let mut request = Request::new(
            Method::POST,
            Url::parse("http://localhost:3000/api/memorials/m-1/candles").unwrap(),
        );
        request.headers = vec![
            ("Host".into(), "127.0.0.1:8787".into()),
            ("Connection".into(), "keep-alive".into()),
            ("Accept".into(), "application/json".into()),
        ];
        request.body = b"{}".to_vec();
        let built = fetcher.build_request(&request).unwrap();
        assert_eq!(built.method(), Method::POST);
        assert!(built.headers().get("host").is_none());
        assert!(built.headers().get("connection").is_none());
        assert_eq!(
            built.headers().get("accept").and_then(|h| h.to_str().ok()),
            Some("application/json")
        );
        assert_eq!(built.body().and_then(|b| b.as_bytes()), Some(&b"{}"[..]));
    }

    #[test]
    fn build_request_rejects_bad_header() {
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let mut request = Request::get(Url::parse("http://localhost/").unwrap());
        request.headers = vec![("bad header".into(), "x".into())];
        assert!(fetcher.build_request(&request).is_err());
    }
}
