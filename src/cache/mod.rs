//! Request interception and response caching.
//!
//! Every intercepted `GET` goes through exactly one strategy in [`router`];
//! entries live in three versioned cache generations managed by
//! [`lifecycle`].

use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub mod fetch;
pub mod lifecycle;
pub mod router;
pub mod storage;

pub use fetch::{Fetcher, HttpFetcher};
pub use lifecycle::{
    ActivateReport, InstallReport, LifecycleController, WorkerMessage, WorkerState,
};
pub use router::{RequestRouter, Strategy};
pub use storage::{CacheStorage, SqliteCacheStorage};

/// The live cache names for one deployed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGenerations {
    /// Pre-cached app shell.
    pub shell: String,
    /// Static assets fetched at runtime.
    pub runtime: String,
    /// API responses.
    pub api: String,
}

impl CacheGenerations {
    pub fn for_version(version: &str) -> Self {
        Self {
            shell: format!("memorial-static-{version}"),
            runtime: format!("memorial-runtime-{version}"),
            api: format!("memorial-api-{version}"),
        }
    }

    pub fn names(&self) -> [&str; 3] {
        [&self.shell, &self.runtime, &self.api]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().contains(&name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    #[default]
    Other,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub mode: RequestMode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            mode: RequestMode::Other,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Entries are keyed by the exact request URL, query included.
    pub fn cache_key(&self) -> &str {
        self.url.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// 2xx, the only responses worth storing.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Last resort for non-navigation requests.
    pub fn offline_json() -> Self {
        let body = json!({
            "error": "Offline - data not available",
            "offline": true,
        });
        Self::new(
            503,
            vec![("Content-Type".into(), "application/json".into())],
            body.to_string().into_bytes(),
        )
    }

    /// Last resort for navigations: a page with no external dependencies.
    pub fn offline_page() -> Self {
        Self::new(
            200,
            vec![("Content-Type".into(), "text/html; charset=utf-8".into())],
            OFFLINE_PAGE.as_bytes().to_vec(),
        )
    }
}

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Offline</title>
  <style>
    body { font-family: Georgia, serif; background: #f7f4ef; color: #3b3a36;
           display: flex; align-items: center; justify-content: center;
           min-height: 100vh; margin: 0; text-align: center; }
    main { max-width: 28rem; padding: 2rem; }
    h1 { font-weight: normal; }
    button { margin-top: 1.5rem; padding: .6rem 1.4rem; border: 1px solid #3b3a36;
             background: transparent; border-radius: 4px; cursor: pointer; }
  </style>
</head>
<body>
  <main>
    <h1>You are offline</h1>
    <p>This page is not available without a connection. Anything you add
       while offline is saved on this device and will sync when you are back
       online.</p>
    <button onclick="location.reload()">Try again</button>
  </main>
</body>
</html>
"#;
