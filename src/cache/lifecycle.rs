//! Worker install/activate handling.
//!
//! Install pre-caches the app shell; activate garbage-collects every cache
//! generation that does not belong to the current version.

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

use super::{CacheGenerations, CacheStorage, Fetcher, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Parsed,
    Installing,
    /// Installed and waiting to take over.
    Installed,
    Activating,
    Activated,
}

/// Out-of-band control messages, e.g. `{"type":"SKIP_WAITING"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SkipWaiting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub cached: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    pub deleted: Vec<String>,
}

pub struct LifecycleController {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    generations: CacheGenerations,
    origin: Url,
    manifest: Vec<String>,
    state: Mutex<WorkerState>,
    skip_waiting: AtomicBool,
    clients_claimed: AtomicBool,
}

impl LifecycleController {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        generations: CacheGenerations,
        origin: Url,
        manifest: Vec<String>,
    ) -> Self {
        Self {
            storage,
            fetcher,
            generations,
            origin,
            manifest,
            state: Mutex::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            clients_claimed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn generations(&self) -> &CacheGenerations {
        &self.generations
    }

    /// Whether the worker asked to replace a waiting one without a reload.
    pub fn is_skip_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::Acquire)
    }

    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::Release);
    }

    /// Whether already-open clients are served, not only new ones.
    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed.load(Ordering::Acquire)
    }

    /// Pre-caches the manifest into the shell generation. Assets that cannot
    /// be fetched are reported, not fatal.
    #[instrument(skip_all, fields(cache = %self.generations.shell))]
    pub async fn install(&self) -> Result<InstallReport> {
        self.set_state(WorkerState::Installing);
        self.storage
            .open(&self.generations.shell)
            .await
            .context("failed to open shell cache")?;

        let fetches = self.manifest.iter().map(|path| async move {
            let outcome = self.precache(path).await;
            (path.clone(), outcome)
        });
        let mut report = InstallReport::default();
        for (path, outcome) in join_all(fetches).await {
            match outcome {
                Ok(()) => report.cached.push(path),
                Err(err) => {
                    warn!(?err, path = %path, "pre-cache failed; continuing install");
                    report.failed.push(path);
                }
            }
        }

        self.set_state(WorkerState::Installed);
        self.skip_waiting();
        info!(
            cached = report.cached.len(),
            failed = report.failed.len(),
            "worker installed"
        );
        Ok(report)
    }

    async fn precache(&self, path: &str) -> Result<()> {
        let url = self
            .origin
            .join(path)
            .with_context(|| format!("invalid asset path {path}"))?;
        let request = Request::get(url);
        let response = self.fetcher.fetch(&request).await?;
        if !response.is_ok() {
            bail!("asset {} answered {}", path, response.status);
        }
        self.storage
            .put(&self.generations.shell, request.cache_key(), &response)
            .await
    }

    /// Deletes stale generations, ensures the live ones exist and claims
    /// open clients. Safe to repeat.
    #[instrument(skip_all)]
    pub async fn activate(&self) -> Result<ActivateReport> {
        match self.state() {
            WorkerState::Installed | WorkerState::Activated => {}
            other => bail!("cannot activate a worker in state {:?}", other),
        }
        self.set_state(WorkerState::Activating);

        let mut report = ActivateReport::default();
        let existing = match self.storage.keys().await {
            Ok(names) => names,
            Err(err) => {
                self.set_state(WorkerState::Installed);
                return Err(err.context("failed to list cache generations"));
            }
        };
        for name in existing {
            if self.generations.contains(&name) {
                continue;
            }
            match self.storage.delete(&name).await {
                Ok(_) => {
                    info!(cache = %name, "deleted stale cache generation");
                    report.deleted.push(name);
                }
                Err(err) => warn!(?err, cache = %name, "failed to delete cache generation"),
            }
        }
        for name in self.generations.names() {
            if let Err(err) = self.storage.open(name).await {
                warn!(?err, cache = name, "failed to open cache generation");
            }
        }

        self.clients_claimed.store(true, Ordering::Release);
        self.set_state(WorkerState::Activated);
        info!(deleted = report.deleted.len(), "worker activated");
        Ok(report)
    }

    /// Handles a control message. `SKIP_WAITING` activates a waiting worker
    /// right away.
    pub async fn handle_message(&self, message: WorkerMessage) -> Result<Option<ActivateReport>> {
        match message {
            WorkerMessage::SkipWaiting => {
                self.skip_waiting();
                if self.state() == WorkerState::Installed {
                    return self.activate().await.map(Some);
                }
                Ok(None)
            }
        }
    }
}
