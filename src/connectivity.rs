//! Online/offline detection.
//!
//! The monitor probes the upstream health endpoint and forwards transitions to
//! the [`SyncManager`]. Only a change of reachability is reported; repeated
//! observations of the same state are ignored.

use anyhow::{Context, Result};
use reqwest::{Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

use crate::sync::SyncManager;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConnectivityMonitor {
    http: Client,
    health_url: Url,
    interval: Duration,
}

impl ConnectivityMonitor {
    pub fn new(base_url: &Url, health_path: &str, interval: Duration) -> Result<Self> {
        let health_url = base_url
            .join(health_path.trim_start_matches('/'))
            .with_context(|| format!("invalid health path {health_path}"))?;
        let http = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .no_proxy()
            .build()
            .context("failed to build probe client")?;
        Ok(Self {
            http,
            health_url,
            interval,
        })
    }

    pub fn health_url(&self) -> &Url {
        &self.health_url
    }

    /// Reachable means the health endpoint answered with a 2xx.
    #[instrument(skip_all, fields(url = %self.health_url))]
    pub async fn probe(&self) -> bool {
        match self.http.get(self.health_url.clone()).send().await {
            Ok(res) => {
                let ok = res.status().is_success();
                debug!(status = res.status().as_u16(), ok, "health probe");
                ok
            }
            Err(err) => {
                debug!(?err, "health probe failed");
                false
            }
        }
    }

    pub fn spawn(self, manager: Arc<SyncManager>) -> JoinHandle<()> {
        tokio::spawn(self.run(manager))
    }

    pub async fn run(self, manager: Arc<SyncManager>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reachable = self.probe().await;
            // The reconnect drain runs on its own task so probing continues.
            let _ = observe(&manager, reachable);
        }
    }
}

/// Feeds one reachability observation into the manager. A reconnect flips
/// the state right away and returns the spawned drain.
pub fn observe(manager: &Arc<SyncManager>, reachable: bool) -> Option<JoinHandle<()>> {
    match (reachable, manager.is_online()) {
        (true, false) => {
            if !manager.mark_online() {
                return None;
            }
            let manager = Arc::clone(manager);
            Some(tokio::spawn(async move {
                if let Err(err) = manager.run_pass().await {
                    error!(?err, "sync after reconnect failed");
                }
            }))
        }
        (false, true) => {
            manager.go_offline();
            None
        }
        _ => None,
    }
}
