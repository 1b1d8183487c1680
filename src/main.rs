use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use memorial_offline::api::ApiClient;
use memorial_offline::cache::{
    CacheStorage, Fetcher, HttpFetcher, LifecycleController, RequestRouter, SqliteCacheStorage,
};
use memorial_offline::config;
use memorial_offline::connectivity::ConnectivityMonitor;
use memorial_offline::db::{self, LocalStore, SqliteStore};
use memorial_offline::model::SyncEvent;
use memorial_offline::proxy::{self, ProxyState};
use memorial_offline::sync::SyncManager;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let upstream = Url::parse(&cfg.api.base_url).context("invalid api.base_url")?;
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::new(pool.clone()));
    let api = Arc::new(ApiClient::new(upstream.clone(), cfg.request_timeout())?);
    let sync = SyncManager::new(Arc::clone(&store), api, cfg.sync_options());
    sync.start();
    spawn_event_log(&sync);

    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteCacheStorage::new(pool));
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(cfg.request_timeout())?);
    let generations = cfg.generations();
    let lifecycle = Arc::new(LifecycleController::new(
        Arc::clone(&storage),
        Arc::clone(&fetcher),
        generations.clone(),
        upstream.clone(),
        cfg.cache.precache.clone(),
    ));
    // A fresh process has no older worker to wait for.
    let installed = lifecycle.install().await?;
    if !installed.failed.is_empty() {
        warn!(failed = ?installed.failed, "some shell assets were not pre-cached");
    }
    lifecycle.activate().await?;

    let monitor = ConnectivityMonitor::new(&upstream, &cfg.api.health_path, cfg.probe_interval())?;
    let probe = monitor.spawn(Arc::clone(&sync));

    let router = Arc::new(
        RequestRouter::new(storage, Arc::clone(&fetcher), generations).with_offline_copies(store),
    );
    let state = ProxyState {
        upstream,
        router,
        fetcher,
        lifecycle,
        sync: Arc::clone(&sync),
    };
    let listener = tokio::net::TcpListener::bind(&cfg.app.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.listen))?;

    info!("starting offline proxy");
    proxy::serve(listener, state, shutdown_signal()).await?;

    probe.abort();
    sync.shutdown();
    info!("stopped");
    Ok(())
}

/// User-visible notices go to the log.
fn spawn_event_log(sync: &Arc<SyncManager>) {
    let mut events = sync.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::WentOffline) => warn!("you are offline; changes will sync later"),
                Ok(SyncEvent::BackOnline) => info!("back online; syncing"),
                Ok(SyncEvent::UploadSynced { id, kind }) => {
                    info!(%id, kind = kind.as_str(), "offline change synced")
                }
                Ok(SyncEvent::UploadFailed { id, attempts }) => {
                    error!(%id, attempts, "upload gave up; see queue_inspect")
                }
                Ok(SyncEvent::ActionSynced { id }) => info!(%id, "offline change synced"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "sync notices dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
