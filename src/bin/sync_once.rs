use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use memorial_offline::api::ApiClient;
use memorial_offline::config;
use memorial_offline::connectivity::ConnectivityMonitor;
use memorial_offline::db::{self, SqliteStore};
use memorial_offline::sync::{SyncError, SyncManager};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Drain the offline queues once and print the resulting status"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Skip the health probe and assume the upstream is reachable
    #[arg(long)]
    skip_probe: bool,
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
    let online = if args.skip_probe {
        true
    } else {
        let monitor =
            ConnectivityMonitor::new(&upstream, &cfg.api.health_path, cfg.probe_interval())?;
        monitor.probe().await
    };

    let mut options = cfg.sync_options();
    options.initially_online = online;
    let store = Arc::new(SqliteStore::new(pool));
    let api = Arc::new(ApiClient::new(upstream, cfg.request_timeout())?);
    let sync = SyncManager::new(store, api, options);

    match sync.force_sync_now().await {
        Ok(Some(report)) => info!(
            uploads_synced = report.uploads_synced,
            uploads_retrying = report.uploads_retrying,
            uploads_failed = report.uploads_failed,
            actions_synced = report.actions_synced,
            actions_retrying = report.actions_retrying,
            "sync finished"
        ),
        Ok(None) => info!("another pass was already running"),
        Err(SyncError::Offline) => warn!("upstream unreachable; nothing sent"),
        Err(err) => return Err(err.into()),
    }

    let status = sync.sync_status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
