use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use uuid::Uuid;

use memorial_offline::config;
use memorial_offline::db::{self, LocalStore, SqliteStore};
use memorial_offline::model::UploadJob;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and repair the offline write queues")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Remove a queued upload or action by id
    #[arg(long, value_name = "ID", conflicts_with = "requeue")]
    discard: Option<Uuid>,

    /// Put a failed upload back in the queue with a fresh retry budget
    #[arg(long, value_name = "ID", conflicts_with = "clear_all")]
    requeue: Option<Uuid>,

    /// Wipe both queues and the offline memorial and photo copies (sign-out)
    #[arg(long, conflicts_with = "discard")]
    clear_all: bool,
}

fn print_upload(job: &UploadJob) {
    println!(
        "  {} {:<7} memorial={} status={} attempts={} queued={}{}",
        job.id,
        job.payload.kind().as_str(),
        job.payload.memorial_id(),
        job.status.as_str(),
        job.attempts,
        job.queued_at.to_rfc3339(),
        job.last_error
            .as_deref()
            .map(|e| format!(" error={e}"))
            .unwrap_or_default(),
    );
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool);

    if let Some(id) = args.discard {
        let removed =
            store.remove_upload(id).await? || store.remove_pending_action(id).await?;
        if !removed {
            bail!("no queued upload or action with id {id}");
        }
        println!("discarded {id}");
        return Ok(());
    }
    if let Some(id) = args.requeue {
        if !store.requeue_failed_upload(id).await? {
            bail!("no failed upload with id {id}");
        }
        println!("requeued {id}");
        return Ok(());
    }

    if args.clear_all {
        let stats = store.get_stats().await?;
        store.clear_all().await?;
        println!(
            "cleared {} uploads, {} actions, {} memorials, {} photos",
            stats.pending_uploads + stats.failed_uploads,
            stats.pending_actions,
            stats.cached_memorials,
            stats.cached_photos,
        );
        return Ok(());
    }

    let stats = store.get_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let uploads = store.get_pending_uploads().await?;
    println!("uploads ({}):", uploads.len());
    for job in &uploads {
        print_upload(job);
    }

    let actions = store.get_pending_actions().await?;
    println!("actions ({}):", actions.len());
    for action in &actions {
        println!(
            "  {} {:<15} attempts={} queued={}{}",
            action.id,
            action.kind.as_str(),
            action.attempts,
            action.queued_at.to_rfc3339(),
            action
                .last_error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}
