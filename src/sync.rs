//! Offline write queue draining.
//!
//! The sync manager owns the online/offline state, the periodic timer and the
//! drain of both queues in the local store. A pass drains upload jobs first,
//! then pending actions; a failing item never stops the rest of its phase.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::api::{MemorialApi, PhotoUpload};
use crate::db::LocalStore;
use crate::model::{
    ActionKind, PendingAction, SyncEvent, SyncStatus, UploadJob, UploadPayload, UploadStatus,
};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_UPLOAD_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot sync while offline")]
    Offline,
    #[error("local store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// When an upload stops being retried. Pending actions are never capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_upload_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_upload_attempts: DEFAULT_MAX_UPLOAD_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn upload_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_upload_attempts
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub interval: Duration,
    pub retry: RetryPolicy,
    pub initially_online: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            retry: RetryPolicy::default(),
            initially_online: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    OnlineIdle,
    OnlineSyncing,
}

/// Outcome of one or more coalesced passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub passes: u32,
    pub uploads_synced: u32,
    pub uploads_retrying: u32,
    pub uploads_failed: u32,
    pub actions_synced: u32,
    pub actions_retrying: u32,
}

impl SyncReport {
    fn absorb(&mut self, other: SyncReport) {
        self.passes += other.passes;
        self.uploads_synced += other.uploads_synced;
        self.uploads_retrying += other.uploads_retrying;
        self.uploads_failed += other.uploads_failed;
        self.actions_synced += other.actions_synced;
        self.actions_retrying += other.actions_retrying;
    }
}

/// How a write submitted through the manager was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Sent,
    Queued(Uuid),
}

/// Releases the busy flag even if the pass future is dropped.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PassGuard(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncManager {
    store: Arc<dyn LocalStore>,
    api: Arc<dyn MemorialApi>,
    options: SyncOptions,
    online: AtomicBool,
    in_progress: AtomicBool,
    rerun_requested: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn LocalStore>,
        api: Arc<dyn MemorialApi>,
        options: SyncOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            store,
            api,
            online: AtomicBool::new(options.initially_online),
            options,
            in_progress: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            timer: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SyncState {
        if !self.is_online() {
            SyncState::Offline
        } else if self.in_progress.load(Ordering::Acquire) {
            SyncState::OnlineSyncing
        } else {
            SyncState::OnlineIdle
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Starts the periodic timer when the manager begins online.
    pub fn start(self: &Arc<Self>) {
        if self.is_online() {
            self.start_timer();
        }
    }

    pub fn shutdown(&self) {
        self.stop_timer();
    }

    fn start_timer(self: &Arc<Self>) {
        let Ok(mut slot) = self.timer.lock() else {
            error!("sync timer lock poisoned");
            return;
        };
        if let Some(old) = slot.take() {
            old.abort();
        }
        let weak = Arc::downgrade(self);
        let period = self.options.interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                if !manager.is_online() {
                    continue;
                }
                if let Err(err) = manager.run_pass().await {
                    error!(?err, "periodic sync failed");
                }
            }
        }));
        debug!(interval_secs = period.as_secs(), "sync timer started");
    }

    fn stop_timer(&self) {
        if let Ok(mut slot) = self.timer.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
                debug!("sync timer stopped");
            }
        }
    }

    /// Connectivity restored: restart the timer and drain once.
    pub async fn go_online(self: &Arc<Self>) -> Result<Option<SyncReport>, SyncError> {
        if !self.mark_online() {
            return Ok(None);
        }
        self.run_pass().await
    }

    /// The state half of [`go_online`](Self::go_online), without the drain.
    /// Returns `false` when already online.
    pub fn mark_online(self: &Arc<Self>) -> bool {
        let was_online = self.online.swap(true, Ordering::AcqRel);
        if was_online {
            return false;
        }
        info!("connection restored; syncing");
        self.emit(SyncEvent::BackOnline);
        self.start_timer();
        true
    }

    /// Connectivity lost. An in-flight pass finishes; no new pass starts.
    pub fn go_offline(&self) {
        let was_online = self.online.swap(false, Ordering::AcqRel);
        if !was_online {
            return;
        }
        warn!("connection lost; writes will be queued");
        self.stop_timer();
        self.emit(SyncEvent::WentOffline);
    }

    /// Queues a create for later delivery. Never touches the network.
    pub async fn queue_for_upload(&self, payload: UploadPayload) -> Result<Uuid> {
        self.queue_upload_with_key(payload, Uuid::new_v4()).await
    }

    async fn queue_upload_with_key(&self, payload: UploadPayload, key: Uuid) -> Result<Uuid> {
        let kind = payload.kind();
        let job = self.store.queue_upload(payload, key).await?;
        info!(id = %job.id, kind = kind.as_str(), "upload queued for sync");
        Ok(job.id)
    }

    /// Queues a mutation for later delivery. Never touches the network.
    pub async fn queue_action(&self, kind: ActionKind) -> Result<Uuid> {
        let action = self.store.add_pending_action(kind).await?;
        info!(id = %action.id, kind = action.kind.as_str(), "action queued for sync");
        Ok(action.id)
    }

    /// Sends the create now when online, otherwise (or on failure) queues it.
    /// A queued retry reuses the idempotency key of the direct attempt.
    pub async fn upload_or_queue(&self, payload: UploadPayload) -> Result<Submission> {
        let key = Uuid::new_v4();
        if self.is_online() {
            match self.dispatch_upload(&payload, key).await {
                Ok(()) => return Ok(Submission::Sent),
                Err(err) => warn!(?err, kind = payload.kind().as_str(), "upload failed; queueing"),
            }
        }
        let id = self.queue_upload_with_key(payload, key).await?;
        Ok(Submission::Queued(id))
    }

    /// Sends the mutation now when online, otherwise (or on failure) queues it.
    pub async fn act_or_queue(&self, kind: ActionKind) -> Result<Submission> {
        if self.is_online() {
            match self.dispatch_action(&kind).await {
                Ok(()) => return Ok(Submission::Sent),
                Err(err) => warn!(?err, kind = kind.as_str(), "action failed; queueing"),
            }
        }
        let id = self.queue_action(kind).await?;
        Ok(Submission::Queued(id))
    }

    /// Runs a pass now. `Ok(None)` means one was already running and this
    /// request was folded into it.
    pub async fn force_sync_now(&self) -> Result<Option<SyncReport>, SyncError> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        self.run_pass().await
    }

    /// Side-effect free snapshot for dashboards.
    pub async fn sync_status(&self) -> Result<SyncStatus> {
        let stats = self.store.get_stats().await?;
        Ok(SyncStatus {
            is_online: self.is_online(),
            sync_in_progress: self.in_progress.load(Ordering::Acquire),
            pending_uploads: stats.pending_uploads,
            failed_uploads: stats.failed_uploads,
            pending_actions: stats.pending_actions,
            cached_memorials: stats.cached_memorials,
            cached_photos: stats.cached_photos,
        })
    }

    /// Single-flight entry point for every trigger. A trigger arriving while a
    /// pass runs sets the rerun flag; the running caller then does exactly one
    /// more pass for all of them.
    ///
    /// The flag is written before the trigger re-reads the busy gate, and the
    /// gate is released before the holder re-reads the flag, so at least one
    /// side always sees the other and no trigger goes unserved.
    pub async fn run_pass(&self) -> Result<Option<SyncReport>, SyncError> {
        let mut total: Option<SyncReport> = None;
        loop {
            let Some(guard) = PassGuard::acquire(&self.in_progress) else {
                if total.is_some() {
                    // Another caller took over and serves the rest.
                    return Ok(total);
                }
                self.rerun_requested.store(true, Ordering::SeqCst);
                if self.in_progress.load(Ordering::SeqCst) {
                    debug!("sync already in progress; coalescing");
                    return Ok(None);
                }
                continue;
            };

            let report = total.get_or_insert_with(SyncReport::default);
            loop {
                self.rerun_requested.store(false, Ordering::SeqCst);
                report.absorb(self.sync_pass().await?);
                if !self.rerun_requested.load(Ordering::SeqCst) || !self.is_online() {
                    break;
                }
                debug!("sync requested during pass; running again");
            }
            drop(guard);

            if !self.rerun_requested.load(Ordering::SeqCst) || !self.is_online() {
                return Ok(total);
            }
            debug!("sync requested as the pass ended; running again");
        }
    }

    #[instrument(skip_all)]
    async fn sync_pass(&self) -> Result<SyncReport> {
        let mut report = SyncReport {
            passes: 1,
            ..Default::default()
        };
        self.drain_uploads(&mut report).await?;
        self.drain_actions(&mut report).await?;
        info!(
            uploads_synced = report.uploads_synced,
            uploads_retrying = report.uploads_retrying,
            uploads_failed = report.uploads_failed,
            actions_synced = report.actions_synced,
            actions_retrying = report.actions_retrying,
            "sync pass finished"
        );
        Ok(report)
    }

    #[instrument(skip_all)]
    async fn drain_uploads(&self, report: &mut SyncReport) -> Result<()> {
        let jobs = self.store.get_pending_uploads().await?;
        for job in jobs.into_iter().filter(|j| j.status != UploadStatus::Failed) {
            self.store
                .update_upload_status(job.id, UploadStatus::Uploading, None)
                .await?;
            match self.dispatch_upload(&job.payload, job.idempotency_key).await {
                Ok(()) => {
                    self.store.remove_upload(job.id).await?;
                    report.uploads_synced += 1;
                    info!(id = %job.id, kind = job.payload.kind().as_str(), "upload synced");
                    self.emit(SyncEvent::UploadSynced {
                        id: job.id,
                        kind: job.payload.kind(),
                    });
                }
                Err(err) => self.record_upload_failure(&job, &err, report).await?,
            }
        }
        Ok(())
    }

    async fn record_upload_failure(
        &self,
        job: &UploadJob,
        err: &anyhow::Error,
        report: &mut SyncReport,
    ) -> Result<()> {
        let attempts = self.store.increment_upload_attempts(job.id).await?;
        let message = format!("{err:#}");
        if self.options.retry.upload_exhausted(attempts) {
            self.store
                .update_upload_status(job.id, UploadStatus::Failed, Some(&message))
                .await?;
            report.uploads_failed += 1;
            error!(id = %job.id, attempts, error = %message, "upload failed permanently");
            self.emit(SyncEvent::UploadFailed {
                id: job.id,
                attempts,
            });
        } else {
            self.store
                .update_upload_status(job.id, UploadStatus::Pending, Some(&message))
                .await?;
            report.uploads_retrying += 1;
            warn!(id = %job.id, attempts, error = %message, "upload failed; will retry");
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn drain_actions(&self, report: &mut SyncReport) -> Result<()> {
        let actions = self.store.get_pending_actions().await?;
        for action in actions {
            match self.dispatch_action(&action.kind).await {
                Ok(()) => {
                    self.store.remove_pending_action(action.id).await?;
                    report.actions_synced += 1;
                    info!(id = %action.id, kind = action.kind.as_str(), "action synced");
                    self.emit(SyncEvent::ActionSynced { id: action.id });
                }
                Err(err) => self.record_action_failure(&action, &err, report).await?,
            }
        }
        Ok(())
    }

    async fn record_action_failure(
        &self,
        action: &PendingAction,
        err: &anyhow::Error,
        report: &mut SyncReport,
    ) -> Result<()> {
        let message = format!("{err:#}");
        self.store.record_action_failure(action.id, &message).await?;
        report.actions_retrying += 1;
        warn!(
            id = %action.id,
            kind = action.kind.as_str(),
            attempts = action.attempts + 1,
            error = %message,
            "action failed; will retry"
        );
        Ok(())
    }

    async fn dispatch_upload(&self, payload: &UploadPayload, key: Uuid) -> Result<()> {
        match payload {
            UploadPayload::Photo {
                memorial_id,
                file_name,
                content_type,
                caption,
                bytes,
            } => {
                let photo = PhotoUpload {
                    file_name,
                    content_type,
                    caption: caption.as_deref(),
                    bytes,
                };
                self.api.upload_photo(memorial_id, photo, key).await
            }
            UploadPayload::Memory {
                memorial_id,
                record,
            } => self.api.create_memory(memorial_id, record, key).await,
            UploadPayload::Candle {
                memorial_id,
                record,
            } => self.api.light_candle(memorial_id, record, key).await,
        }
    }

    async fn dispatch_action(&self, kind: &ActionKind) -> Result<()> {
        match kind {
            ActionKind::UpdateMemorial { memorial_id, data } => {
                self.api.update_memorial(memorial_id, data).await
            }
            ActionKind::DeleteMemorial { memorial_id } => {
                self.api.delete_memorial(memorial_id).await
            }
            ActionKind::DeletePhoto {
                memorial_id,
                photo_id,
            } => self.api.delete_photo(memorial_id, photo_id).await,
            ActionKind::DeleteMemory {
                memorial_id,
                memory_id,
            } => self.api.delete_memory(memorial_id, memory_id).await,
        }
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_caps_at_third_attempt() {
        let policy = RetryPolicy::default();
        assert!(!policy.upload_exhausted(1));
        assert!(!policy.upload_exhausted(2));
        assert!(policy.upload_exhausted(3));
    }

    #[test]
    fn report_absorbs_counts() {
        let mut total = SyncReport::default();
        total.absorb(SyncReport {
            passes: 1,
            uploads_synced: 2,
            ..Default::default()
        });
        total.absorb(SyncReport {
            passes: 1,
            actions_retrying: 1,
            ..Default::default()
        });
        assert_eq!(total.passes, 2);
        assert_eq!(total.uploads_synced, 2);
        assert_eq!(total.actions_retrying, 1);
    }

    #[test]
    fn pass_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = PassGuard::acquire(&flag).unwrap();
        assert!(PassGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(PassGuard::acquire(&flag).is_some());
    }
}
