use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use memorial_offline::api::{MemorialApi, PhotoUpload};
use memorial_offline::db::{LocalStore, SqliteStore};
use memorial_offline::model::{ActionKind, SyncEvent, UploadKind, UploadPayload, UploadStatus};
use memorial_offline::sync::{
    RetryPolicy, Submission, SyncError, SyncManager, SyncOptions, SyncState,
};

async fn setup_store() -> Arc<SqliteStore> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

#[derive(Debug, Clone, PartialEq)]
struct Call {
    op: &'static str,
    memorial_id: String,
    detail: Value,
    key: Option<Uuid>,
}

/// Blocks the first API call until released.
#[derive(Default)]
struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[derive(Clone, Default)]
struct RecordingApi {
    responses: Arc<Mutex<VecDeque<Result<()>>>>,
    fallback_fails: bool,
    calls: Arc<Mutex<Vec<Call>>>,
    gate: Arc<Gate>,
}

impl RecordingApi {
    fn with_responses(responses: Vec<Result<()>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    fn always_failing() -> Self {
        Self {
            fallback_fails: true,
            ..Default::default()
        }
    }

    fn gated() -> Self {
        let api = Self::default();
        api.gate.armed.store(true, Ordering::SeqCst);
        api
    }

    async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    async fn record(
        &self,
        op: &'static str,
        memorial_id: &str,
        detail: Value,
        key: Option<Uuid>,
    ) -> Result<()> {
        self.calls.lock().await.push(Call {
            op,
            memorial_id: memorial_id.to_string(),
            detail,
            key,
        });
        if self.gate.armed.swap(false, Ordering::SeqCst) {
            self.gate.entered.notify_one();
            self.gate.release.notified().await;
        }
        let next = self.responses.lock().await.pop_front();
        match next {
            Some(res) => res,
            None if self.fallback_fails => Err(anyhow!("503 Service Unavailable")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MemorialApi for RecordingApi {
    async fn upload_photo(
        &self,
        memorial_id: &str,
        photo: PhotoUpload<'_>,
        idempotency_key: Uuid,
    ) -> Result<()> {
        let detail = json!({ "file": photo.file_name, "size": photo.bytes.len() });
        self.record("upload_photo", memorial_id, detail, Some(idempotency_key))
            .await
    }

    async fn create_memory(&self, memorial_id: &str, record: &Value, key: Uuid) -> Result<()> {
        self.record("create_memory", memorial_id, record.clone(), Some(key))
            .await
    }

    async fn light_candle(&self, memorial_id: &str, record: &Value, key: Uuid) -> Result<()> {
        self.record("light_candle", memorial_id, record.clone(), Some(key))
            .await
    }

    async fn update_memorial(&self, memorial_id: &str, data: &Value) -> Result<()> {
        self.record("update_memorial", memorial_id, data.clone(), None)
            .await
    }

    async fn delete_memorial(&self, memorial_id: &str) -> Result<()> {
        self.record("delete_memorial", memorial_id, Value::Null, None)
            .await
    }

    async fn delete_photo(&self, memorial_id: &str, photo_id: &str) -> Result<()> {
        self.record("delete_photo", memorial_id, json!(photo_id), None)
            .await
    }

    async fn delete_memory(&self, memorial_id: &str, memory_id: &str) -> Result<()> {
        self.record("delete_memory", memorial_id, json!(memory_id), None)
            .await
    }
}

fn candle(n: i64) -> UploadPayload {
    UploadPayload::Candle {
        memorial_id: "m-1".into(),
        record: json!({ "name": format!("visitor {n}") }),
    }
}

fn options(online: bool) -> SyncOptions {
    SyncOptions {
        interval: Duration::from_secs(3600),
        retry: RetryPolicy::default(),
        initially_online: online,
    }
}

fn manager(store: &Arc<SqliteStore>, api: &RecordingApi, online: bool) -> Arc<SyncManager> {
    SyncManager::new(store.clone(), Arc::new(api.clone()), options(online))
}

#[tokio::test]
async fn uploads_drain_in_queue_order_before_actions() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let sync = manager(&store, &api, true);

    sync.queue_action(ActionKind::DeletePhoto {
        memorial_id: "m-1".into(),
        photo_id: "p-9".into(),
    })
    .await
    .unwrap();
    for n in 0..3 {
        sync.queue_for_upload(candle(n)).await.unwrap();
    }
    sync.queue_for_upload(UploadPayload::Memory {
        memorial_id: "m-1".into(),
        record: json!({ "text": "We miss you" }),
    })
    .await
    .unwrap();

    let report = sync.force_sync_now().await.unwrap().unwrap();
    assert_eq!(report.passes, 1);
    assert_eq!(report.uploads_synced, 4);
    assert_eq!(report.actions_synced, 1);

    let ops: Vec<_> = api.calls().await.into_iter().map(|c| (c.op, c.detail)).collect();
    assert_eq!(
        ops,
        vec![
            ("light_candle", json!({ "name": "visitor 0" })),
            ("light_candle", json!({ "name": "visitor 1" })),
            ("light_candle", json!({ "name": "visitor 2" })),
            ("create_memory", json!({ "text": "We miss you" })),
            ("delete_photo", json!("p-9")),
        ]
    );
    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.pending_uploads, 0);
    assert_eq!(stats.pending_actions, 0);
}

#[tokio::test]
async fn failing_item_does_not_block_the_rest() {
    let store = setup_store().await;
    let api = RecordingApi::with_responses(vec![Err(anyhow!("500")), Ok(()), Ok(())]);
    let sync = manager(&store, &api, true);
    let first = sync.queue_for_upload(candle(0)).await.unwrap();
    sync.queue_for_upload(candle(1)).await.unwrap();
    sync.queue_for_upload(candle(2)).await.unwrap();

    let report = sync.force_sync_now().await.unwrap().unwrap();
    assert_eq!(report.uploads_synced, 2);
    assert_eq!(report.uploads_retrying, 1);

    let left = store.get_pending_uploads().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, first);
    assert_eq!(left[0].status, UploadStatus::Pending);
    assert_eq!(left[0].attempts, 1);
    assert_eq!(left[0].last_error.as_deref(), Some("500"));
}

#[tokio::test]
async fn upload_fails_permanently_on_third_attempt() {
    let store = setup_store().await;
    let api = RecordingApi::always_failing();
    let sync = manager(&store, &api, true);
    let mut events = sync.subscribe();
    let id = sync.queue_for_upload(candle(0)).await.unwrap();

    for expected in 1..=2u32 {
        let report = sync.force_sync_now().await.unwrap().unwrap();
        assert_eq!(report.uploads_retrying, 1);
        let jobs = store.get_pending_uploads().await.unwrap();
        assert_eq!(jobs[0].attempts, expected);
        assert_eq!(jobs[0].status, UploadStatus::Pending);
    }
    let report = sync.force_sync_now().await.unwrap().unwrap();
    assert_eq!(report.uploads_failed, 1);

    let failed = store.get_failed_uploads().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].attempts, 3);
    assert_eq!(events.recv().await.unwrap(), SyncEvent::UploadFailed { id, attempts: 3 });

    // Failed jobs are kept but no longer sent.
    sync.force_sync_now().await.unwrap();
    assert_eq!(api.calls().await.len(), 3);
    assert_eq!(store.get_stats().await.unwrap().failed_uploads, 1);
}

#[tokio::test]
async fn retry_cap_is_configurable() {
    let store = setup_store().await;
    let api = RecordingApi::always_failing();
    let mut opts = options(true);
    opts.retry = RetryPolicy {
        max_upload_attempts: 1,
    };
    let sync = SyncManager::new(store.clone(), Arc::new(api.clone()), opts);
    sync.queue_for_upload(candle(0)).await.unwrap();

    let report = sync.force_sync_now().await.unwrap().unwrap();
    assert_eq!(report.uploads_failed, 1);
    assert_eq!(store.get_failed_uploads().await.unwrap().len(), 1);
}

#[tokio::test]
async fn actions_retry_without_cap() {
    let store = setup_store().await;
    let api = RecordingApi::with_responses((0..5).map(|_| Err(anyhow!("502"))).collect());
    let sync = manager(&store, &api, true);
    sync.queue_action(ActionKind::UpdateMemorial {
        memorial_id: "m-1".into(),
        data: json!({ "title": "In loving memory" }),
    })
    .await
    .unwrap();

    for _ in 0..5 {
        let report = sync.force_sync_now().await.unwrap().unwrap();
        assert_eq!(report.actions_retrying, 1);
    }
    let actions = store.get_pending_actions().await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].attempts, 5);
    assert_eq!(actions[0].last_error.as_deref(), Some("502"));

    let report = sync.force_sync_now().await.unwrap().unwrap();
    assert_eq!(report.actions_synced, 1);
    assert!(store.get_pending_actions().await.unwrap().is_empty());
    assert_eq!(api.calls().await.len(), 6);
}

#[tokio::test]
async fn offline_writes_queue_without_network() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let sync = manager(&store, &api, false);
    assert_eq!(sync.state(), SyncState::Offline);

    let photo = UploadPayload::Photo {
        memorial_id: "m-2".into(),
        file_name: "porch.jpg".into(),
        content_type: "image/jpeg".into(),
        caption: None,
        bytes: vec![1, 2, 3],
    };
    assert!(matches!(
        sync.upload_or_queue(photo).await.unwrap(),
        Submission::Queued(_)
    ));
    assert!(matches!(
        sync.act_or_queue(ActionKind::DeleteMemorial {
            memorial_id: "m-3".into()
        })
        .await
        .unwrap(),
        Submission::Queued(_)
    ));
    assert!(matches!(sync.force_sync_now().await, Err(SyncError::Offline)));
    assert!(api.calls().await.is_empty());

    let status = sync.sync_status().await.unwrap();
    assert!(!status.is_online);
    assert!(!status.sync_in_progress);
    assert_eq!(status.pending_uploads, 1);
    assert_eq!(status.pending_actions, 1);
}

#[tokio::test]
async fn going_online_drains_once() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let sync = manager(&store, &api, false);
    let mut events = sync.subscribe();
    sync.queue_for_upload(candle(0)).await.unwrap();

    let report = sync.go_online().await.unwrap().unwrap();
    assert_eq!(report.uploads_synced, 1);
    assert_eq!(events.recv().await.unwrap(), SyncEvent::BackOnline);
    assert!(matches!(
        events.recv().await.unwrap(),
        SyncEvent::UploadSynced {
            kind: UploadKind::Candle,
            ..
        }
    ));

    // Already online: not a transition.
    assert!(sync.go_online().await.unwrap().is_none());
    assert_eq!(api.calls().await.len(), 1);

    sync.go_offline();
    assert_eq!(events.recv().await.unwrap(), SyncEvent::WentOffline);
    assert_eq!(sync.state(), SyncState::Offline);
    sync.shutdown();
}

#[tokio::test]
async fn queued_retry_reuses_idempotency_key() {
    let store = setup_store().await;
    let api = RecordingApi::with_responses(vec![Err(anyhow!("timeout"))]);
    let sync = manager(&store, &api, true);

    let submission = sync
        .upload_or_queue(UploadPayload::Memory {
            memorial_id: "m-1".into(),
            record: json!({ "text": "hello" }),
        })
        .await
        .unwrap();
    assert!(matches!(submission, Submission::Queued(_)));

    sync.force_sync_now().await.unwrap();
    let calls = api.calls().await;
    assert_eq!(calls.len(), 2);
    assert!(calls[0].key.is_some());
    assert_eq!(calls[0].key, calls[1].key);
    assert!(store.get_pending_uploads().await.unwrap().is_empty());
}

#[tokio::test]
async fn direct_submission_when_online() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let sync = manager(&store, &api, true);

    let sent = sync
        .act_or_queue(ActionKind::DeleteMemory {
            memorial_id: "m-1".into(),
            memory_id: "mem-4".into(),
        })
        .await
        .unwrap();
    assert_eq!(sent, Submission::Sent);
    assert_eq!(store.get_stats().await.unwrap().pending_actions, 0);
    assert_eq!(api.calls().await[0].memorial_id, "m-1");
}

#[tokio::test]
async fn overlapping_triggers_coalesce_into_one_extra_pass() {
    let store = setup_store().await;
    let api = RecordingApi::gated();
    let sync = manager(&store, &api, true);
    sync.queue_for_upload(candle(0)).await.unwrap();

    let running = {
        let sync = Arc::clone(&sync);
        tokio::spawn(async move { sync.force_sync_now().await })
    };
    api.gate.entered.notified().await;
    assert_eq!(sync.state(), SyncState::OnlineSyncing);
    assert!(sync.sync_status().await.unwrap().sync_in_progress);

    // Work queued mid-pass plus two more triggers.
    sync.queue_for_upload(candle(1)).await.unwrap();
    assert!(sync.force_sync_now().await.unwrap().is_none());
    assert!(sync.run_pass().await.unwrap().is_none());

    api.gate.release.notify_one();
    let report = running.await.unwrap().unwrap().unwrap();
    assert_eq!(report.passes, 2);
    assert_eq!(report.uploads_synced, 2);

    // Each job went out exactly once.
    assert_eq!(api.calls().await.len(), 2);
    assert_eq!(sync.state(), SyncState::OnlineIdle);
}

#[tokio::test]
async fn periodic_timer_drains_while_online() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let mut opts = options(true);
    opts.interval = Duration::from_millis(50);
    let sync = SyncManager::new(store.clone(), Arc::new(api.clone()), opts);
    sync.start();

    sync.queue_for_upload(candle(0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(api.calls().await.len(), 1);

    sync.go_offline();
    sync.queue_for_upload(candle(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(api.calls().await.len(), 1);
    assert_eq!(store.get_stats().await.unwrap().pending_uploads, 1);
    sync.shutdown();
}

#[tokio::test]
async fn connectivity_observations_drive_transitions() {
    use memorial_offline::connectivity::observe;

    let store = setup_store().await;
    let api = RecordingApi::default();
    let sync = manager(&store, &api, true);

    assert!(observe(&sync, false).is_none());
    assert_eq!(sync.state(), SyncState::Offline);
    sync.queue_for_upload(candle(0)).await.unwrap();
    assert!(observe(&sync, false).is_none());
    assert!(api.calls().await.is_empty());

    let drain = observe(&sync, true).expect("reconnect drains");
    assert!(sync.is_online());
    drain.await.unwrap();
    assert_eq!(sync.state(), SyncState::OnlineIdle);
    assert_eq!(api.calls().await.len(), 1);
    assert_eq!(store.get_stats().await.unwrap().pending_uploads, 0);
    assert!(observe(&sync, true).is_none());
    sync.shutdown();
}

#[tokio::test]
async fn going_offline_is_seen_during_a_reconnect_drain() {
    use memorial_offline::connectivity::observe;

    let store = setup_store().await;
    let api = RecordingApi::gated();
    let sync = manager(&store, &api, false);
    sync.queue_for_upload(candle(0)).await.unwrap();
    sync.queue_for_upload(candle(1)).await.unwrap();

    let drain = observe(&sync, true).expect("reconnect drains");
    api.gate.entered.notified().await;

    // The drain is blocked on its first call; the next probe still lands.
    assert!(observe(&sync, false).is_none());
    assert_eq!(sync.state(), SyncState::Offline);

    api.gate.release.notify_one();
    drain.await.unwrap();
    assert!(!sync.is_online());
    sync.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_trigger_is_served() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let sync = manager(&store, &api, true);

    for round in 0..20 {
        let triggers: Vec<_> = (0..8)
            .map(|n| {
                let sync = Arc::clone(&sync);
                tokio::spawn(async move {
                    sync.queue_for_upload(candle(round * 8 + n)).await.unwrap();
                    sync.force_sync_now().await.unwrap();
                })
            })
            .collect();
        for trigger in triggers {
            trigger.await.unwrap();
        }
        // Each job was queued before its trigger, so none may be left over.
        assert_eq!(store.get_stats().await.unwrap().pending_uploads, 0, "round {round}");
    }
    assert_eq!(api.calls().await.len(), 160);
    assert!(!sync.sync_status().await.unwrap().sync_in_progress);
}
