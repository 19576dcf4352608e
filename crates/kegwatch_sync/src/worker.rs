//! Background flush worker.

use std::time::Duration;

use kegwatch_protocol::{PalletId, StationEvent};
use kegwatch_store::{now_millis, Store, StoreError, SyncTask};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::client::CloudApi;

/// Worker tuning. The backoff schedule is explicit; the last entry
/// repeats if attempts outnumber entries.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub backoff: Vec<Duration>,
    /// Total delivery attempts before a task is parked FAILED.
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            backoff: vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(240),
                Duration::from_secs(480),
                Duration::from_secs(960),
            ],
            max_attempts: 6,
        }
    }
}

/// Delivery resolution pushed back to the runtime, which owns the
/// pallet record transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    Acked {
        pallet_id: PalletId,
        version: i64,
    },
    Failed {
        pallet_id: PalletId,
        version: i64,
        error: String,
    },
}

/// Consumes the durable queue and talks to the cloud. Runs detached from
/// the capture pipeline; cloud latency never blocks detection.
pub struct SyncWorker<C> {
    store: Store,
    api: C,
    config: SyncConfig,
    events: mpsc::Sender<StationEvent>,
    notices: mpsc::Sender<SyncNotice>,
    online: bool,
}

impl<C: CloudApi> SyncWorker<C> {
    pub fn new(
        store: Store,
        api: C,
        config: SyncConfig,
        events: mpsc::Sender<StationEvent>,
        notices: mpsc::Sender<SyncNotice>,
    ) -> Self {
        Self {
            store,
            api,
            config,
            events,
            notices,
            online: true,
        }
    }

    /// Flush loop. Exits when the shutdown flag flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("sync worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = match self.flush_once().await {
                Ok(processed) => processed,
                Err(err) => {
                    // Storage trouble must not take the process down;
                    // capture and aggregation keep running.
                    error!(error = %err, "sync flush failed");
                    false
                }
            };
            if processed {
                continue;
            }
            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("sync worker stopped");
    }

    /// Deliver at most one due task. Returns whether one was processed.
    pub async fn flush_once(&mut self) -> Result<bool, StoreError> {
        if !self.online {
            if !self.api.probe().await {
                return Ok(false);
            }
            self.set_online(true).await;
        }

        let Some(task) = self.store.claim_due_task().await? else {
            return Ok(false);
        };
        let attempt = task.attempts + 1;

        self.emit(StationEvent::SyncAttempt {
            pallet_id: task.pallet_id.clone(),
            version: task.version,
            attempt,
        })
        .await;

        match self
            .api
            .post_record(&task.payload_json, &task.delivery_key)
            .await
        {
            Ok(()) => {
                self.store.ack_task(task.id).await?;
                self.set_online(true).await;
                info!(key = %task.delivery_key, attempt, "delivery acked");
                self.emit(StationEvent::SyncOutcome {
                    pallet_id: task.pallet_id.clone(),
                    version: task.version,
                    ok: true,
                    detail: None,
                })
                .await;
                self.notify(SyncNotice::Acked {
                    pallet_id: task.pallet_id,
                    version: task.version,
                })
                .await;
            }
            Err(err) => {
                if err.is_network() {
                    self.set_online(false).await;
                }
                if err.is_transient() && attempt < self.config.max_attempts {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        key = %task.delivery_key,
                        attempt,
                        retry_in_secs = delay.as_secs(),
                        error = %err,
                        "delivery failed, retry scheduled"
                    );
                    self.store
                        .retry_task(
                            task.id,
                            attempt,
                            now_millis() + delay.as_millis() as i64,
                            &err.to_string(),
                        )
                        .await?;
                    self.emit(StationEvent::SyncOutcome {
                        pallet_id: task.pallet_id.clone(),
                        version: task.version,
                        ok: false,
                        detail: Some(err.to_string()),
                    })
                    .await;
                } else {
                    self.park_failed(task, &err.to_string()).await?;
                }
            }
        }
        Ok(true)
    }

    async fn park_failed(&mut self, task: SyncTask, error: &str) -> Result<(), StoreError> {
        error!(key = %task.delivery_key, error, "delivery abandoned, manual resync required");
        self.store.fail_task(task.id, error).await?;
        self.emit(StationEvent::SyncOutcome {
            pallet_id: task.pallet_id.clone(),
            version: task.version,
            ok: false,
            detail: Some(error.to_string()),
        })
        .await;
        self.notify(SyncNotice::Failed {
            pallet_id: task.pallet_id,
            version: task.version,
            error: error.to_string(),
        })
        .await;
        Ok(())
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.config.backoff.is_empty() {
            return Duration::from_secs(60);
        }
        let index = (attempt as usize - 1).min(self.config.backoff.len() - 1);
        self.config.backoff[index]
    }

    async fn set_online(&mut self, online: bool) {
        if self.online != online {
            self.online = online;
            if online {
                info!("network online");
            } else {
                warn!("network offline");
            }
            self.emit(StationEvent::NetworkChanged { online }).await;
        }
    }

    async fn emit(&self, event: StationEvent) {
        let _ = self.events.send(event).await;
    }

    async fn notify(&self, notice: SyncNotice) {
        let _ = self.notices.send(notice).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kegwatch_pallet::{PalletAggregator, PalletRecord};
    use kegwatch_protocol::{
        AggregationPolicy, CaptureId, CaptureMode, CaptureResult, DeliveryKey, KegCount,
        PalletMeta, QrOutcome, StationId, StrategyKind, TaskStatus,
    };
    use crate::client::SyncError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    struct ScriptedApi {
        responses: Mutex<VecDeque<Result<(), SyncError>>>,
        posts: Arc<AtomicU32>,
        reachable: Arc<AtomicBool>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<(), SyncError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                posts: Arc::new(AtomicU32::new(0)),
                reachable: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    impl CloudApi for ScriptedApi {
        async fn post_record(
            &self,
            _payload_json: &str,
            _delivery_key: &DeliveryKey,
        ) -> Result<(), SyncError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn probe(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }
    }

    fn http(status: u16) -> SyncError {
        SyncError::Http {
            status,
            detail: String::new(),
        }
    }

    fn capture(sequence: u64, counted: u32, payload: Option<&str>) -> CaptureResult {
        let qr = match payload {
            Some(p) => QrOutcome::Decoded {
                payload: p.to_string(),
                method: StrategyKind::Direct,
                quality: 0.9,
                latency_ms: 10,
            },
            None => QrOutcome::Undecodable { strategies_tried: 4 },
        };
        CaptureResult {
            id: CaptureId::new(),
            sequence,
            station: StationId::new("icam-540"),
            frame_timestamp: Utc::now(),
            mode: CaptureMode::Manual,
            keg_count: KegCount {
                counted,
                raw: counted,
            },
            qr,
            accepted_at: Utc::now(),
        }
    }

    fn complete_record(id: &str) -> PalletRecord {
        let mut agg =
            PalletAggregator::new(AggregationPolicy::Sum, PalletMeta::default(), None);
        agg.apply_capture(capture(1, 6, Some(id))).unwrap();
        agg.complete(None).unwrap();
        agg.record().clone()
    }

    async fn store_with_task(id: &str) -> (Store, PalletId) {
        let store = Store::open_in_memory().await.unwrap();
        store.init().await.unwrap();
        let record = complete_record(id);
        let version = store.save_record(&record).await.unwrap();
        store.enqueue_delivery(&record, version).await.unwrap();
        (store, record.pallet_id.unwrap())
    }

    fn worker(
        store: Store,
        api: ScriptedApi,
        config: SyncConfig,
    ) -> (
        SyncWorker<ScriptedApi>,
        mpsc::Receiver<StationEvent>,
        mpsc::Receiver<SyncNotice>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (notices_tx, notices_rx) = mpsc::channel(64);
        (
            SyncWorker::new(store, api, config, events_tx, notices_tx),
            events_rx,
            notices_rx,
        )
    }

    fn zero_backoff(max_attempts: u32) -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_millis(1),
            backoff: vec![Duration::ZERO],
            max_attempts,
        }
    }

    #[tokio::test]
    async fn three_transient_failures_then_ack_on_attempt_four() {
        let (store, pallet_id) = store_with_task("PAL-001").await;
        let api = ScriptedApi::new(vec![Err(http(503)), Err(http(503)), Err(http(503)), Ok(())]);
        let posts = Arc::clone(&api.posts);
        let (mut worker, _events, mut notices) = worker(store.clone(), api, zero_backoff(6));

        for _ in 0..4 {
            assert!(worker.flush_once().await.unwrap());
        }
        assert_eq!(posts.load(Ordering::SeqCst), 4);

        let notice = notices.recv().await.unwrap();
        assert_eq!(
            notice,
            SyncNotice::Acked {
                pallet_id: pallet_id.clone(),
                version: 1
            }
        );
        assert_eq!(
            store.task_status(&pallet_id).await.unwrap(),
            Some(TaskStatus::Acked)
        );
        // Queue is drained.
        assert!(!worker.flush_once().await.unwrap());
    }

    #[tokio::test]
    async fn permanent_failure_parks_immediately() {
        let (store, pallet_id) = store_with_task("PAL-002").await;
        let api = ScriptedApi::new(vec![Err(http(400))]);
        let (mut worker, _events, mut notices) = worker(store.clone(), api, zero_backoff(6));

        assert!(worker.flush_once().await.unwrap());
        match notices.recv().await.unwrap() {
            SyncNotice::Failed { pallet_id: id, .. } => assert_eq!(id, pallet_id),
            other => panic!("expected failure notice, got {other:?}"),
        }
        assert_eq!(
            store.task_status(&pallet_id).await.unwrap(),
            Some(TaskStatus::Failed)
        );
    }

    #[tokio::test]
    async fn exhausted_budget_parks_the_task() {
        let (store, pallet_id) = store_with_task("PAL-003").await;
        let api = ScriptedApi::new(vec![Err(http(503)), Err(http(503))]);
        let (mut worker, _events, mut notices) = worker(store.clone(), api, zero_backoff(2));

        assert!(worker.flush_once().await.unwrap());
        assert!(worker.flush_once().await.unwrap());

        match notices.recv().await.unwrap() {
            SyncNotice::Failed { error, .. } => assert!(error.contains("503")),
            other => panic!("expected failure notice, got {other:?}"),
        }
        assert_eq!(
            store.task_status(&pallet_id).await.unwrap(),
            Some(TaskStatus::Failed)
        );
    }

    #[tokio::test]
    async fn offline_worker_probes_instead_of_burning_attempts() {
        let (store, pallet_id) = store_with_task("PAL-004").await;
        let api = ScriptedApi::new(vec![
            Err(SyncError::Network("connection refused".into())),
            Ok(()),
        ]);
        let posts = Arc::clone(&api.posts);
        let reachable = Arc::clone(&api.reachable);
        let (mut worker, mut events, _notices) = worker(store.clone(), api, zero_backoff(6));

        // Attempt 1 hits a dead network: worker goes offline.
        assert!(worker.flush_once().await.unwrap());
        reachable.store(false, Ordering::SeqCst);

        // While unreachable, no POST is attempted.
        assert!(!worker.flush_once().await.unwrap());
        assert!(!worker.flush_once().await.unwrap());
        assert_eq!(posts.load(Ordering::SeqCst), 1);

        // Back online: the probe passes and delivery resumes.
        reachable.store(true, Ordering::SeqCst);
        assert!(worker.flush_once().await.unwrap());
        assert_eq!(posts.load(Ordering::SeqCst), 2);
        assert_eq!(
            store.task_status(&pallet_id).await.unwrap(),
            Some(TaskStatus::Acked)
        );

        // Offline and online transitions were both surfaced.
        let mut saw_offline = false;
        let mut saw_online = false;
        while let Ok(event) = events.try_recv() {
            if let StationEvent::NetworkChanged { online } = event {
                if online {
                    saw_online = true;
                } else {
                    saw_offline = true;
                }
            }
        }
        assert!(saw_offline && saw_online);
    }

    #[tokio::test]
    async fn attempt_numbers_are_reported_in_events() {
        let (store, _pallet_id) = store_with_task("PAL-005").await;
        let api = ScriptedApi::new(vec![Err(http(503)), Ok(())]);
        let (mut worker, mut events, _notices) = worker(store, api, zero_backoff(6));

        worker.flush_once().await.unwrap();
        worker.flush_once().await.unwrap();

        let mut attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let StationEvent::SyncAttempt { attempt, .. } = event {
                attempts.push(attempt);
            }
        }
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn backoff_schedule_clamps_to_last_entry() {
        let (store, _) = store_with_task("PAL-006").await;
        let api = ScriptedApi::new(vec![]);
        let config = SyncConfig {
            poll_interval: Duration::from_millis(1),
            backoff: vec![Duration::from_secs(60), Duration::from_secs(120)],
            max_attempts: 10,
        };
        let (worker, _events, _notices) = worker(store, api, config);
        assert_eq!(worker.backoff_delay(1), Duration::from_secs(60));
        assert_eq!(worker.backoff_delay(2), Duration::from_secs(120));
        assert_eq!(worker.backoff_delay(7), Duration::from_secs(120));
    }
}
