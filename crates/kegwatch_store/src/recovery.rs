//! Startup recovery.
//!
//! Runs once at process start (and after a fatal sync/storage error)
//! before any capture work begins. Controller state is never persisted,
//! so an attempt in flight at crash time is simply gone; everything here
//! is about the durable half: queue tasks and pallet records.

use crate::store::{now_millis, Store, StoreError};
use tracing::{info, warn};

/// Summary of one recovery pass, surfaced to the operator log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    /// Tasks found IN_FLIGHT (claimed, never resolved) returned to PENDING.
    pub reset_in_flight: u64,
    /// Complete-but-unsynced pallets that had lost their queue task.
    pub requeued: u64,
    /// Retired failed tasks dropped past the retention window.
    pub purged_failed: u64,
    /// Non-terminal pallet records available for rehydration.
    pub active_pallets: usize,
}

/// Reconcile queue and pallet state with the last committed snapshot.
pub async fn recover(store: &Store, retention_ms: i64) -> Result<RecoveryReport, StoreError> {
    info!("recovery started");

    let reset_in_flight = store.reset_in_flight().await?;
    if reset_in_flight > 0 {
        warn!(count = reset_in_flight, "unresolved in-flight deliveries re-queued");
    }

    let purged_failed = store
        .purge_failed_before(now_millis() - retention_ms)
        .await?;
    if purged_failed > 0 {
        info!(count = purged_failed, "retired failed deliveries purged");
    }

    // A completed record must always have a live task until it is acked.
    // Losing one (crash between save_record and enqueue) is repaired here;
    // the delivery key is rebuilt from the same (pallet, version) pair so
    // the cloud still de-duplicates.
    let mut requeued = 0u64;
    for (record, version) in store.complete_unsynced().await? {
        let pallet_id = record
            .pallet_id
            .clone()
            .ok_or(StoreError::MissingIdentity)?;
        if store.has_unresolved_task(&pallet_id).await? {
            continue;
        }
        if store.was_synced(&pallet_id).await? {
            // Ack landed but the record snapshot missed it; leave the
            // record for the runtime to finish its Synced transition.
            continue;
        }
        store.enqueue_delivery(&record, version).await?;
        info!(pallet_id = %pallet_id, version, "lost delivery re-enqueued");
        requeued += 1;
    }

    let active_pallets = store.load_active_records().await?.len();

    let report = RecoveryReport {
        reset_in_flight,
        requeued,
        purged_failed,
        active_pallets,
    };
    info!(?report, "recovery complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kegwatch_pallet::{PalletAggregator, PalletRecord};
    use kegwatch_protocol::{
        AggregationPolicy, CaptureId, CaptureMode, CaptureResult, KegCount, PalletMeta,
        QrOutcome, StationId, StrategyKind,
    };

    const WEEK_MS: i64 = 7 * 24 * 60 * 60 * 1000;

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

    fn complete_record(id: &str, counted: u32) -> PalletRecord {
        let mut agg =
            PalletAggregator::new(AggregationPolicy::Sum, PalletMeta::default(), None);
        agg.apply_capture(capture(1, counted, Some(id))).unwrap();
        agg.complete(None).unwrap();
        agg.record().clone()
    }

    async fn store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn crash_mid_delivery_requeues_with_same_key() {
        let store = store().await;
        let record = complete_record("PAL-001", 6);
        let version = store.save_record(&record).await.unwrap();
        store.enqueue_delivery(&record, version).await.unwrap();

        // Claimed but the process died before ack or retry.
        let task = store.claim_due_task().await.unwrap().unwrap();
        let key_before = task.delivery_key.clone();

        let report = recover(&store, WEEK_MS).await.unwrap();
        assert_eq!(report.reset_in_flight, 1);

        // Exactly one task comes back, same identity - no duplicate
        // delivery is manufactured.
        let reclaimed = store.claim_due_task().await.unwrap().unwrap();
        assert_eq!(reclaimed.delivery_key, key_before);
        assert!(store.claim_due_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_record_without_task_is_requeued() {
        let store = store().await;
        let record = complete_record("PAL-002", 8);
        let version = store.save_record(&record).await.unwrap();
        // No enqueue: simulates a crash between save and enqueue.

        let report = recover(&store, WEEK_MS).await.unwrap();
        assert_eq!(report.requeued, 1);

        let task = store.claim_due_task().await.unwrap().unwrap();
        assert_eq!(task.delivery_key.as_str(), format!("PAL-002@{version}"));
    }

    #[tokio::test]
    async fn failed_tasks_are_left_for_the_operator() {
        let store = store().await;
        let record = complete_record("PAL-003", 8);
        let version = store.save_record(&record).await.unwrap();
        store.enqueue_delivery(&record, version).await.unwrap();
        let task = store.claim_due_task().await.unwrap().unwrap();
        store.fail_task(task.id, "budget exhausted").await.unwrap();

        let report = recover(&store, WEEK_MS).await.unwrap();
        // Not re-queued automatically and not purged within retention.
        assert_eq!(report.requeued, 0);
        assert_eq!(report.purged_failed, 0);
        assert_eq!(store.queue_stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn old_failed_tasks_are_purged() {
        let store = store().await;
        let record = complete_record("PAL-004", 8);
        let version = store.save_record(&record).await.unwrap();
        store.enqueue_delivery(&record, version).await.unwrap();
        let task = store.claim_due_task().await.unwrap().unwrap();
        store.fail_task(task.id, "budget exhausted").await.unwrap();

        // Retention of zero: everything failed is past the window. The
        // record itself then has no task and gets a fresh delivery.
        let report = recover(&store, 0).await.unwrap();
        assert_eq!(report.purged_failed, 1);
        assert_eq!(report.requeued, 1);
    }

    #[tokio::test]
    async fn report_counts_active_pallets() {
        let store = store().await;
        let mut agg =
            PalletAggregator::new(AggregationPolicy::Sum, PalletMeta::default(), None);
        agg.apply_capture(capture(1, 4, Some("PAL-005"))).unwrap();
        store.save_record(agg.record()).await.unwrap();

        let report = recover(&store, WEEK_MS).await.unwrap();
        assert_eq!(report.active_pallets, 1);
    }
}
