//! Station runtime.
//!
//! Wires the components into one process: a capture task driving the
//! controller over the frame source, the sync worker draining the
//! durable queue, and between them the [`StationRuntime`], sole owner of
//! the hot pallet record. Operator commands arrive on the HMI channel;
//! station events flow out the other way for the panel and the logging
//! collaborator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kegwatch_capture::{
    CancelToken, CaptureController, CaptureOutcome, FrameSource, SuppressReason,
};
use kegwatch_pallet::{ApplyOutcome, PalletAggregator, PalletRecord};
use kegwatch_protocol::{
    AggregationPolicy, CaptureMode, HmiCommand, PalletState, StationEvent, StationId, SyncStatus,
};
use kegwatch_store::{recover, Store};
use kegwatch_sync::{HttpCloudApi, SyncNotice, SyncWorker};
use kegwatch_vision::{DecoderChain, KegDetector};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::StationConfig;
use crate::drivers::{LabelStripScanner, LumaBlobDetector, SimCamera};

/// Sole mutator of the hot pallet record. Completed records leave the
/// hot slot for the durable queue; the store row stays authoritative
/// until the cloud ack lands and the Synced transition is committed.
pub struct StationRuntime {
    store: Store,
    policy: AggregationPolicy,
    expected_count: Option<u32>,
    active: Option<PalletAggregator>,
    events: mpsc::Sender<StationEvent>,
    triggers: mpsc::Sender<CaptureMode>,
    cancel: CancelToken,
}

impl StationRuntime {
    pub fn new(
        store: Store,
        policy: AggregationPolicy,
        expected_count: Option<u32>,
        events: mpsc::Sender<StationEvent>,
        triggers: mpsc::Sender<CaptureMode>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            store,
            policy,
            expected_count,
            active: None,
            events,
            triggers,
            cancel,
        }
    }

    pub fn active_record(&self) -> Option<&PalletRecord> {
        self.active.as_ref().map(|agg| agg.record())
    }

    /// Highest capture sequence the hot record has absorbed; feeds the
    /// controller's numbering after a restart.
    pub fn sequence_watermark(&self) -> u64 {
        self.active
            .as_ref()
            .map(|agg| agg.last_sequence())
            .unwrap_or(0)
    }

    /// Resume the newest persisted record still accepting operator work.
    /// Controller state is never persisted, so nothing else comes back.
    pub async fn rehydrate(&mut self) -> Result<usize> {
        let records = self.store.load_active_records().await?;
        let count = records.len();
        let mut candidate = None;
        for (record, _version) in records {
            // Ordered oldest-first; the last match is the newest.
            if record.state.accepts_captures() || record.state == PalletState::PendingReview {
                candidate = Some(record);
            }
        }
        if let Some(record) = candidate {
            info!(
                pallet_id = ?record.pallet_id,
                state = %record.state,
                "resuming pallet record"
            );
            self.active = Some(PalletAggregator::resume(record, self.policy));
            self.emit_status().await;
        }
        Ok(count)
    }

    pub async fn handle_outcome(
        &mut self,
        mode: CaptureMode,
        outcome: CaptureOutcome,
    ) -> Result<()> {
        match outcome {
            CaptureOutcome::Accepted(capture) => {
                let agg = self.active.get_or_insert_with(|| {
                    PalletAggregator::new(self.policy, Default::default(), self.expected_count)
                });
                let before = agg.state();
                match agg.apply_capture(capture.clone()) {
                    Ok(ApplyOutcome::Applied { state, .. }) => {
                        self.emit(StationEvent::CaptureAccepted { capture }).await;
                        self.emit_transition(before).await;
                        if state == PalletState::Complete {
                            self.finalize_complete(None).await?;
                        } else {
                            self.persist_active().await?;
                            self.emit_status().await;
                        }
                    }
                    Ok(ApplyOutcome::Conflict { current, decoded }) => {
                        self.emit(StationEvent::ConflictDetected { current, decoded })
                            .await;
                        self.emit_transition(before).await;
                        self.persist_active().await?;
                        self.emit_status().await;
                    }
                    Err(err) => {
                        // Out-of-order or frozen record; the capture is
                        // dropped, the record untouched.
                        warn!(error = %err, "capture not applied");
                    }
                }
            }
            CaptureOutcome::Rejected(reason) => {
                self.emit(StationEvent::CaptureRejected { mode, reason })
                    .await;
            }
            CaptureOutcome::Suppressed(reason) => match reason {
                SuppressReason::Cooldown => debug!("auto capture suppressed by cooldown"),
                SuppressReason::SamePallet => debug!("auto capture suppressed, pallet unchanged"),
            },
        }
        Ok(())
    }

    pub async fn handle_command(&mut self, command: HmiCommand) -> Result<()> {
        match command {
            HmiCommand::TriggerCapture => {
                let _ = self.triggers.send(CaptureMode::Manual).await;
            }
            HmiCommand::CompletePallet => {
                self.finalize_complete(Some("operator".to_string())).await?;
            }
            HmiCommand::AbandonPallet => {
                // Abort whatever the controller is doing, then retire
                // the record.
                self.cancel.cancel();
                if let Some(agg) = self.active.as_mut() {
                    let before = agg.state();
                    match agg.abandon(Some("operator".to_string())) {
                        Ok(()) => {
                            self.emit_transition(before).await;
                            self.persist_active().await?;
                            self.emit_status().await;
                            self.active = None;
                        }
                        Err(err) => warn!(error = %err, "abandon rejected"),
                    }
                }
            }
            HmiCommand::ResolveConflict { resolution } => {
                let Some(agg) = self.active.as_mut() else {
                    warn!("conflict resolution with no active pallet");
                    return Ok(());
                };
                let before = agg.state();
                match agg.resolve_conflict(resolution, Some("operator".to_string())) {
                    Ok(split) => {
                        self.emit_transition(before).await;
                        if self.active.as_ref().map(|a| a.state())
                            == Some(PalletState::Complete)
                        {
                            self.finalize_complete(None).await?;
                        } else {
                            self.persist_active().await?;
                        }
                        if let Some(capture) = split {
                            // The split capture starts the next record.
                            let mut fresh = PalletAggregator::new(
                                self.policy,
                                Default::default(),
                                self.expected_count,
                            );
                            if let Err(err) = fresh.apply_capture(capture) {
                                warn!(error = %err, "split capture could not seed a record");
                            }
                            self.active = Some(fresh);
                            self.persist_active().await?;
                        }
                        self.emit_status().await;
                    }
                    Err(err) => warn!(error = %err, "conflict resolution rejected"),
                }
            }
            HmiCommand::RecordCorrection { correction } => {
                if let Some(agg) = self.active.as_mut() {
                    match agg.apply_correction(correction) {
                        Ok(()) => {
                            self.persist_active().await?;
                            self.emit_status().await;
                        }
                        Err(err) => warn!(error = %err, "correction rejected"),
                    }
                }
            }
            HmiCommand::UpdateMeta { meta } => {
                if let Some(agg) = self.active.as_mut() {
                    match agg.update_meta(meta) {
                        Ok(()) => self.persist_active().await?,
                        Err(err) => warn!(error = %err, "meta update rejected"),
                    }
                }
            }
            HmiCommand::Resync { pallet_id } => {
                if self.store.resync(&pallet_id).await? {
                    info!(%pallet_id, "failed delivery re-armed");
                } else {
                    warn!(%pallet_id, "nothing to resync");
                }
            }
        }
        Ok(())
    }

    pub async fn handle_notice(&mut self, notice: SyncNotice) -> Result<()> {
        match notice {
            SyncNotice::Acked { pallet_id, version } => {
                let Some((record, _)) = self.store.load_record(&pallet_id).await? else {
                    warn!(%pallet_id, "ack for unknown record");
                    return Ok(());
                };
                let mut agg = PalletAggregator::resume(record, self.policy);
                let before = agg.state();
                match agg.mark_synced() {
                    Ok(()) => {
                        self.store.save_record(agg.record()).await?;
                        info!(%pallet_id, version, "pallet synced");
                        self.emit(StationEvent::PalletTransition {
                            pallet_id: Some(pallet_id.clone()),
                            from: before,
                            to: PalletState::Synced,
                        })
                        .await;
                        self.emit(StationEvent::PalletStatus {
                            pallet_id: Some(pallet_id),
                            state: PalletState::Synced,
                            running_total: agg.record().running_total,
                            sync: SyncStatus::Synced,
                        })
                        .await;
                    }
                    Err(err) => warn!(%pallet_id, error = %err, "synced transition rejected"),
                }
            }
            SyncNotice::Failed {
                pallet_id, error, ..
            } => {
                let Some((record, _)) = self.store.load_record(&pallet_id).await? else {
                    warn!(%pallet_id, "failure notice for unknown record");
                    return Ok(());
                };
                let mut agg = PalletAggregator::resume(record, self.policy);
                agg.mark_sync_failed();
                self.store.save_record(agg.record()).await?;
                warn!(%pallet_id, error = %error, "delivery failed, awaiting manual resync");
                self.emit(StationEvent::PalletStatus {
                    pallet_id: Some(pallet_id),
                    state: agg.record().state,
                    running_total: agg.record().running_total,
                    sync: SyncStatus::Failed,
                })
                .await;
            }
        }
        Ok(())
    }

    /// Close the hot record and hand it to the durable queue. The hot
    /// slot empties so the next pallet can start while delivery runs.
    async fn finalize_complete(&mut self, actor: Option<String>) -> Result<()> {
        let Some(agg) = self.active.as_mut() else {
            warn!("complete with no active pallet");
            return Ok(());
        };
        let before = agg.state();
        if before != PalletState::Complete {
            if let Err(err) = agg.complete(actor) {
                warn!(error = %err, "completion rejected");
                return Ok(());
            }
        }
        let record = agg.record().clone();
        if before != PalletState::Complete {
            self.emit_transition(before).await;
        }
        let pallet_id = record
            .pallet_id
            .clone()
            .context("completed record lost its identity")?;
        if self.store.was_synced(&pallet_id).await? {
            warn!(%pallet_id, "pallet id was already synced before, re-delivering");
            self.emit(StationEvent::DuplicatePallet {
                pallet_id: pallet_id.clone(),
            })
            .await;
        }
        let version = self.store.save_record(&record).await?;
        self.store.enqueue_delivery(&record, version).await?;
        self.emit(StationEvent::PalletStatus {
            pallet_id: Some(pallet_id),
            state: PalletState::Complete,
            running_total: record.running_total,
            sync: SyncStatus::Pending,
        })
        .await;
        self.active = None;
        Ok(())
    }

    /// Persist the hot record if it has an identity. Records still Open
    /// without a decoded id have nothing to key on; they live only in
    /// memory until the first successful decode.
    async fn persist_active(&mut self) -> Result<()> {
        if let Some(agg) = self.active.as_ref() {
            if agg.record().pallet_id.is_some() {
                self.store.save_record(agg.record()).await?;
            }
        }
        Ok(())
    }

    async fn emit_transition(&self, before: PalletState) {
        if let Some(agg) = self.active.as_ref() {
            let after = agg.state();
            if after != before {
                self.emit(StationEvent::PalletTransition {
                    pallet_id: agg.record().pallet_id.clone(),
                    from: before,
                    to: after,
                })
                .await;
            }
        }
    }

    async fn emit_status(&self) {
        if let Some(agg) = self.active.as_ref() {
            let record = agg.record();
            self.emit(StationEvent::PalletStatus {
                pallet_id: record.pallet_id.clone(),
                state: record.state,
                running_total: record.running_total,
                sync: record.sync_status,
            })
            .await;
        }
    }

    async fn emit(&self, event: StationEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Capture task: waits for a trigger (manual over the HMI, or the auto
/// cadence), runs exactly one attempt at a time, and reports the
/// outcome. The single task is what keeps one pipeline active per
/// station.
pub async fn capture_loop(
    mut controller: CaptureController,
    mut source: Box<dyn FrameSource>,
    mut triggers: mpsc::Receiver<CaptureMode>,
    outcomes: mpsc::Sender<(CaptureMode, CaptureOutcome)>,
    auto_interval: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mode = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            trigger = triggers.recv() => match trigger {
                Some(mode) => mode,
                None => break,
            },
            _ = auto_tick(auto_interval) => CaptureMode::Auto,
        };

        let result = match mode {
            CaptureMode::Manual => controller.run_capture(source.as_mut(), mode).await,
            CaptureMode::Auto => controller.run_auto(source.as_mut()).await,
        };
        match result {
            Ok(outcome) => {
                if outcomes.send((mode, outcome)).await.is_err() {
                    break;
                }
            }
            Err(err) => error!(error = %err, "frame source failed"),
        }
    }
    info!("capture task stopped");
}

async fn auto_tick(interval: Option<Duration>) {
    match interval {
        Some(interval) => sleep(interval).await,
        None => std::future::pending().await,
    }
}

/// The `run` subcommand: recovery, then the full station loop until
/// Ctrl-C.
pub async fn run_station(config: StationConfig) -> Result<()> {
    let store = Store::open(&config.store.database_path)
        .await
        .with_context(|| {
            format!(
                "Failed to open station database: {}",
                config.store.database_path.display()
            )
        })?;
    store.init().await?;

    let report = recover(&store, config.failed_retention_ms()).await?;
    info!(?report, "startup recovery finished");

    let (events_tx, mut events_rx) = mpsc::channel(256);
    let (notices_tx, mut notices_rx) = mpsc::channel(64);
    let (outcomes_tx, mut outcomes_rx) = mpsc::channel(16);
    let (triggers_tx, triggers_rx) = mpsc::channel(16);
    let (hmi_tx, mut hmi_rx) = mpsc::channel::<HmiCommand>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let detector: Arc<dyn KegDetector> = Arc::new(LumaBlobDetector::new(
        config.detector.blob_luma,
        config.detector.blob_min_area,
    ));
    let decoder = Arc::new(DecoderChain::new(
        Box::new(LabelStripScanner),
        config.decoder_config(),
    ));
    let mut controller = CaptureController::new(
        detector,
        decoder,
        config.detector_config(),
        config.capture_config(),
    );
    let cancel = controller.cancel_token();

    let mut runtime = StationRuntime::new(
        store.clone(),
        config.pallet.aggregation,
        config.pallet.expected_count(),
        events_tx.clone(),
        triggers_tx.clone(),
        cancel,
    );
    runtime.rehydrate().await?;
    controller.resume_sequence(runtime.sequence_watermark());

    let api = HttpCloudApi::new(
        config.cloud.endpoint.clone(),
        Duration::from_secs(config.cloud.timeout_secs),
    )?;
    let worker = SyncWorker::new(
        store.clone(),
        api,
        config.sync_config(),
        events_tx.clone(),
        notices_tx,
    );
    let sync_handle = tokio::spawn(worker.run(shutdown_rx.clone()));

    let camera = SimCamera::new(
        StationId::new(config.camera.source_id.clone()),
        config.camera.width,
        config.camera.height,
        &config.sim.pallets,
    );
    let auto_interval = config.camera.auto_interval_secs.map(Duration::from_secs);
    let capture_handle = tokio::spawn(capture_loop(
        controller,
        Box::new(camera),
        triggers_rx,
        outcomes_tx,
        auto_interval,
        shutdown_rx,
    ));

    // The HMI attaches over this channel pair; keep the sender alive so
    // the loop's recv arm stays pending rather than closing.
    let _hmi_tx = hmi_tx;

    info!(
        station = %config.camera.source_id,
        policy = config.pallet.aggregation.as_str(),
        "station running"
    );
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!(error = %err, "signal handler failed");
                }
                info!("shutdown requested");
                break;
            }
            Some((mode, outcome)) = outcomes_rx.recv() => {
                if let Err(err) = runtime.handle_outcome(mode, outcome).await {
                    error!(error = %err, "capture outcome not applied");
                }
            }
            Some(notice) = notices_rx.recv() => {
                if let Err(err) = runtime.handle_notice(notice).await {
                    error!(error = %err, "sync notice not applied");
                }
            }
            Some(command) = hmi_rx.recv() => {
                if let Err(err) = runtime.handle_command(command).await {
                    error!(error = %err, "operator command failed");
                }
            }
            Some(event) = events_rx.recv() => {
                debug!(?event, "station event");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = capture_handle.await;
    let _ = sync_handle.await;
    info!("station stopped");
    Ok(())
}
