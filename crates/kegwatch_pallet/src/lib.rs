//! Pallet aggregation.
//!
//! The aggregator is the sole mutator of a hot pallet record. Accepted
//! captures arrive in sequence order and are folded into the record
//! according to the configured aggregation policy; identity conflicts park
//! the record for operator review instead of reassigning; corrections are
//! audit events, never count rewrites.

use chrono::{DateTime, Utc};
use kegwatch_protocol::{
    AggregationPolicy, CaptureResult, CaptureSummary, CloudPayload, Correction, DeliveryKey,
    PalletId, PalletLifecycle, PalletMeta, PalletState, PalletStateError, Resolution,
    StateTransition, SyncStatus,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Aggregation errors.
#[derive(Debug, Error)]
pub enum PalletError {
    #[error(transparent)]
    State(#[from] PalletStateError),

    #[error("pallet in state {0} does not accept captures")]
    NotAcceptingCaptures(PalletState),

    #[error("capture out of order: last applied sequence {last}, got {got}")]
    OutOfOrder { last: u64, got: u64 },

    #[error("no conflict pending resolution")]
    NoConflict,

    #[error("record is frozen in state {0}")]
    Frozen(PalletState),
}

/// What applying a capture did to the record.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Capture absorbed into the record.
    Applied {
        state: PalletState,
        running_total: u64,
    },
    /// Capture decoded a different pallet id; record parked for review.
    Conflict { current: PalletId, decoded: PalletId },
}

/// The durable pallet record. Owned by the aggregator until terminal;
/// the store persists snapshots of it and the sync queue ships them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PalletRecord {
    pub pallet_id: Option<PalletId>,
    pub state: PalletState,
    pub captures: Vec<CaptureResult>,
    pub corrections: Vec<Correction>,
    pub transitions: Vec<StateTransition>,
    pub running_total: u64,
    pub expected_count: Option<u32>,
    pub meta: PalletMeta,
    pub sync_status: SyncStatus,
    /// Capture held aside while the record sits in review.
    pub pending_conflict: Option<CaptureResult>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl PalletRecord {
    /// Build the cloud wire body for this record at a given store version.
    /// `None` until the record has an identity.
    pub fn cloud_payload(&self, version: i64) -> Option<CloudPayload> {
        let pallet_id = self.pallet_id.clone()?;
        let captures = self
            .captures
            .iter()
            .map(|c| CaptureSummary {
                sequence: c.sequence,
                counted: c.keg_count.counted,
                decoded: c.qr.payload().map(str::to_string),
                mode: c.mode,
                at: c.accepted_at,
            })
            .collect();
        let station = self
            .captures
            .first()
            .map(|c| c.station.as_str().to_string());
        let payload = CloudPayload {
            pallet_id: pallet_id.as_str().to_string(),
            keg_count: self.running_total,
            expected_count: self.expected_count,
            captures,
            meta: self.meta.clone(),
            station,
            version,
            delivery_key: DeliveryKey::new(&pallet_id, version),
            timestamp: Utc::now(),
            hash: None,
        };
        Some(payload.finalize())
    }

    pub fn new(meta: PalletMeta, expected_count: Option<u32>) -> Self {
        let now = Utc::now();
        Self {
            pallet_id: None,
            state: PalletState::Open,
            captures: Vec::new(),
            corrections: Vec::new(),
            transitions: Vec::new(),
            running_total: 0,
            expected_count,
            meta,
            sync_status: SyncStatus::Pending,
            pending_conflict: None,
            created_at: now,
            last_modified: now,
        }
    }
}

/// Aggregates accepted captures into one pallet record.
pub struct PalletAggregator {
    record: PalletRecord,
    policy: AggregationPolicy,
    last_sequence: u64,
}

impl PalletAggregator {
    pub fn new(policy: AggregationPolicy, meta: PalletMeta, expected_count: Option<u32>) -> Self {
        Self {
            record: PalletRecord::new(meta, expected_count),
            policy,
            last_sequence: 0,
        }
    }

    /// Resume over a persisted record (recovery path).
    pub fn resume(record: PalletRecord, policy: AggregationPolicy) -> Self {
        let last_sequence = record
            .captures
            .iter()
            .map(|c| c.sequence)
            .max()
            .unwrap_or(0);
        Self {
            record,
            policy,
            last_sequence,
        }
    }

    pub fn record(&self) -> &PalletRecord {
        &self.record
    }

    pub fn state(&self) -> PalletState {
        self.record.state
    }

    /// Highest capture sequence folded in so far.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Fold an accepted capture into the record.
    ///
    /// Captures must arrive in accepted order; the aggregator is the only
    /// writer, so a lower-or-equal sequence means a replay or a bug.
    pub fn apply_capture(&mut self, capture: CaptureResult) -> Result<ApplyOutcome, PalletError> {
        if !self.record.state.accepts_captures() {
            return Err(PalletError::NotAcceptingCaptures(self.record.state));
        }
        if capture.sequence <= self.last_sequence {
            return Err(PalletError::OutOfOrder {
                last: self.last_sequence,
                got: capture.sequence,
            });
        }
        self.last_sequence = capture.sequence;

        let decoded_id = capture.qr.payload().and_then(PalletId::parse);

        if let (Some(current), Some(decoded)) = (self.record.pallet_id.clone(), decoded_id.clone())
        {
            if current != decoded {
                warn!(%current, %decoded, "pallet identity conflict, parking for review");
                self.record.pending_conflict = Some(capture);
                self.transition_to(
                    PalletState::PendingReview,
                    Some(format!("qr decoded {decoded}, record is {current}")),
                    None,
                )?;
                return Ok(ApplyOutcome::Conflict {
                    current,
                    decoded,
                });
            }
        }

        let newly_identified = self.record.pallet_id.is_none() && decoded_id.is_some();
        if let Some(id) = decoded_id {
            if self.record.pallet_id.is_none() {
                self.record.pallet_id = Some(id);
            }
        }

        self.record.captures.push(capture);
        self.recompute_total();

        if newly_identified {
            self.transition_to(PalletState::Identified, Some("qr decoded".into()), None)?;
        } else if self.record.state == PalletState::Identified {
            self.transition_to(PalletState::Accumulating, None, None)?;
        }

        self.maybe_auto_complete()?;

        Ok(ApplyOutcome::Applied {
            state: self.record.state,
            running_total: self.record.running_total,
        })
    }

    /// Operator decision for a record parked in review. `Split` hands the
    /// conflicting capture back so the caller can seed a fresh pallet.
    pub fn resolve_conflict(
        &mut self,
        resolution: Resolution,
        actor: Option<String>,
    ) -> Result<Option<CaptureResult>, PalletError> {
        if self.record.state != PalletState::PendingReview {
            return Err(PalletError::NoConflict);
        }
        let capture = self.record.pending_conflict.take().ok_or(PalletError::NoConflict)?;

        let split = match resolution {
            Resolution::Merge => {
                // Keep the capture under the current identity; the foreign
                // payload stays in the capture's own audit trail.
                self.record.captures.push(capture);
                self.recompute_total();
                None
            }
            Resolution::Ignore => None,
            Resolution::Split => Some(capture),
        };

        self.transition_to(
            PalletState::Accumulating,
            Some(format!("conflict resolved: {}", resolution.as_str())),
            actor,
        )?;
        self.maybe_auto_complete()?;
        Ok(split)
    }

    /// Auditable count correction. The only sanctioned way down.
    pub fn apply_correction(&mut self, correction: Correction) -> Result<(), PalletError> {
        if matches!(
            self.record.state,
            PalletState::Complete | PalletState::Synced | PalletState::Abandoned
        ) {
            return Err(PalletError::Frozen(self.record.state));
        }
        info!(
            delta = correction.delta,
            actor = %correction.actor,
            "correction recorded"
        );
        self.record.corrections.push(correction);
        self.recompute_total();
        self.touch();
        Ok(())
    }

    pub fn update_meta(&mut self, meta: PalletMeta) -> Result<(), PalletError> {
        if matches!(
            self.record.state,
            PalletState::Complete | PalletState::Synced | PalletState::Abandoned
        ) {
            return Err(PalletError::Frozen(self.record.state));
        }
        self.record.meta = meta;
        self.touch();
        Ok(())
    }

    /// Close the record. After this only the sync fields may change.
    pub fn complete(&mut self, actor: Option<String>) -> Result<(), PalletError> {
        self.transition_to(PalletState::Complete, Some("completed".into()), actor)?;
        self.record.sync_status = SyncStatus::Pending;
        Ok(())
    }

    pub fn abandon(&mut self, actor: Option<String>) -> Result<(), PalletError> {
        self.transition_to(PalletState::Abandoned, Some("abandoned".into()), actor)?;
        Ok(())
    }

    /// Cloud acknowledged the completed record.
    pub fn mark_synced(&mut self) -> Result<(), PalletError> {
        self.transition_to(PalletState::Synced, Some("cloud ack".into()), None)?;
        self.record.sync_status = SyncStatus::Synced;
        Ok(())
    }

    /// Delivery retry budget exhausted; state stays Complete for resync.
    pub fn mark_sync_failed(&mut self) {
        self.record.sync_status = SyncStatus::Failed;
        self.touch();
    }

    fn maybe_auto_complete(&mut self) -> Result<(), PalletError> {
        let Some(expected) = self.record.expected_count else {
            return Ok(());
        };
        if self.record.pallet_id.is_some()
            && self.record.state.accepts_captures()
            && self.record.state != PalletState::Open
            && self.record.running_total >= expected as u64
        {
            info!(
                expected,
                total = self.record.running_total,
                "expected count reached, completing"
            );
            self.transition_to(
                PalletState::Complete,
                Some(format!("expected count {expected} reached")),
                None,
            )?;
            self.record.sync_status = SyncStatus::Pending;
        }
        Ok(())
    }

    fn recompute_total(&mut self) {
        let base: i64 = match self.policy {
            AggregationPolicy::Sum => self
                .record
                .captures
                .iter()
                .map(|c| c.keg_count.counted as i64)
                .sum(),
            AggregationPolicy::BestView => self
                .record
                .captures
                .iter()
                .map(|c| c.keg_count.counted as i64)
                .max()
                .unwrap_or(0),
        };
        let corrected = base + self.record.corrections.iter().map(|c| c.delta).sum::<i64>();
        let new_total = corrected.max(0) as u64;

        // Captures alone never lower the total; only corrections may.
        if self.record.corrections.is_empty() {
            debug_assert!(new_total >= self.record.running_total);
        }
        self.record.running_total = new_total;
        self.touch();
    }

    fn transition_to(
        &mut self,
        to: PalletState,
        reason: Option<String>,
        actor: Option<String>,
    ) -> Result<StateTransition, PalletError> {
        let mut lifecycle = PalletLifecycle::from_state(self.record.state);
        let transition = lifecycle.transition_with(to, reason, actor)?;
        self.record.state = lifecycle.current();
        self.record.transitions.push(transition.clone());
        self.touch();
        Ok(transition)
    }

    fn touch(&mut self) {
        self.record.last_modified = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kegwatch_protocol::{
        CaptureId, CaptureMode, KegCount, QrOutcome, StationId, StrategyKind,
    };

    fn capture(sequence: u64, counted: u32, payload: Option<&str>) -> CaptureResult {
        let qr = match payload {
            Some(p) => QrOutcome::Decoded {
                payload: p.to_string(),
                method: StrategyKind::Direct,
                quality: 0.9,
                latency_ms: 12,
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

    fn aggregator(policy: AggregationPolicy) -> PalletAggregator {
        PalletAggregator::new(policy, PalletMeta::default(), None)
    }

    #[test]
    fn sum_policy_end_to_end() {
        let mut agg = aggregator(AggregationPolicy::Sum);

        agg.apply_capture(capture(1, 4, Some("PAL-001"))).unwrap();
        assert_eq!(agg.state(), PalletState::Identified);

        agg.apply_capture(capture(2, 6, None)).unwrap();
        assert_eq!(agg.state(), PalletState::Accumulating);

        agg.apply_capture(capture(3, 2, None)).unwrap();
        assert_eq!(agg.state(), PalletState::Accumulating);
        assert_eq!(agg.record().running_total, 12);

        agg.complete(Some("operator".into())).unwrap();
        assert_eq!(agg.state(), PalletState::Complete);

        agg.mark_synced().unwrap();
        assert_eq!(agg.state(), PalletState::Synced);
        assert_eq!(agg.record().sync_status, SyncStatus::Synced);
    }

    #[test]
    fn best_view_takes_the_max() {
        let mut agg = aggregator(AggregationPolicy::BestView);
        agg.apply_capture(capture(1, 4, Some("PAL-001"))).unwrap();
        agg.apply_capture(capture(2, 6, None)).unwrap();
        agg.apply_capture(capture(3, 2, None)).unwrap();
        assert_eq!(agg.record().running_total, 6);
    }

    #[test]
    fn total_is_non_decreasing_without_corrections() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        let mut last = 0;
        for (seq, counted) in [(1, 3), (2, 0), (3, 5), (4, 1)] {
            agg.apply_capture(capture(seq, counted, if seq == 1 { Some("PAL-002") } else { None }))
                .unwrap();
            assert!(agg.record().running_total >= last);
            last = agg.record().running_total;
        }
    }

    #[test]
    fn undecodable_first_capture_keeps_record_open() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        agg.apply_capture(capture(1, 5, None)).unwrap();
        assert_eq!(agg.state(), PalletState::Open);
        assert_eq!(agg.record().running_total, 5);

        // QR lands on the second capture.
        agg.apply_capture(capture(2, 3, Some("PAL-003"))).unwrap();
        assert_eq!(agg.state(), PalletState::Identified);
        assert_eq!(agg.record().pallet_id.as_ref().unwrap().as_str(), "PAL-003");
    }

    #[test]
    fn conflicting_identity_parks_for_review() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        agg.apply_capture(capture(1, 4, Some("PAL-001"))).unwrap();

        let outcome = agg.apply_capture(capture(2, 6, Some("PAL-999"))).unwrap();
        match outcome {
            ApplyOutcome::Conflict { current, decoded } => {
                assert_eq!(current.as_str(), "PAL-001");
                assert_eq!(decoded.as_str(), "PAL-999");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(agg.state(), PalletState::PendingReview);
        // No auto-merge: identity and total are untouched.
        assert_eq!(agg.record().pallet_id.as_ref().unwrap().as_str(), "PAL-001");
        assert_eq!(agg.record().running_total, 4);

        // And no captures are accepted while parked.
        let err = agg.apply_capture(capture(3, 1, None)).unwrap_err();
        assert!(matches!(err, PalletError::NotAcceptingCaptures(_)));
    }

    #[test]
    fn resolve_merge_counts_the_parked_capture() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        agg.apply_capture(capture(1, 4, Some("PAL-001"))).unwrap();
        agg.apply_capture(capture(2, 6, Some("PAL-999"))).unwrap();

        let split = agg
            .resolve_conflict(Resolution::Merge, Some("operator".into()))
            .unwrap();
        assert!(split.is_none());
        assert_eq!(agg.state(), PalletState::Accumulating);
        assert_eq!(agg.record().running_total, 10);
    }

    #[test]
    fn resolve_ignore_discards_the_parked_capture() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        agg.apply_capture(capture(1, 4, Some("PAL-001"))).unwrap();
        agg.apply_capture(capture(2, 6, Some("PAL-999"))).unwrap();

        let split = agg.resolve_conflict(Resolution::Ignore, None).unwrap();
        assert!(split.is_none());
        assert_eq!(agg.record().running_total, 4);
        assert_eq!(agg.state(), PalletState::Accumulating);
    }

    #[test]
    fn resolve_split_returns_the_capture() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        agg.apply_capture(capture(1, 4, Some("PAL-001"))).unwrap();
        agg.apply_capture(capture(2, 6, Some("PAL-999"))).unwrap();

        let split = agg.resolve_conflict(Resolution::Split, None).unwrap();
        let capture = split.expect("split returns the conflicting capture");
        assert_eq!(capture.qr.payload(), Some("PAL-999"));
        assert_eq!(agg.record().running_total, 4);
    }

    #[test]
    fn corrections_are_audited_not_rewritten() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        agg.apply_capture(capture(1, 8, Some("PAL-001"))).unwrap();

        agg.apply_correction(Correction {
            delta: -2,
            reason: "two empties on the pallet".into(),
            actor: "operator".into(),
            at: Utc::now(),
        })
        .unwrap();

        assert_eq!(agg.record().running_total, 6);
        assert_eq!(agg.record().corrections.len(), 1);
        // Per-capture counts are untouched.
        assert_eq!(agg.record().captures[0].keg_count.counted, 8);
    }

    #[test]
    fn out_of_order_capture_is_rejected() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        agg.apply_capture(capture(5, 4, Some("PAL-001"))).unwrap();
        let err = agg.apply_capture(capture(5, 4, None)).unwrap_err();
        assert!(matches!(err, PalletError::OutOfOrder { last: 5, got: 5 }));
    }

    #[test]
    fn complete_freezes_everything_but_sync_fields() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        agg.apply_capture(capture(1, 4, Some("PAL-001"))).unwrap();
        agg.complete(None).unwrap();

        assert!(matches!(
            agg.apply_capture(capture(2, 1, None)).unwrap_err(),
            PalletError::NotAcceptingCaptures(PalletState::Complete)
        ));
        assert!(matches!(
            agg.apply_correction(Correction {
                delta: 1,
                reason: "late".into(),
                actor: "op".into(),
                at: Utc::now(),
            })
            .unwrap_err(),
            PalletError::Frozen(PalletState::Complete)
        ));

        agg.mark_sync_failed();
        assert_eq!(agg.record().sync_status, SyncStatus::Failed);
    }

    #[test]
    fn expected_count_auto_completes() {
        let mut agg =
            PalletAggregator::new(AggregationPolicy::Sum, PalletMeta::default(), Some(6));
        agg.apply_capture(capture(1, 4, Some("PAL-001"))).unwrap();
        assert_eq!(agg.state(), PalletState::Identified);

        agg.apply_capture(capture(2, 2, None)).unwrap();
        assert_eq!(agg.state(), PalletState::Complete);
        assert_eq!(agg.record().running_total, 6);
    }

    #[test]
    fn abandon_reachable_any_time_before_terminal() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        agg.apply_capture(capture(1, 4, Some("PAL-001"))).unwrap();
        agg.apply_capture(capture(2, 6, Some("PAL-999"))).unwrap();
        assert_eq!(agg.state(), PalletState::PendingReview);
        agg.abandon(Some("operator".into())).unwrap();
        assert_eq!(agg.state(), PalletState::Abandoned);
    }

    #[test]
    fn cloud_payload_carries_delivery_key_and_hash() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        agg.apply_capture(capture(1, 4, Some("PAL-001"))).unwrap();

        let payload = agg.record().cloud_payload(3).unwrap();
        assert_eq!(payload.delivery_key.as_str(), "PAL-001@3");
        assert_eq!(payload.keg_count, 4);
        assert!(payload.verify_hash());

        let unidentified = PalletRecord::new(PalletMeta::default(), None);
        assert!(unidentified.cloud_payload(1).is_none());
    }

    #[test]
    fn resume_restores_sequence_watermark() {
        let mut agg = aggregator(AggregationPolicy::Sum);
        agg.apply_capture(capture(1, 4, Some("PAL-001"))).unwrap();
        agg.apply_capture(capture(2, 6, None)).unwrap();

        let record = agg.record().clone();
        let mut resumed = PalletAggregator::resume(record, AggregationPolicy::Sum);
        let err = resumed.apply_capture(capture(2, 1, None)).unwrap_err();
        assert!(matches!(err, PalletError::OutOfOrder { last: 2, got: 2 }));
        resumed.apply_capture(capture(3, 1, None)).unwrap();
        assert_eq!(resumed.record().running_total, 11);
    }
}
