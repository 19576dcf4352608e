//! Messages crossing the HMI boundary.
//!
//! Commands flow from the operator panel into the core; station events flow
//! out for display and for the external logging subsystem. Both are plain
//! serializable values so the rendering layer stays fully decoupled.

use crate::state::PalletState;
use crate::types::{
    CaptureMode, CaptureResult, Correction, PalletId, PalletMeta, RejectReason, Resolution,
    SyncStatus,
};
use serde::{Deserialize, Serialize};

/// Operator input consumed by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HmiCommand {
    /// Manual capture trigger.
    TriggerCapture,
    /// Close the active pallet record.
    CompletePallet,
    /// Cancel the active pallet record.
    AbandonPallet,
    /// Decision for a record parked in review.
    ResolveConflict { resolution: Resolution },
    /// Auditable count correction.
    RecordCorrection { correction: Correction },
    /// Update operator-supplied metadata on the active record.
    UpdateMeta { meta: PalletMeta },
    /// Re-arm a failed delivery for another attempt cycle.
    Resync { pallet_id: PalletId },
}

/// Core output surfaced to the operator and the logging collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StationEvent {
    CaptureAccepted {
        capture: CaptureResult,
    },
    CaptureRejected {
        mode: CaptureMode,
        reason: RejectReason,
    },
    PalletTransition {
        pallet_id: Option<PalletId>,
        from: PalletState,
        to: PalletState,
    },
    /// Snapshot for the operator panel after any record change.
    PalletStatus {
        pallet_id: Option<PalletId>,
        state: PalletState,
        running_total: u64,
        sync: SyncStatus,
    },
    ConflictDetected {
        current: PalletId,
        decoded: PalletId,
    },
    /// A completing record's id was already synced earlier.
    DuplicatePallet {
        pallet_id: PalletId,
    },
    SyncAttempt {
        pallet_id: PalletId,
        version: i64,
        attempt: u32,
    },
    SyncOutcome {
        pallet_id: PalletId,
        version: i64,
        ok: bool,
        detail: Option<String>,
    },
    NetworkChanged {
        online: bool,
    },
}
