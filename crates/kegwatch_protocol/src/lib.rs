//! Canonical types for the Kegwatch camera station.
//!
//! Every crate in the workspace speaks these types: frames and detections,
//! capture results, the pallet lifecycle state machine, sync/queue statuses,
//! and the delivery keys the cloud side de-duplicates on. Definitions here
//! are the CANONICAL ones - do not redeclare them downstream.

pub mod delivery;
pub mod events;
pub mod state;
pub mod types;

pub use delivery::{payload_hash, CaptureSummary, CloudPayload, DeliveryKey};
pub use events::{HmiCommand, StationEvent};
pub use state::{PalletLifecycle, PalletState, PalletStateError, StateTransition};
pub use types::{
    AggregationPolicy, BoundingBox, CaptureId, CaptureMode, CaptureResult, Correction, Detection,
    Frame, KegCount, PalletId, PalletMeta, QrOutcome, RejectReason, Resolution, StationId,
    StrategyKind, SyncStatus, TaskStatus,
};
