//! Station payload types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Identity of a camera station (one Kegwatch process per station).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(String);

impl StationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pallet identity as decoded from the pallet QR label.
///
/// Once assigned to a record it is immutable for the record's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PalletId(String);

impl PalletId {
    /// Build from a decoded payload. Leading/trailing whitespace is not
    /// identity; empty payloads are not identities at all.
    pub fn parse(payload: &str) -> Option<Self> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PalletId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| "pallet id must be non-empty".to_string())
    }
}

/// Capture identifier (UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureId(Uuid);

impl CaptureId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CaptureId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Frames and detections
// ============================================================================

/// A single grayscale frame from the station camera.
///
/// Immutable once produced. Pixels are row-major 8-bit luma.
#[derive(Clone)]
pub struct Frame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: DateTime<Utc>,
    pub source: StationId,
}

impl Frame {
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        timestamp: DateTime<Utc>,
        source: StationId,
    ) -> Self {
        Self {
            pixels,
            width,
            height,
            timestamp,
            source,
        }
    }

    /// Pixel buffer length matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.pixels.len() == (self.width as usize) * (self.height as usize)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp", &self.timestamp)
            .field("source", &self.source)
            .finish()
    }
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// One detected keg instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

impl Detection {
    /// Confidence is clamped into [0, 1] at construction.
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Keg count derived from a detection list and a confidence threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KegCount {
    /// Detections at or above the configured threshold.
    pub counted: u32,
    /// All detections the model returned, threshold or not.
    pub raw: u32,
}

impl KegCount {
    pub fn from_detections(detections: &[Detection], threshold: f32) -> Self {
        let counted = detections
            .iter()
            .filter(|d| d.confidence >= threshold)
            .count() as u32;
        Self {
            counted,
            raw: detections.len() as u32,
        }
    }
}

// ============================================================================
// QR decoding
// ============================================================================

/// A decode strategy in the fallback chain. Order comes from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Scan the frame as captured.
    Direct,
    /// Linear contrast stretch before scanning.
    ContrastEnhanced,
    /// Scan the configured center region at native resolution.
    CroppedRegion,
    /// Scan 90/180/270 degree rotations.
    RotatedVariants,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Direct => "direct",
            StrategyKind::ContrastEnhanced => "contrast_enhanced",
            StrategyKind::CroppedRegion => "cropped_region",
            StrategyKind::RotatedVariants => "rotated_variants",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(StrategyKind::Direct),
            "contrast_enhanced" => Ok(StrategyKind::ContrastEnhanced),
            "cropped_region" => Ok(StrategyKind::CroppedRegion),
            "rotated_variants" => Ok(StrategyKind::RotatedVariants),
            _ => Err(format!(
                "Invalid decode strategy: '{}'. Expected: direct, contrast_enhanced, \
cropped_region, or rotated_variants",
                s
            )),
        }
    }
}

/// Outcome of running the decode chain over one frame.
///
/// Decoding is total: an unreadable label is `Undecodable`, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QrOutcome {
    Decoded {
        payload: String,
        method: StrategyKind,
        quality: f32,
        latency_ms: u64,
    },
    Undecodable {
        strategies_tried: u32,
    },
}

impl QrOutcome {
    pub fn payload(&self) -> Option<&str> {
        match self {
            QrOutcome::Decoded { payload, .. } => Some(payload),
            QrOutcome::Undecodable { .. } => None,
        }
    }

    pub fn is_decoded(&self) -> bool {
        matches!(self, QrOutcome::Decoded { .. })
    }
}

// ============================================================================
// Captures
// ============================================================================

/// How a capture was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Manual,
    Auto,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Manual => "manual",
            CaptureMode::Auto => "auto",
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a capture attempt was rejected. The operator always sees one of
/// these, never a bare failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// Stability or evaluation deadline elapsed.
    Timeout,
    /// Detections present but none reached the counting threshold.
    LowConfidence,
    /// The detector itself failed (distinct from zero detections).
    DetectorFailure,
    /// Operator cancelled mid-attempt.
    Cancelled,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Timeout => "TIMEOUT",
            RejectReason::LowConfidence => "LOW_CONFIDENCE",
            RejectReason::DetectorFailure => "DETECTOR_FAILURE",
            RejectReason::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One accepted capture event. Produced exactly once per accepted attempt;
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub id: CaptureId,
    /// Station-assigned, strictly increasing across accepted captures.
    pub sequence: u64,
    pub station: StationId,
    pub frame_timestamp: DateTime<Utc>,
    pub mode: CaptureMode,
    pub keg_count: KegCount,
    pub qr: QrOutcome,
    pub accepted_at: DateTime<Utc>,
}

// ============================================================================
// Pallet record pieces
// ============================================================================

/// Cloud-visible sync state of a pallet record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[default]
    Pending,
    Failed,
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Synced => "SYNCED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SyncStatus::Pending),
            "FAILED" => Ok(SyncStatus::Failed),
            "SYNCED" => Ok(SyncStatus::Synced),
            _ => Err(format!("Invalid sync status: '{}'", s)),
        }
    }
}

/// Lifecycle of one outbound delivery task in the durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for the flush worker (possibly not yet due).
    #[default]
    Pending,
    /// Claimed by the flush worker, request may be on the wire.
    InFlight,
    /// Cloud acknowledged; task retained only for audit.
    Acked,
    /// Retry budget exhausted; needs manual resync.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InFlight => "IN_FLIGHT",
            TaskStatus::Acked => "ACKED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Acked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "IN_FLIGHT" => Ok(TaskStatus::InFlight),
            "ACKED" => Ok(TaskStatus::Acked),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => Err(format!("Invalid task status: '{}'", s)),
        }
    }
}

/// Operator-issued count correction. Corrections are audit events; they
/// never rewrite per-capture counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub delta: i64,
    pub reason: String,
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// Operator-supplied metadata riding along in the cloud payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PalletMeta {
    pub beer_type: Option<String>,
    pub batch_code: Option<String>,
    pub filling_date: Option<String>,
}

/// How per-capture counts combine into the running pallet total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Total is the sum of counted kegs across captures.
    Sum,
    /// Total is the best single view (max counted in any capture).
    BestView,
}

impl AggregationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationPolicy::Sum => "sum",
            AggregationPolicy::BestView => "best_view",
        }
    }
}

impl FromStr for AggregationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(AggregationPolicy::Sum),
            "best_view" => Ok(AggregationPolicy::BestView),
            _ => Err(format!(
                "Invalid aggregation policy: '{}'. Expected: sum or best_view",
                s
            )),
        }
    }
}

/// Operator decision on a pallet-identity conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the conflicting capture under the current identity.
    Merge,
    /// Discard the conflicting capture.
    Ignore,
    /// Remove the conflicting capture so it can seed a fresh pallet.
    Split,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Merge => "merge",
            Resolution::Ignore => "ignore",
            Resolution::Split => "split",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
