//! Capture controller.
//!
//! One capture attempt walks `Idle -> Triggered -> Stabilizing ->
//! Evaluating -> Accepted | Rejected -> Idle`. Stabilizing discards frames
//! until the detection count settles (or a deadline passes); Evaluating
//! runs the detector and the decode chain concurrently under one timeout
//! and both must finish before the attempt is judged. Exactly one
//! `CaptureResult` is emitted per accepted attempt.

pub mod cancel;
pub mod controller;

pub use cancel::CancelToken;
pub use controller::{
    CaptureConfig, CaptureController, CaptureOutcome, CapturePhase, FrameSource, SuppressReason,
};
