//! Capture attempt orchestration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use kegwatch_protocol::{
    CaptureId, CaptureMode, CaptureResult, Frame, KegCount, QrOutcome, RejectReason,
};
use kegwatch_vision::{count_kegs, DecoderChain, DetectorConfig, KegDetector};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;

/// Supplies timestamped frames on demand. `None` means no frame is
/// currently available; the controller waits and asks again.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Controller phase, published for the operator panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Idle,
    Triggered,
    Stabilizing,
    Evaluating,
}

/// Outcome of one capture attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Accepted(CaptureResult),
    Rejected(RejectReason),
    /// Auto-trigger guard fired; nothing was captured and no reject is
    /// surfaced to the operator.
    Suppressed(SuppressReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// Cooldown window after the previous auto capture is still open.
    Cooldown,
    /// The decoded pallet is the one just captured, still under the camera.
    SamePallet,
}

/// Capture tuning. All of this comes from station configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Stability counter target before a frame is considered settled.
    pub stability_threshold: u32,
    pub stabilize_timeout: Duration,
    pub evaluate_timeout: Duration,
    /// Pause between frame polls while stabilizing.
    pub frame_interval: Duration,
    /// Auto mode retries a timed-out attempt this many times.
    pub auto_retry_budget: u32,
    /// Auto triggers are ignored for this long after an accepted capture.
    pub auto_cooldown: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            stability_threshold: 5,
            stabilize_timeout: Duration::from_secs(10),
            evaluate_timeout: Duration::from_secs(5),
            frame_interval: Duration::from_millis(33),
            auto_retry_budget: 3,
            auto_cooldown: Duration::from_secs(10),
        }
    }
}

/// Drives single capture attempts. One controller per camera station;
/// only one attempt is ever active at a time.
pub struct CaptureController {
    detector: Arc<dyn KegDetector>,
    decoder: Arc<DecoderChain>,
    detector_config: DetectorConfig,
    config: CaptureConfig,
    cancel: CancelToken,
    phase_tx: watch::Sender<CapturePhase>,
    sequence: u64,
    cooldown_until: Option<Instant>,
    last_auto_payload: Option<String>,
}

impl CaptureController {
    pub fn new(
        detector: Arc<dyn KegDetector>,
        decoder: Arc<DecoderChain>,
        detector_config: DetectorConfig,
        config: CaptureConfig,
    ) -> Self {
        let (phase_tx, _) = watch::channel(CapturePhase::Idle);
        Self {
            detector,
            decoder,
            detector_config,
            config,
            cancel: CancelToken::new(),
            phase_tx,
            sequence: 0,
            cooldown_until: None,
            last_auto_payload: None,
        }
    }

    /// Token the HMI uses to abort the in-flight attempt.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Phase updates for the operator panel.
    pub fn phase_watch(&self) -> watch::Receiver<CapturePhase> {
        self.phase_tx.subscribe()
    }

    /// Continue sequence numbering above a persisted watermark, so
    /// captures accepted after a restart still order after the ones
    /// already folded into a rehydrated pallet record.
    pub fn resume_sequence(&mut self, last: u64) {
        self.sequence = self.sequence.max(last);
    }

    /// Run one capture attempt. Manual rejections surface immediately;
    /// use [`run_auto`](Self::run_auto) for the retrying auto path.
    pub async fn run_capture(
        &mut self,
        source: &mut dyn FrameSource,
        mode: CaptureMode,
    ) -> Result<CaptureOutcome> {
        self.set_phase(CapturePhase::Triggered);

        if mode == CaptureMode::Auto {
            if let Some(until) = self.cooldown_until {
                if Instant::now() < until {
                    debug!("auto trigger suppressed: cooldown");
                    self.set_phase(CapturePhase::Idle);
                    return Ok(CaptureOutcome::Suppressed(SuppressReason::Cooldown));
                }
            }
        }

        let frame = match self.stabilize(source).await? {
            Ok(frame) => frame,
            Err(reason) => return Ok(self.reject(mode, reason)),
        };

        self.set_phase(CapturePhase::Evaluating);
        let (count, qr) = match self.evaluate(&frame).await {
            Ok(evaluated) => evaluated,
            Err(reason) => return Ok(self.reject(mode, reason)),
        };

        if mode == CaptureMode::Auto {
            if let (Some(last), Some(payload)) = (self.last_auto_payload.as_deref(), qr.payload())
            {
                if last == payload {
                    debug!(payload, "auto trigger suppressed: same pallet under camera");
                    self.set_phase(CapturePhase::Idle);
                    return Ok(CaptureOutcome::Suppressed(SuppressReason::SamePallet));
                }
            }
        }

        self.sequence += 1;
        let result = CaptureResult {
            id: CaptureId::new(),
            sequence: self.sequence,
            station: frame.source.clone(),
            frame_timestamp: frame.timestamp,
            mode,
            keg_count: count,
            qr,
            accepted_at: Utc::now(),
        };

        if mode == CaptureMode::Auto {
            self.cooldown_until = Some(Instant::now() + self.config.auto_cooldown);
            if let Some(payload) = result.qr.payload() {
                self.last_auto_payload = Some(payload.to_string());
            }
        }

        info!(
            sequence = result.sequence,
            counted = result.keg_count.counted,
            decoded = result.qr.is_decoded(),
            mode = %mode,
            "capture accepted"
        );
        self.set_phase(CapturePhase::Idle);
        Ok(CaptureOutcome::Accepted(result))
    }

    /// Auto-mode entry point: retries timed-out attempts up to the
    /// configured budget before surfacing the rejection.
    pub async fn run_auto(&mut self, source: &mut dyn FrameSource) -> Result<CaptureOutcome> {
        let mut attempt = 0u32;
        loop {
            let outcome = self.run_capture(source, CaptureMode::Auto).await?;
            match outcome {
                CaptureOutcome::Rejected(RejectReason::Timeout)
                    if attempt < self.config.auto_retry_budget =>
                {
                    attempt += 1;
                    debug!(attempt, "auto capture timed out, retrying");
                }
                other => return Ok(other),
            }
        }
    }

    async fn stabilize(
        &mut self,
        source: &mut dyn FrameSource,
    ) -> Result<std::result::Result<Frame, RejectReason>> {
        self.set_phase(CapturePhase::Stabilizing);
        let deadline = Instant::now() + self.config.stabilize_timeout;
        let mut counter: u32 = 0;
        let mut prev: Option<u32> = None;

        loop {
            if self.cancel.is_cancelled() {
                self.cancel.reset();
                return Ok(Err(RejectReason::Cancelled));
            }
            if Instant::now() >= deadline {
                return Ok(Err(RejectReason::Timeout));
            }

            let Some(frame) = source.next_frame()? else {
                sleep(self.config.frame_interval).await;
                continue;
            };

            let counted =
                match count_kegs(self.detector.as_ref(), &frame, &self.detector_config) {
                    Ok((_, count)) => count.counted,
                    Err(err) => {
                        warn!(error = %err, "detector failed while stabilizing");
                        return Ok(Err(RejectReason::DetectorFailure));
                    }
                };

            // Original station hysteresis: reward agreement, punish
            // deviation twice as hard, never below zero.
            counter = match prev {
                Some(p) if p == counted => counter + 1,
                Some(_) => counter.saturating_sub(2),
                None => 1,
            };
            prev = Some(counted);

            if counter >= self.config.stability_threshold {
                return Ok(Ok(frame));
            }
            sleep(self.config.frame_interval).await;
        }
    }

    async fn evaluate(
        &self,
        frame: &Frame,
    ) -> std::result::Result<(KegCount, QrOutcome), RejectReason> {
        let detector = Arc::clone(&self.detector);
        let detector_config = self.detector_config;
        let detect_frame = frame.clone();
        let detect_task = tokio::task::spawn_blocking(move || {
            count_kegs(detector.as_ref(), &detect_frame, &detector_config)
        });

        let decoder = Arc::clone(&self.decoder);
        let decode_frame = frame.clone();
        let decode_task = tokio::task::spawn_blocking(move || decoder.decode(&decode_frame));

        // Strict barrier: both finish (or the attempt times out) before
        // anything downstream sees the result.
        let joined = timeout(self.config.evaluate_timeout, async {
            tokio::join!(detect_task, decode_task)
        })
        .await;

        let (detect_res, decode_res) = match joined {
            Ok(pair) => pair,
            Err(_) => return Err(RejectReason::Timeout),
        };

        let qr = decode_res.unwrap_or(QrOutcome::Undecodable { strategies_tried: 0 });
        let (_, count) = match detect_res {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                warn!(error = %err, "detector failed during evaluation");
                return Err(RejectReason::DetectorFailure);
            }
            Err(_) => return Err(RejectReason::DetectorFailure),
        };

        if self.cancel.is_cancelled() {
            return Err(RejectReason::Cancelled);
        }
        if count.counted == 0 {
            return Err(RejectReason::LowConfidence);
        }
        Ok((count, qr))
    }

    fn reject(&mut self, mode: CaptureMode, reason: RejectReason) -> CaptureOutcome {
        if reason == RejectReason::Cancelled {
            self.cancel.reset();
        }
        info!(mode = %mode, reason = %reason, "capture rejected");
        self.set_phase(CapturePhase::Idle);
        CaptureOutcome::Rejected(reason)
    }

    fn set_phase(&self, phase: CapturePhase) {
        let _ = self.phase_tx.send(phase);
    }
}
