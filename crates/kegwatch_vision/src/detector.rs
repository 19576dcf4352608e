//! Keg detector interface.
//!
//! The model itself (weights, runtime) is an external collaborator; the
//! contract here is deterministic detection over a frame. Zero detections
//! is a normal result. A broken frame or failed inference is an error -
//! callers must never read "no kegs" out of "detector broken".

use kegwatch_protocol::{Detection, Frame, KegCount};
use thiserror::Error;

/// Detector failures, distinct from the empty detection list.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("malformed frame: {width}x{height} with {len} pixel bytes")]
    MalformedFrame { width: u32, height: u32, len: usize },

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Object detector producing keg detections for a frame.
///
/// Implementations must be deterministic for identical frame + model and
/// must return every detection the model produced - threshold filtering
/// happens outside, so the HMI can still show sub-threshold boxes.
pub trait KegDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;
}

/// Detection configuration.
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Detections below this confidence are returned but not counted.
    pub confidence_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
        }
    }
}

/// Validate frame geometry before handing it to a model.
pub fn ensure_well_formed(frame: &Frame) -> Result<(), DetectorError> {
    if frame.is_well_formed() {
        Ok(())
    } else {
        Err(DetectorError::MalformedFrame {
            width: frame.width,
            height: frame.height,
            len: frame.pixels.len(),
        })
    }
}

/// Run detection and derive the thresholded keg count in one step.
pub fn count_kegs(
    detector: &dyn KegDetector,
    frame: &Frame,
    config: &DetectorConfig,
) -> Result<(Vec<Detection>, KegCount), DetectorError> {
    let detections = detector.detect(frame)?;
    let count = KegCount::from_detections(&detections, config.confidence_threshold);
    Ok((detections, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kegwatch_protocol::{BoundingBox, StationId};

    struct FixedDetector {
        confidences: Vec<f32>,
    }

    impl KegDetector for FixedDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
            ensure_well_formed(frame)?;
            let bbox = BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 8.0,
                height: 8.0,
            };
            Ok(self
                .confidences
                .iter()
                .map(|c| Detection::new(bbox, *c))
                .collect())
        }
    }

    fn frame() -> Frame {
        Frame::new(
            vec![0u8; 16],
            4,
            4,
            Utc::now(),
            StationId::new("test-cam"),
        )
    }

    #[test]
    fn zero_detections_is_ok_not_error() {
        let detector = FixedDetector {
            confidences: vec![],
        };
        let (detections, count) =
            count_kegs(&detector, &frame(), &DetectorConfig::default()).unwrap();
        assert!(detections.is_empty());
        assert_eq!(count.counted, 0);
    }

    #[test]
    fn threshold_excludes_without_discarding() {
        let detector = FixedDetector {
            confidences: vec![0.9, 0.6, 0.1],
        };
        let config = DetectorConfig {
            confidence_threshold: 0.5,
        };
        let (detections, count) = count_kegs(&detector, &frame(), &config).unwrap();
        assert_eq!(detections.len(), 3);
        assert_eq!(count.counted, 2);
        assert_eq!(count.raw, 3);
    }

    #[test]
    fn malformed_frame_is_an_error() {
        let detector = FixedDetector {
            confidences: vec![0.9],
        };
        let bad = Frame::new(vec![0u8; 3], 4, 4, Utc::now(), StationId::new("test-cam"));
        let err = count_kegs(&detector, &bad, &DetectorConfig::default()).unwrap_err();
        assert!(matches!(err, DetectorError::MalformedFrame { .. }));
    }
}
