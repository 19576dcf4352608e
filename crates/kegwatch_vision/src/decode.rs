//! QR decode chain.
//!
//! An ordered list of strategies runs against the frame, cheapest first,
//! and the chain short-circuits on the first hit. Different label
//! placements and lighting favor different strategies; the order is pure
//! configuration so stations can be retuned without touching control flow.
//! Exhausting the chain is an expected outcome, not an error.

use std::time::Instant;

use image::imageops;
use image::GrayImage;
use kegwatch_protocol::{Frame, QrOutcome, StrategyKind};
use tracing::debug;

/// A successful low-level scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanHit {
    pub payload: String,
    /// Reader-reported decode quality in [0, 1].
    pub quality: f32,
}

/// Opaque QR symbol reader. Implementations wrap whatever decoder library
/// or model the station ships with.
pub trait QrScanner: Send + Sync {
    fn scan(&self, image: &GrayImage) -> Option<ScanHit>;
}

/// Chain configuration. `strategies` is the priority order; removing an
/// entry disables that strategy.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub strategies: Vec<StrategyKind>,
    /// Fraction of width/height retained by the center crop strategy.
    pub crop_fraction: f32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                StrategyKind::Direct,
                StrategyKind::ContrastEnhanced,
                StrategyKind::CroppedRegion,
                StrategyKind::RotatedVariants,
            ],
            crop_fraction: 0.5,
        }
    }
}

/// Ordered fallback decoder over a single scanner.
pub struct DecoderChain {
    scanner: Box<dyn QrScanner>,
    config: DecoderConfig,
}

impl DecoderChain {
    pub fn new(scanner: Box<dyn QrScanner>, config: DecoderConfig) -> Self {
        Self { scanner, config }
    }

    /// Run the chain. Total: always returns an outcome.
    pub fn decode(&self, frame: &Frame) -> QrOutcome {
        let Some(image) = frame_to_gray(frame) else {
            return QrOutcome::Undecodable { strategies_tried: 0 };
        };

        let started = Instant::now();
        for (index, strategy) in self.config.strategies.iter().enumerate() {
            if let Some(hit) = self.attempt(*strategy, &image) {
                let latency_ms = started.elapsed().as_millis() as u64;
                debug!(
                    strategy = %strategy,
                    attempts = index + 1,
                    latency_ms,
                    "qr decoded"
                );
                return QrOutcome::Decoded {
                    payload: hit.payload,
                    method: *strategy,
                    quality: hit.quality,
                    latency_ms,
                };
            }
        }

        QrOutcome::Undecodable {
            strategies_tried: self.config.strategies.len() as u32,
        }
    }

    fn attempt(&self, strategy: StrategyKind, image: &GrayImage) -> Option<ScanHit> {
        match strategy {
            StrategyKind::Direct => self.scanner.scan(image),
            StrategyKind::ContrastEnhanced => self.scanner.scan(&stretch_contrast(image)),
            StrategyKind::CroppedRegion => self
                .scanner
                .scan(&center_crop(image, self.config.crop_fraction)),
            StrategyKind::RotatedVariants => {
                let variants = [
                    imageops::rotate90(image),
                    imageops::rotate180(image),
                    imageops::rotate270(image),
                ];
                variants.iter().find_map(|v| self.scanner.scan(v))
            }
        }
    }
}

fn frame_to_gray(frame: &Frame) -> Option<GrayImage> {
    GrayImage::from_raw(frame.width, frame.height, frame.pixels.clone())
}

/// Linear contrast stretch over the observed luma range.
fn stretch_contrast(image: &GrayImage) -> GrayImage {
    let (mut lo, mut hi) = (u8::MAX, u8::MIN);
    for pixel in image.pixels() {
        lo = lo.min(pixel[0]);
        hi = hi.max(pixel[0]);
    }
    if hi <= lo {
        return image.clone();
    }
    let range = (hi - lo) as f32;
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        let stretched = ((pixel[0] - lo) as f32 / range * 255.0).round() as u8;
        pixel[0] = stretched;
    }
    out
}

/// Center crop retaining `fraction` of each dimension.
fn center_crop(image: &GrayImage, fraction: f32) -> GrayImage {
    let fraction = fraction.clamp(0.1, 1.0);
    let (w, h) = image.dimensions();
    let crop_w = ((w as f32 * fraction) as u32).max(1);
    let crop_h = ((h as f32 * fraction) as u32).max(1);
    let x = (w - crop_w) / 2;
    let y = (h - crop_h) / 2;
    imageops::crop_imm(image, x, y, crop_w, crop_h).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kegwatch_protocol::StationId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Scanner that succeeds on the Nth call, counting every call.
    struct ScriptedScanner {
        calls: Arc<AtomicU32>,
        succeed_on_call: Option<u32>,
    }

    impl QrScanner for ScriptedScanner {
        fn scan(&self, _image: &GrayImage) -> Option<ScanHit> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.succeed_on_call {
                Some(n) if call == n => Some(ScanHit {
                    payload: "PAL-001".to_string(),
                    quality: 0.9,
                }),
                _ => None,
            }
        }
    }

    fn frame() -> Frame {
        Frame::new(
            vec![128u8; 64 * 64],
            64,
            64,
            Utc::now(),
            StationId::new("test-cam"),
        )
    }

    fn chain(succeed_on_call: Option<u32>) -> (DecoderChain, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let scanner = ScriptedScanner {
            calls: Arc::clone(&calls),
            succeed_on_call,
        };
        (
            DecoderChain::new(Box::new(scanner), DecoderConfig::default()),
            calls,
        )
    }

    #[test]
    fn short_circuits_on_first_success() {
        let (chain, calls) = chain(Some(1));
        let outcome = chain.decode(&frame());
        assert_eq!(outcome.payload(), Some("PAL-001"));
        match outcome {
            QrOutcome::Decoded { method, .. } => assert_eq!(method, StrategyKind::Direct),
            _ => panic!("expected decode"),
        }
        // Later strategies never ran.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn falls_through_to_later_strategy() {
        let (chain, calls) = chain(Some(3));
        let outcome = chain.decode(&frame());
        match outcome {
            QrOutcome::Decoded { method, .. } => {
                assert_eq!(method, StrategyKind::CroppedRegion)
            }
            _ => panic!("expected decode"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhaustion_is_undecodable_not_error() {
        let (chain, calls) = chain(None);
        let outcome = chain.decode(&frame());
        assert_eq!(
            outcome,
            QrOutcome::Undecodable {
                strategies_tried: 4
            }
        );
        // Direct + contrast + crop + three rotations.
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn strategy_order_comes_from_config() {
        let calls = Arc::new(AtomicU32::new(0));
        let scanner = ScriptedScanner {
            calls: Arc::clone(&calls),
            succeed_on_call: Some(1),
        };
        let config = DecoderConfig {
            strategies: vec![StrategyKind::CroppedRegion, StrategyKind::Direct],
            crop_fraction: 0.5,
        };
        let chain = DecoderChain::new(Box::new(scanner), config);
        match chain.decode(&frame()) {
            QrOutcome::Decoded { method, .. } => {
                assert_eq!(method, StrategyKind::CroppedRegion)
            }
            _ => panic!("expected decode"),
        }
    }

    #[test]
    fn malformed_frame_is_undecodable() {
        let (chain, calls) = chain(Some(1));
        let bad = Frame::new(vec![0u8; 7], 64, 64, Utc::now(), StationId::new("test-cam"));
        assert_eq!(
            chain.decode(&bad),
            QrOutcome::Undecodable { strategies_tried: 0 }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn contrast_stretch_expands_range() {
        let mut image = GrayImage::new(2, 2);
        image.put_pixel(0, 0, image::Luma([100]));
        image.put_pixel(1, 0, image::Luma([150]));
        image.put_pixel(0, 1, image::Luma([100]));
        image.put_pixel(1, 1, image::Luma([150]));
        let stretched = stretch_contrast(&image);
        assert_eq!(stretched.get_pixel(0, 0)[0], 0);
        assert_eq!(stretched.get_pixel(1, 0)[0], 255);
    }

    #[test]
    fn center_crop_halves_dimensions() {
        let image = GrayImage::new(100, 60);
        let cropped = center_crop(&image, 0.5);
        assert_eq!(cropped.dimensions(), (50, 30));
    }
}
