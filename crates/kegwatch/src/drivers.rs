//! Built-in bring-up drivers.
//!
//! Production stations plug their camera SDK, trained detection model,
//! and QR symbol reader in behind [`FrameSource`], [`KegDetector`] and
//! [`QrScanner`]. What lives here is the simulation rig used to bring a
//! station up and to exercise the full pipeline without hardware: a
//! scripted camera that renders synthetic pallet scenes, a connected-
//! component blob counter, and a scanner for the label strip the sim
//! camera embeds in its frames.

use std::collections::VecDeque;

use anyhow::Result;
use chrono::Utc;
use image::GrayImage;
use kegwatch_capture::FrameSource;
use kegwatch_protocol::{BoundingBox, Detection, Frame, StationId};
use kegwatch_vision::{ensure_well_formed, DetectorError, KegDetector, QrScanner, ScanHit};
use serde::{Deserialize, Serialize};

/// Marks the label strip in row 0 of a sim frame.
const LABEL_MAGIC: [u8; 2] = [0x4b, 0x51];
/// Rows reserved for the label strip; kegs are drawn below this.
const LABEL_BAND: u32 = 4;
/// Side length of one rendered keg blob.
const KEG_SIDE: u32 = 24;
const KEG_GAP: u32 = 8;

/// One scripted pallet passing under the sim camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimPallet {
    /// Payload the label strip carries; empty renders no label.
    pub payload: String,
    pub kegs: u32,
    /// How many identical frames this scene yields.
    #[serde(default = "default_sim_frames")]
    pub frames: u32,
}

fn default_sim_frames() -> u32 {
    30
}

/// Scripted frame source. Scenes are rendered lazily, one queue entry
/// per frame; an exhausted script yields `None` forever.
pub struct SimCamera {
    station: StationId,
    width: u32,
    height: u32,
    scenes: VecDeque<(String, u32)>,
}

impl SimCamera {
    pub fn new(station: StationId, width: u32, height: u32, script: &[SimPallet]) -> Self {
        let mut scenes = VecDeque::new();
        for pallet in script {
            for _ in 0..pallet.frames {
                scenes.push_back((pallet.payload.clone(), pallet.kegs));
            }
        }
        Self {
            station,
            width,
            height,
            scenes,
        }
    }

    /// A camera holding a single scene, handy in tests.
    pub fn single(
        station: StationId,
        width: u32,
        height: u32,
        payload: &str,
        kegs: u32,
        frames: u32,
    ) -> Self {
        Self::new(
            station,
            width,
            height,
            &[SimPallet {
                payload: payload.to_string(),
                kegs,
                frames,
            }],
        )
    }

    fn render(&self, payload: &str, kegs: u32) -> Frame {
        let mut pixels = vec![0u8; (self.width * self.height) as usize];
        encode_label(&mut pixels[..self.width as usize], payload);

        // Kegs as bright squares on a grid below the label band.
        let pitch = KEG_SIDE + KEG_GAP;
        let cols = (self.width / pitch).max(1);
        for keg in 0..kegs {
            let col = keg % cols;
            let row = keg / cols;
            let x0 = col * pitch + KEG_GAP / 2;
            let y0 = LABEL_BAND + KEG_GAP + row * pitch;
            for y in y0..(y0 + KEG_SIDE).min(self.height) {
                for x in x0..(x0 + KEG_SIDE).min(self.width) {
                    pixels[(y * self.width + x) as usize] = 255;
                }
            }
        }

        Frame::new(
            pixels,
            self.width,
            self.height,
            Utc::now(),
            self.station.clone(),
        )
    }
}

impl FrameSource for SimCamera {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some((payload, kegs)) = self.scenes.pop_front() else {
            return Ok(None);
        };
        Ok(Some(self.render(&payload, kegs)))
    }
}

/// Write `[magic, magic, len, bytes.., xor]` into the first pixel row.
/// Payloads that do not fit leave the row dark (undecodable scene).
fn encode_label(row: &mut [u8], payload: &str) {
    let bytes = payload.as_bytes();
    if bytes.is_empty() || bytes.len() > u8::MAX as usize || bytes.len() + 4 > row.len() {
        return;
    }
    row[0] = LABEL_MAGIC[0];
    row[1] = LABEL_MAGIC[1];
    row[2] = bytes.len() as u8;
    row[3..3 + bytes.len()].copy_from_slice(bytes);
    row[3 + bytes.len()] = bytes.iter().fold(0u8, |acc, b| acc ^ b);
}

fn decode_label(image: &GrayImage) -> Option<String> {
    let (width, height) = image.dimensions();
    if height == 0 || width < 4 {
        return None;
    }
    let row: Vec<u8> = (0..width).map(|x| image.get_pixel(x, 0)[0]).collect();
    if row[0] != LABEL_MAGIC[0] || row[1] != LABEL_MAGIC[1] {
        return None;
    }
    let len = row[2] as usize;
    if len == 0 || len + 4 > row.len() {
        return None;
    }
    let bytes = &row[3..3 + len];
    let checksum = bytes.iter().fold(0u8, |acc, b| acc ^ b);
    if row[3 + len] != checksum {
        return None;
    }
    String::from_utf8(bytes.to_vec()).ok()
}

/// Reads the sim camera's label strip. Stands in for the station's QR
/// symbol reader.
pub struct LabelStripScanner;

impl QrScanner for LabelStripScanner {
    fn scan(&self, image: &GrayImage) -> Option<ScanHit> {
        decode_label(image).map(|payload| ScanHit {
            payload,
            quality: 1.0,
        })
    }
}

/// Connected-component counter over bright pixels. The bring-up stand-in
/// for the trained keg model; deterministic for identical frames.
pub struct LumaBlobDetector {
    pub luma_threshold: u8,
    pub min_area: u32,
}

impl LumaBlobDetector {
    pub fn new(luma_threshold: u8, min_area: u32) -> Self {
        Self {
            luma_threshold,
            min_area,
        }
    }
}

impl KegDetector for LumaBlobDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        ensure_well_formed(frame)?;
        let width = frame.width as usize;
        let height = frame.height as usize;
        let mut visited = vec![false; width * height];
        let mut detections = Vec::new();

        for start in 0..width * height {
            if visited[start] || frame.pixels[start] < self.luma_threshold {
                continue;
            }

            // Flood fill one component, 4-connected.
            let mut stack = vec![start];
            visited[start] = true;
            let mut area = 0u32;
            let (mut min_x, mut min_y) = (width, height);
            let (mut max_x, mut max_y) = (0usize, 0usize);
            while let Some(index) = stack.pop() {
                area += 1;
                let (x, y) = (index % width, index / width);
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);

                let mut push = |nx: usize, ny: usize| {
                    let ni = ny * width + nx;
                    if !visited[ni] && frame.pixels[ni] >= self.luma_threshold {
                        visited[ni] = true;
                        stack.push(ni);
                    }
                };
                if x > 0 {
                    push(x - 1, y);
                }
                if x + 1 < width {
                    push(x + 1, y);
                }
                if y > 0 {
                    push(x, y - 1);
                }
                if y + 1 < height {
                    push(x, y + 1);
                }
            }

            if area < self.min_area {
                continue;
            }
            let bbox_w = (max_x - min_x + 1) as f32;
            let bbox_h = (max_y - min_y + 1) as f32;
            // Solid upright kegs fill their box; ragged components score
            // lower and fall under the counting threshold.
            let fill = area as f32 / (bbox_w * bbox_h);
            detections.push(Detection::new(
                BoundingBox {
                    x: min_x as f32,
                    y: min_y as f32,
                    width: bbox_w,
                    height: bbox_h,
                },
                fill,
            ));
        }

        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::imageops;
    use kegwatch_protocol::{QrOutcome, StrategyKind};
    use kegwatch_vision::{DecoderChain, DecoderConfig};

    fn frame_to_gray(frame: &Frame) -> GrayImage {
        GrayImage::from_raw(frame.width, frame.height, frame.pixels.clone()).unwrap()
    }

    fn sim_frame(payload: &str, kegs: u32) -> Frame {
        let mut camera = SimCamera::single(StationId::new("sim"), 320, 240, payload, kegs, 1);
        camera.next_frame().unwrap().unwrap()
    }

    #[test]
    fn rendered_kegs_are_detected() {
        let frame = sim_frame("PAL-001", 5);
        let detector = LumaBlobDetector::new(200, 64);
        let detections = detector.detect(&frame).unwrap();
        assert_eq!(detections.len(), 5);
        for detection in detections {
            assert!(detection.confidence > 0.9);
        }
    }

    #[test]
    fn label_strip_does_not_count_as_a_keg() {
        let frame = sim_frame("PAL-001", 0);
        let detector = LumaBlobDetector::new(200, 64);
        assert!(detector.detect(&frame).unwrap().is_empty());
    }

    #[test]
    fn label_roundtrips_through_the_scanner() {
        let frame = sim_frame("PAL-001", 3);
        let hit = LabelStripScanner.scan(&frame_to_gray(&frame)).unwrap();
        assert_eq!(hit.payload, "PAL-001");
    }

    #[test]
    fn rotated_frame_loses_the_label() {
        let frame = sim_frame("PAL-001", 3);
        let rotated = imageops::rotate90(&frame_to_gray(&frame));
        assert!(LabelStripScanner.scan(&rotated).is_none());
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let frame = sim_frame("PAL-001", 0);
        let mut image = frame_to_gray(&frame);
        let len = image.get_pixel(2, 0)[0] as u32;
        image.put_pixel(3 + len, 0, image::Luma([0x7f]));
        assert!(LabelStripScanner.scan(&image).is_none());
    }

    #[test]
    fn decode_chain_over_sim_frames_hits_on_direct() {
        let chain = DecoderChain::new(Box::new(LabelStripScanner), DecoderConfig::default());
        match chain.decode(&sim_frame("PAL-042", 2)) {
            QrOutcome::Decoded {
                payload, method, ..
            } => {
                assert_eq!(payload, "PAL-042");
                assert_eq!(method, StrategyKind::Direct);
            }
            other => panic!("expected decode, got {other:?}"),
        }
    }

    #[test]
    fn unlabeled_scene_is_undecodable() {
        let chain = DecoderChain::new(Box::new(LabelStripScanner), DecoderConfig::default());
        assert!(!chain.decode(&sim_frame("", 2)).is_decoded());
    }

    #[test]
    fn camera_script_exhausts_to_none() {
        let mut camera =
            SimCamera::single(StationId::new("sim"), 320, 240, "PAL-001", 2, 3);
        for _ in 0..3 {
            assert!(camera.next_frame().unwrap().is_some());
        }
        assert!(camera.next_frame().unwrap().is_none());
    }

    #[test]
    fn oversized_payload_leaves_scene_unlabeled() {
        let long = "X".repeat(400);
        let mut camera = SimCamera::single(StationId::new("sim"), 64, 64, &long, 1, 1);
        let frame = camera.next_frame().unwrap().unwrap();
        assert!(LabelStripScanner.scan(&frame_to_gray(&frame)).is_none());
    }
}
