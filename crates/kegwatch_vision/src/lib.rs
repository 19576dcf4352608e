//! Perception layer: keg detection and QR decoding.
//!
//! The neural detector and the low-level QR symbol reader are opaque
//! behind traits; this crate owns everything around them - confidence
//! filtering, the ordered fallback decode chain, and the frame
//! preprocessing each strategy applies.

pub mod decode;
pub mod detector;

pub use decode::{DecoderChain, DecoderConfig, QrScanner, ScanHit};
pub use detector::{count_kegs, ensure_well_formed, DetectorConfig, DetectorError, KegDetector};
