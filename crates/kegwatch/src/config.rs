//! Station configuration.
//!
//! One `kegwatch.toml` per station. Every tuning knob the components
//! expose is surfaced here; the aggregation policy is deliberately
//! required so an operator cannot run a station without choosing how
//! multiple views of one pallet combine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use kegwatch_capture::CaptureConfig;
use kegwatch_protocol::{AggregationPolicy, StrategyKind};
use kegwatch_sync::SyncConfig;
use kegwatch_vision::{DecoderConfig, DetectorConfig};
use serde::{Deserialize, Serialize};

use crate::drivers::SimPallet;

pub const DEFAULT_CONFIG_NAME: &str = "kegwatch.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default)]
    pub camera: CameraSection,
    #[serde(default)]
    pub detector: DetectorSection,
    #[serde(default)]
    pub decoder: DecoderSection,
    pub pallet: PalletSection,
    #[serde(default)]
    pub cloud: CloudSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub sim: SimSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSection {
    #[serde(default = "default_source_id")]
    pub source_id: String,
    #[serde(default = "default_frame_width")]
    pub width: u32,
    #[serde(default = "default_frame_height")]
    pub height: u32,
    /// Auto-capture cadence. Absent means manual triggers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_interval_secs: Option<u64>,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            source_id: default_source_id(),
            width: default_frame_width(),
            height: default_frame_height(),
            auto_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSection {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: u32,
    #[serde(default = "default_stabilize_timeout_secs")]
    pub stabilize_timeout_secs: u64,
    #[serde(default = "default_evaluate_timeout_secs")]
    pub evaluate_timeout_secs: u64,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_auto_retry_budget")]
    pub auto_retry_budget: u32,
    #[serde(default = "default_auto_cooldown_secs")]
    pub auto_cooldown_secs: u64,
    /// Luma cutoff for the built-in bring-up detector.
    #[serde(default = "default_blob_luma")]
    pub blob_luma: u8,
    /// Minimum connected area, in pixels, the bring-up detector counts.
    #[serde(default = "default_blob_min_area")]
    pub blob_min_area: u32,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            stability_threshold: default_stability_threshold(),
            stabilize_timeout_secs: default_stabilize_timeout_secs(),
            evaluate_timeout_secs: default_evaluate_timeout_secs(),
            frame_interval_ms: default_frame_interval_ms(),
            auto_retry_budget: default_auto_retry_budget(),
            auto_cooldown_secs: default_auto_cooldown_secs(),
            blob_luma: default_blob_luma(),
            blob_min_area: default_blob_min_area(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderSection {
    /// Priority order of the decode chain. Removing an entry disables it.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyKind>,
    #[serde(default = "default_crop_fraction")]
    pub crop_fraction: f32,
}

impl Default for DecoderSection {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
            crop_fraction: default_crop_fraction(),
        }
    }
}

/// The aggregation policy has no default on purpose: summing views and
/// taking the best view give different totals, and the choice belongs
/// to whoever lays out the station, not to this codebase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PalletSection {
    pub aggregation: AggregationPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_keg_type: Option<String>,
    /// Keg type -> expected kegs per full pallet.
    #[serde(default)]
    pub expected_counts: BTreeMap<String, u32>,
}

impl PalletSection {
    /// Expected count for a freshly started pallet, from the default
    /// keg type. Absent means no auto-completion rule.
    pub fn expected_count(&self) -> Option<u32> {
        let keg_type = self.default_keg_type.as_deref()?;
        self.expected_counts.get(keg_type).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_cloud_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Retired FAILED deliveries older than this are purged at recovery.
    #[serde(default = "default_failed_retention_days")]
    pub failed_retention_days: u32,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_cloud_timeout_secs(),
            backoff_secs: default_backoff_secs(),
            max_attempts: default_max_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
            failed_retention_days: default_failed_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Scripted pallets for the built-in simulation rig. Empty outside
/// bring-up; production stations feed real frames through the
/// `FrameSource` seam instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimSection {
    #[serde(default)]
    pub pallets: Vec<SimPallet>,
}

fn default_source_id() -> String {
    "station-01".to_string()
}

fn default_frame_width() -> u32 {
    640
}

fn default_frame_height() -> u32 {
    480
}

fn default_confidence_threshold() -> f32 {
    0.25
}

fn default_stability_threshold() -> u32 {
    5
}

fn default_stabilize_timeout_secs() -> u64 {
    10
}

fn default_evaluate_timeout_secs() -> u64 {
    5
}

fn default_frame_interval_ms() -> u64 {
    33
}

fn default_auto_retry_budget() -> u32 {
    3
}

fn default_auto_cooldown_secs() -> u64 {
    10
}

fn default_blob_luma() -> u8 {
    200
}

fn default_blob_min_area() -> u32 {
    64
}

fn default_strategies() -> Vec<StrategyKind> {
    vec![
        StrategyKind::Direct,
        StrategyKind::ContrastEnhanced,
        StrategyKind::CroppedRegion,
        StrategyKind::RotatedVariants,
    ]
}

fn default_crop_fraction() -> f32 {
    0.5
}

fn default_endpoint() -> String {
    "http://127.0.0.1:5001/api/kegs/pallet-record".to_string()
}

fn default_cloud_timeout_secs() -> u64 {
    10
}

fn default_backoff_secs() -> Vec<u64> {
    vec![60, 120, 240, 480, 960]
}

fn default_max_attempts() -> u32 {
    6
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_failed_retention_days() -> u32 {
    7
}

fn default_database_path() -> PathBuf {
    kegwatch_logging::kegwatch_home().join("kegwatch.db")
}

impl StationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: StationConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Default config location: `$KEGWATCH_HOME/kegwatch.toml`.
    pub fn default_path() -> PathBuf {
        kegwatch_logging::kegwatch_home().join(DEFAULT_CONFIG_NAME)
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            stability_threshold: self.detector.stability_threshold,
            stabilize_timeout: Duration::from_secs(self.detector.stabilize_timeout_secs),
            evaluate_timeout: Duration::from_secs(self.detector.evaluate_timeout_secs),
            frame_interval: Duration::from_millis(self.detector.frame_interval_ms),
            auto_retry_budget: self.detector.auto_retry_budget,
            auto_cooldown: Duration::from_secs(self.detector.auto_cooldown_secs),
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            confidence_threshold: self.detector.confidence_threshold,
        }
    }

    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            strategies: self.decoder.strategies.clone(),
            crop_fraction: self.decoder.crop_fraction,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_secs(self.cloud.poll_interval_secs),
            backoff: self
                .cloud
                .backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            max_attempts: self.cloud.max_attempts,
        }
    }

    pub fn failed_retention_ms(&self) -> i64 {
        self.cloud.failed_retention_days as i64 * 24 * 60 * 60 * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[pallet]
aggregation = "sum"
"#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: StationConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.pallet.aggregation, AggregationPolicy::Sum);
        assert_eq!(config.camera.source_id, "station-01");
        assert_eq!(config.detector.stability_threshold, 5);
        assert_eq!(config.decoder.strategies.len(), 4);
        assert_eq!(config.cloud.backoff_secs, vec![60, 120, 240, 480, 960]);
        assert_eq!(config.cloud.max_attempts, 6);
        assert!(config.camera.auto_interval_secs.is_none());
        assert!(config.pallet.expected_count().is_none());
        assert!(config.sim.pallets.is_empty());
    }

    #[test]
    fn aggregation_policy_is_required() {
        let err = toml::from_str::<StationConfig>("[camera]\nsource_id = 'x'\n");
        assert!(err.is_err());
        let err = toml::from_str::<StationConfig>("[pallet]\n");
        assert!(err.is_err());
    }

    #[test]
    fn full_config_roundtrip() {
        let raw = r#"
[camera]
source_id = "icam-540"
width = 1280
height = 720
auto_interval_secs = 30

[detector]
confidence_threshold = 0.4
stability_threshold = 3

[decoder]
strategies = ["cropped_region", "direct"]
crop_fraction = 0.6

[pallet]
aggregation = "best_view"
default_keg_type = "euro_50l"

[pallet.expected_counts]
euro_50l = 8
slim_30l = 12

[cloud]
endpoint = "https://inventory.example.com/api/kegs/pallet-record"
backoff_secs = [10, 20]
max_attempts = 3

[[sim.pallets]]
payload = "PAL-001"
kegs = 4
frames = 20
"#;
        let config: StationConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.pallet.aggregation, AggregationPolicy::BestView);
        assert_eq!(config.pallet.expected_count(), Some(8));
        assert_eq!(
            config.decoder.strategies,
            vec![StrategyKind::CroppedRegion, StrategyKind::Direct]
        );
        assert_eq!(config.camera.auto_interval_secs, Some(30));
        assert_eq!(config.sim.pallets.len(), 1);
        assert_eq!(config.sim.pallets[0].kegs, 4);

        let encoded = toml::to_string_pretty(&config).unwrap();
        let parsed: StationConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(parsed.pallet.expected_counts.len(), 2);
        assert_eq!(parsed.cloud.backoff_secs, vec![10, 20]);
    }

    #[test]
    fn derived_component_configs() {
        let config: StationConfig = toml::from_str(MINIMAL).unwrap();
        let capture = config.capture_config();
        assert_eq!(capture.stabilize_timeout, Duration::from_secs(10));
        assert_eq!(capture.frame_interval, Duration::from_millis(33));

        let sync = config.sync_config();
        assert_eq!(sync.backoff.first(), Some(&Duration::from_secs(60)));
        assert_eq!(config.failed_retention_ms(), 7 * 24 * 60 * 60 * 1000);
    }
}
