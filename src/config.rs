use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::cache::{RecheckPolicy, StalenessPolicy, UncertaintyPolicy};
use crate::control::{EncodingParameters, Resolution};

const DEFAULT_LOW_RESOLUTION: f64 = 0.8;
const DEFAULT_HIGH_RESOLUTION: f64 = 1.0;
const DEFAULT_LOW_QP: u32 = 36;
const DEFAULT_HIGH_QP: u32 = 26;
const DEFAULT_BATCH_SIZE: u32 = 15;
const DEFAULT_HIGH_THRESHOLD: f64 = 0.8;
const DEFAULT_LOW_THRESHOLD: f64 = 0.3;
const DEFAULT_MAX_OBJECT_SIZE: f64 = 0.3;
const DEFAULT_MIN_OBJECT_SIZE: f64 = 0.0;
const DEFAULT_INTERSECTION_THRESHOLD: f64 = 1.0;
const DEFAULT_TRACKING_THRESHOLD: f64 = 0.3;
const DEFAULT_SUPPRESSION_THRESHOLD: f64 = 0.5;
const DEFAULT_MERGE_CONFIDENCE: f64 = 0.3;
const DEFAULT_MERGE_IOU: f64 = 0.3;
const DEFAULT_CACHE_COLS: u32 = 16;
const DEFAULT_CACHE_ROWS: u32 = 9;
const DEFAULT_REFERENCE: Resolution = Resolution::new(1920, 1080);
const DEFAULT_ENCODER_TIMEOUT_SECS: u64 = 120;
const DEFAULT_DETECTOR_TIMEOUT_SECS: u64 = 300;
const DEFAULT_BYTES_PER_FRAME: f64 = 100_000.0;
const MAX_QP: u32 = 51;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AnalysisConfigFile {
    resolution: Option<ResolutionConfigFile>,
    qp: Option<QpConfigFile>,
    batch: Option<BatchConfigFile>,
    thresholds: Option<ThresholdConfigFile>,
    merge: Option<MergeConfigFile>,
    cache: Option<CacheConfigFile>,
    encoder: Option<EncoderConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ResolutionConfigFile {
    low: Option<f64>,
    high: Option<f64>,
    reference_width: Option<u32>,
    reference_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct QpConfigFile {
    low: Option<u32>,
    high: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct BatchConfigFile {
    size: Option<u32>,
    tracker_length: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ThresholdConfigFile {
    high: Option<f64>,
    low: Option<f64>,
    max_object_size: Option<f64>,
    min_object_size: Option<f64>,
    intersection: Option<f64>,
    tracking: Option<f64>,
    suppression: Option<f64>,
    rpn_enlarge_ratio: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct MergeConfigFile {
    confidence: Option<f64>,
    iou: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct CacheConfigFile {
    cols: Option<u32>,
    rows: Option<u32>,
    max_age: Option<u32>,
    policy: Option<RecheckPolicyKind>,
}

#[derive(Debug, Deserialize, Default)]
struct EncoderConfigFile {
    enforce_iframes: Option<bool>,
    timeout_secs: Option<u64>,
    bytes_per_frame: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    timeout_secs: Option<u64>,
}

/// Which [`RecheckPolicy`] drives region selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecheckPolicyKind {
    #[default]
    Staleness,
    Uncertainty,
}

/// Tunables for one analysis run.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub low_resolution: f64,
    pub high_resolution: f64,
    pub low_qp: u32,
    pub high_qp: u32,
    pub batch_size: u32,
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub max_object_size: f64,
    pub min_object_size: f64,
    pub tracker_length: u32,
    pub intersection_threshold: f64,
    pub tracking_threshold: f64,
    pub suppression_threshold: f64,
    pub rpn_enlarge_ratio: f64,
    pub merge_confidence_threshold: f64,
    pub merge_iou_threshold: f64,
    pub cache_cols: u32,
    pub cache_rows: u32,
    /// Frames after which a cache entry is stale; `None` means twice the batch size.
    pub max_age: Option<u32>,
    pub recheck_policy: RecheckPolicyKind,
    pub reference_resolution: Resolution,
    pub enforce_iframes: bool,
    pub encoder_timeout: Duration,
    pub bytes_per_frame: f64,
    /// Longest wait for one detection call before the run aborts.
    pub detector_timeout: Duration,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            low_resolution: DEFAULT_LOW_RESOLUTION,
            high_resolution: DEFAULT_HIGH_RESOLUTION,
            low_qp: DEFAULT_LOW_QP,
            high_qp: DEFAULT_HIGH_QP,
            batch_size: DEFAULT_BATCH_SIZE,
            high_threshold: DEFAULT_HIGH_THRESHOLD,
            low_threshold: DEFAULT_LOW_THRESHOLD,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            min_object_size: DEFAULT_MIN_OBJECT_SIZE,
            tracker_length: 0,
            intersection_threshold: DEFAULT_INTERSECTION_THRESHOLD,
            tracking_threshold: DEFAULT_TRACKING_THRESHOLD,
            suppression_threshold: DEFAULT_SUPPRESSION_THRESHOLD,
            rpn_enlarge_ratio: 0.0,
            merge_confidence_threshold: DEFAULT_MERGE_CONFIDENCE,
            merge_iou_threshold: DEFAULT_MERGE_IOU,
            cache_cols: DEFAULT_CACHE_COLS,
            cache_rows: DEFAULT_CACHE_ROWS,
            max_age: None,
            recheck_policy: RecheckPolicyKind::Staleness,
            reference_resolution: DEFAULT_REFERENCE,
            enforce_iframes: true,
            encoder_timeout: Duration::from_secs(DEFAULT_ENCODER_TIMEOUT_SECS),
            bytes_per_frame: DEFAULT_BYTES_PER_FRAME,
            detector_timeout: Duration::from_secs(DEFAULT_DETECTOR_TIMEOUT_SECS),
        }
    }
}

impl AnalysisConfig {
    /// Defaults, then the file named by `STREAMDUET_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STREAMDUET_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like [`AnalysisConfig::load`] with an explicit file taking the place of `STREAMDUET_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AnalysisConfigFile) -> Self {
        let d = Self::default();
        let res = file.resolution.unwrap_or_default();
        let qp = file.qp.unwrap_or_default();
        let batch = file.batch.unwrap_or_default();
        let thr = file.thresholds.unwrap_or_default();
        let merge = file.merge.unwrap_or_default();
        let cache = file.cache.unwrap_or_default();
        let encoder = file.encoder.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        Self {
            low_resolution: res.low.unwrap_or(d.low_resolution),
            high_resolution: res.high.unwrap_or(d.high_resolution),
            low_qp: qp.low.unwrap_or(d.low_qp),
            high_qp: qp.high.unwrap_or(d.high_qp),
            batch_size: batch.size.unwrap_or(d.batch_size),
            high_threshold: thr.high.unwrap_or(d.high_threshold),
            low_threshold: thr.low.unwrap_or(d.low_threshold),
            max_object_size: thr.max_object_size.unwrap_or(d.max_object_size),
            min_object_size: thr.min_object_size.unwrap_or(d.min_object_size),
            tracker_length: batch.tracker_length.unwrap_or(d.tracker_length),
            intersection_threshold: thr.intersection.unwrap_or(d.intersection_threshold),
            tracking_threshold: thr.tracking.unwrap_or(d.tracking_threshold),
            suppression_threshold: thr.suppression.unwrap_or(d.suppression_threshold),
            rpn_enlarge_ratio: thr.rpn_enlarge_ratio.unwrap_or(d.rpn_enlarge_ratio),
            merge_confidence_threshold: merge.confidence.unwrap_or(d.merge_confidence_threshold),
            merge_iou_threshold: merge.iou.unwrap_or(d.merge_iou_threshold),
            cache_cols: cache.cols.unwrap_or(d.cache_cols),
            cache_rows: cache.rows.unwrap_or(d.cache_rows),
            max_age: cache.max_age,
            recheck_policy: cache.policy.unwrap_or(d.recheck_policy),
            reference_resolution: Resolution::new(
                res.reference_width.unwrap_or(d.reference_resolution.width),
                res.reference_height.unwrap_or(d.reference_resolution.height),
            ),
            enforce_iframes: encoder.enforce_iframes.unwrap_or(d.enforce_iframes),
            encoder_timeout: encoder
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(d.encoder_timeout),
            bytes_per_frame: encoder.bytes_per_frame.unwrap_or(d.bytes_per_frame),
            detector_timeout: detector
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(d.detector_timeout),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(size) = env_parse::<u32>("STREAMDUET_BATCH_SIZE", "an integer frame count")? {
            self.batch_size = size;
        }
        if let Some(qp) = env_parse::<u32>("STREAMDUET_LOW_QP", "an integer qp")? {
            self.low_qp = qp;
        }
        if let Some(qp) = env_parse::<u32>("STREAMDUET_HIGH_QP", "an integer qp")? {
            self.high_qp = qp;
        }
        if let Some(res) = env_parse::<f64>("STREAMDUET_LOW_RESOLUTION", "a scale factor")? {
            self.low_resolution = res;
        }
        if let Some(res) = env_parse::<f64>("STREAMDUET_HIGH_RESOLUTION", "a scale factor")? {
            self.high_resolution = res;
        }
        if let Some(len) = env_parse::<u32>("STREAMDUET_TRACKER_LENGTH", "an integer frame count")? {
            self.tracker_length = len;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow!("batch size must be greater than zero"));
        }
        for (name, value) in [
            ("low resolution", self.low_resolution),
            ("high resolution", self.high_resolution),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(anyhow!("{} must be in (0, 1], got {}", name, value));
            }
        }
        for (name, qp) in [("low qp", self.low_qp), ("high qp", self.high_qp)] {
            if qp > MAX_QP {
                return Err(anyhow!("{} must be at most {}, got {}", name, MAX_QP, qp));
            }
        }
        for (name, value) in [
            ("high threshold", self.high_threshold),
            ("low threshold", self.low_threshold),
            ("max object size", self.max_object_size),
            ("min object size", self.min_object_size),
            ("intersection threshold", self.intersection_threshold),
            ("tracking threshold", self.tracking_threshold),
            ("suppression threshold", self.suppression_threshold),
            ("merge confidence threshold", self.merge_confidence_threshold),
            ("merge iou threshold", self.merge_iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be in [0, 1], got {}", name, value));
            }
        }
        if self.low_threshold > self.high_threshold {
            return Err(anyhow!("low threshold must not exceed high threshold"));
        }
        if self.min_object_size > self.max_object_size {
            return Err(anyhow!("min object size must not exceed max object size"));
        }
        if self.rpn_enlarge_ratio < 0.0 {
            return Err(anyhow!("rpn enlarge ratio must not be negative"));
        }
        if self.cache_cols == 0 || self.cache_rows == 0 {
            return Err(anyhow!("cache grid must have at least one block"));
        }
        if self.reference_resolution.width == 0 || self.reference_resolution.height == 0 {
            return Err(anyhow!("reference resolution must be non-empty"));
        }
        if self.encoder_timeout.is_zero() {
            return Err(anyhow!("encoder timeout must be greater than zero"));
        }
        if self.detector_timeout.is_zero() {
            return Err(anyhow!("detector timeout must be greater than zero"));
        }
        if self.bytes_per_frame < 0.0 {
            return Err(anyhow!("bytes per frame must not be negative"));
        }
        Ok(())
    }

    pub fn cache_max_age(&self) -> u32 {
        self.max_age
            .unwrap_or_else(|| self.batch_size.saturating_mul(2))
    }

    /// Parameters in force before any bandwidth sample.
    pub fn initial_parameters(&self) -> EncodingParameters {
        EncodingParameters {
            low_qp: self.low_qp,
            high_qp: self.high_qp,
            resolution: Resolution::scaled(self.reference_resolution, self.low_resolution),
        }
    }

    pub fn build_recheck_policy(&self) -> Box<dyn RecheckPolicy> {
        match self.recheck_policy {
            RecheckPolicyKind::Staleness => Box::new(StalenessPolicy::from_config(self)),
            RecheckPolicyKind::Uncertainty => Box::new(UncertaintyPolicy::from_config(self)),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, expected: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}", name, expected)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<AnalysisConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AnalysisConfig::default();
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.cache_max_age(), 30);
        assert_eq!(
            cfg.initial_parameters().resolution,
            Resolution::new(1536, 864)
        );
    }

    #[test]
    fn file_sections_override_defaults() {
        let file: AnalysisConfigFile = serde_json::from_str(
            r#"{"qp": {"low": 40}, "batch": {"size": 5}, "cache": {"policy": "uncertainty", "max_age": 7}, "detector": {"timeout_secs": 9}}"#,
        )
        .expect("parse");
        let cfg = AnalysisConfig::from_file(file);
        assert_eq!(cfg.low_qp, 40);
        assert_eq!(cfg.high_qp, DEFAULT_HIGH_QP);
        assert_eq!(cfg.batch_size, 5);
        assert_eq!(cfg.cache_max_age(), 7);
        assert_eq!(cfg.recheck_policy, RecheckPolicyKind::Uncertainty);
        assert_eq!(cfg.build_recheck_policy().name(), "uncertainty");
        assert_eq!(cfg.detector_timeout, Duration::from_secs(9));
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let bad = [
            AnalysisConfig {
                batch_size: 0,
                ..AnalysisConfig::default()
            },
            AnalysisConfig {
                high_qp: 60,
                ..AnalysisConfig::default()
            },
            AnalysisConfig {
                low_resolution: 0.0,
                ..AnalysisConfig::default()
            },
            AnalysisConfig {
                suppression_threshold: 1.5,
                ..AnalysisConfig::default()
            },
            AnalysisConfig {
                low_threshold: 0.9,
                ..AnalysisConfig::default()
            },
            AnalysisConfig {
                detector_timeout: Duration::ZERO,
                ..AnalysisConfig::default()
            },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{:?} should be rejected", cfg);
        }
    }
}
