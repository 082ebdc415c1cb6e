//! Accuracy scoring against ground truth.
//!
//! Both sides are filtered per frame (relevant labels, confidence floor,
//! maximum box area), then a detection is a true positive when any remaining
//! ground-truth box on its frame reaches the IoU threshold. Ground-truth boxes
//! with no such detection are false negatives.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::geometry::iou;
use crate::region::Region;
use crate::results::ResultSet;

#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationConfig {
    pub relevant_labels: Vec<String>,
    pub ground_truth_confidence: f64,
    pub detection_confidence: f64,
    pub ground_truth_max_area: f64,
    pub detection_max_area: f64,
    pub iou_threshold: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            relevant_labels: vec!["vehicle".to_string()],
            ground_truth_confidence: 0.3,
            detection_confidence: 0.5,
            ground_truth_max_area: 0.04,
            detection_max_area: 0.04,
            iou_threshold: 0.3,
        }
    }
}

impl EvaluationConfig {
    fn keeps(&self, region: &Region, min_confidence: f64, max_area: f64) -> bool {
        region.confidence >= min_confidence
            && region.w * region.h <= max_area
            && self.relevant_labels.iter().any(|l| *l == region.label)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    /// Ground-truth boxes matched by at least one detection.
    pub matched_ground_truth: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub missing_detection_frames: usize,
    pub missing_ground_truth_frames: usize,
}

impl EvaluationSummary {
    /// Recoverable conditions worth recording next to the scores.
    pub fn notes(&self) -> String {
        let mut notes = Vec::new();
        if self.missing_detection_frames > 0 {
            notes.push(format!("missing_dt_frames={}", self.missing_detection_frames));
        }
        if self.missing_ground_truth_frames > 0 {
            notes.push(format!("missing_gt_frames={}", self.missing_ground_truth_frames));
        }
        notes.join(";")
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        round3(num / den)
    }
}

/// Scores frames `0..=max_frame` of `detections` against `ground_truth`.
///
/// A frame absent from either side is logged, counted and scored as empty.
pub fn evaluate(
    max_frame: u32,
    detections: &ResultSet,
    ground_truth: &ResultSet,
    config: &EvaluationConfig,
) -> EvaluationSummary {
    let dt_map = detections.frame_map();
    let gt_map = ground_truth.frame_map();
    let mut summary = EvaluationSummary::default();

    for frame_id in 0..=max_frame {
        let dt = frame_or_empty(&dt_map, frame_id, "detections", &mut summary.missing_detection_frames);
        let gt = frame_or_empty(&gt_map, frame_id, "ground truth", &mut summary.missing_ground_truth_frames);

        let dt: Vec<&Region> = dt
            .iter()
            .filter(|r| config.keeps(r, config.detection_confidence, config.detection_max_area))
            .collect();
        let gt: Vec<&Region> = gt
            .iter()
            .filter(|r| config.keeps(r, config.ground_truth_confidence, config.ground_truth_max_area))
            .collect();

        let matches = |a: &Region, b: &Region| iou(&a.rect(), &b.rect()) >= config.iou_threshold;
        for &d in &dt {
            if gt.iter().any(|&g| matches(d, g)) {
                summary.true_positives += 1;
            } else {
                summary.false_positives += 1;
            }
        }
        for &g in &gt {
            if dt.iter().any(|&d| matches(d, g)) {
                summary.matched_ground_truth += 1;
            } else {
                summary.false_negatives += 1;
            }
        }
    }

    let tp = summary.true_positives as f64;
    let fp = summary.false_positives as f64;
    let fn_ = summary.false_negatives as f64;
    summary.precision = ratio(tp, tp + fp);
    summary.recall = ratio(tp, tp + fn_);
    summary.f1 = ratio(2.0 * tp, 2.0 * tp + fp + fn_);
    summary
}

fn frame_or_empty<'a>(
    map: &'a BTreeMap<u32, Vec<Region>>,
    frame_id: u32,
    side: &str,
    missing: &mut usize,
) -> &'a [Region] {
    match map.get(&frame_id) {
        Some(regions) => regions.as_slice(),
        None => {
            log::warn!("frame {} not found in {}", frame_id, side);
            *missing += 1;
            &[]
        }
    }
}

/// Confidences of detections that do (`.0`) and do not (`.1`) match any
/// ground-truth box on their frame at `iou_threshold`.
pub fn split_scores(
    detections: &ResultSet,
    ground_truth: &ResultSet,
    iou_threshold: f64,
) -> (Vec<f64>, Vec<f64>) {
    let mut positives = Vec::new();
    let mut negatives = Vec::new();
    for det in detections.iter().filter(|r| !r.is_placeholder()) {
        let matched = ground_truth
            .regions_for_frame(det.frame_id)
            .filter(|g| !g.is_placeholder())
            .any(|g| iou(&det.rect(), &g.rect()) >= iou_threshold);
        if matched {
            positives.push(det.confidence);
        } else {
            negatives.push(det.confidence);
        }
    }
    (positives, negatives)
}
