//! StreamDuet analytics core
//!
//! This crate implements the region-result model and merge engine behind a
//! two-phase (edge/cloud) video analytics pipeline, plus the bandwidth-adaptive
//! batch loop that drives it.
//!
//! # Architecture
//!
//! Every batch of frames goes through the same sequence:
//!
//! 1. **Low phase**: whole frames are encoded at low resolution/quality and analyzed.
//! 2. **Region select**: the RoI cache and the low-phase detections decide which
//!    boxes deserve a high-quality second look.
//! 3. **High phase**: only those boxes are encoded at high quality and re-analyzed.
//! 4. **Cache update**: confirmed detections are folded back into the RoI cache.
//!
//! After the last batch the accumulated results are gap-filled, merged into one
//! region per object per frame and written to a result file.
//!
//! # Module Structure
//!
//! - `geometry`: IoU and exact union area of rectangle sets
//! - `region` / `results`: the detection record and its frame-indexed container
//! - `merge`: overlap-graph clustering across detectors
//! - `cache`: RoI cache state and re-check policies
//! - `control`: bandwidth-driven encoding parameters
//! - `detect`, `encode`, `frames`: external collaborators (detector, codec, frames)
//! - `pipeline`: the batch orchestrator
//! - `evaluate`, `stats`: accuracy scoring and the statistics file

use std::fmt;
use std::ops::Range;

pub mod cache;
pub mod config;
pub mod control;
pub mod detect;
pub mod encode;
pub mod evaluate;
pub mod frames;
pub mod geometry;
pub mod merge;
pub mod pipeline;
pub mod region;
pub mod results;
pub mod stats;

pub use cache::{RecheckPolicy, RoiCache, StalenessPolicy};
pub use config::AnalysisConfig;
pub use control::{
    select_parameters, BandwidthMonitor, EncodingParameters, ParameterController, Resolution,
    StaticBandwidth,
};
pub use detect::{DetectRequest, DetectorBackend, DetectorRegistry, ReplayBackend};
pub use encode::{AreaEstimator, EncodeRequest, EncodedBatch, Encoder};
pub use evaluate::{evaluate, split_scores, EvaluationConfig, EvaluationSummary};
pub use frames::{FrameDirectory, FrameSource, SyntheticFrames};
pub use geometry::{iou, union_area, union_area_of_frame, Rect};
pub use merge::merge_boxes;
pub use pipeline::{
    AnalysisOutcome, BatchPipeline, BatchReport, BatchState, PhaseTimings, PipelineError,
};
pub use region::{Region, GENERIC_ORIGIN, NO_OBJECT_LABEL, WILDCARD_LABEL};
pub use results::ResultSet;
pub use stats::{write_stats, StatsRow};

// -------------------- Frame Ranges --------------------

/// Half-open range of frame ids `[start, end)` processed as one batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameRange {
    pub start: u32,
    pub end: u32,
}

impl FrameRange {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end, "frame range start must not exceed end");
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, frame_id: u32) -> bool {
        frame_id >= self.start && frame_id < self.end
    }

    pub fn frames(&self) -> Range<u32> {
        self.start..self.end
    }

    /// Splits `[0, total)` into consecutive batches of at most `batch_size` frames.
    pub fn batches(total: u32, batch_size: u32) -> impl Iterator<Item = FrameRange> {
        let step = batch_size.max(1);
        (0..total)
            .step_by(step as usize)
            .map(move |start| FrameRange::new(start, total.min(start.saturating_add(step))))
    }
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// -------------------- Phases --------------------

/// Pipeline tier that produced (or is requesting) a set of regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Low,
    High,
}

impl Phase {
    /// Origin tag stamped on regions detected in this phase.
    pub fn origin(self) -> &'static str {
        match self {
            Phase::Low => "low",
            Phase::High => "high",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Low => "low phase",
            Phase::High => "high phase",
        })
    }
}
