//! Batch orchestrator.
//!
//! One [`BatchPipeline`] owns the RoI cache and the running result sets of a
//! single video. Batches run strictly in frame order; inside a batch the states
//! follow `LowPhase -> RegionSelect -> HighPhase -> CacheUpdate`, with the high
//! phase skipped when the re-check policy selects nothing. The cancellation
//! flag is checked before every state.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{RecheckPolicy, RoiCache};
use crate::config::AnalysisConfig;
use crate::control::{BandwidthMonitor, EncodingParameters, ParameterController};
use crate::detect::{DetectError, DetectRequest, DetectorRegistry};
use crate::encode::{EncodeRequest, Encoder};
use crate::frames::FrameSource;
use crate::merge::merge_results;
use crate::region::Region;
use crate::results::ResultSet;
use crate::{FrameRange, Phase};

mod error;

pub use error::PipelineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchState {
    LowPhase,
    RegionSelect,
    HighPhase,
    CacheUpdate,
    Done,
}

impl BatchState {
    /// State in which `phase` is encoded and detected.
    pub fn during(phase: Phase) -> Self {
        match phase {
            Phase::Low => BatchState::LowPhase,
            Phase::High => BatchState::HighPhase,
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchState::LowPhase => "low phase",
            BatchState::RegionSelect => "region selection",
            BatchState::HighPhase => "high phase",
            BatchState::CacheUpdate => "cache update",
            BatchState::Done => "result merge",
        })
    }
}

/// Wall-clock time spent per concern, summed over batches.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PhaseTimings {
    /// Encoding both phases.
    pub transmission: Duration,
    /// Low-phase detection.
    pub inference_reuse: Duration,
    /// Region selection.
    pub roi_prediction: Duration,
    /// High-phase detection.
    pub inference_sharing: Duration,
    pub total: Duration,
}

/// Per-batch summary handed to the progress callback.
#[derive(Clone, Debug)]
pub struct BatchReport {
    pub range: FrameRange,
    pub parameters: EncodingParameters,
    pub low_resolution: f64,
    pub low_bytes: u64,
    pub high_bytes: u64,
    pub low_detections: usize,
    pub rechecked_regions: usize,
    pub high_detections: usize,
}

#[derive(Clone, Debug)]
pub struct AnalysisOutcome {
    /// Merged, gap-filled results as written to the result file.
    pub results: ResultSet,
    pub low_results: ResultSet,
    pub high_results: ResultSet,
    pub low_bytes: u64,
    pub high_bytes: u64,
    pub frame_count: u32,
    pub batches: usize,
    pub timings: PhaseTimings,
    /// Parameters in force for the last batch.
    pub final_parameters: EncodingParameters,
    /// Low-phase resolution factor used by the last batch.
    pub final_low_resolution: f64,
}

impl AnalysisOutcome {
    pub fn total_bytes(&self) -> u64 {
        self.low_bytes + self.high_bytes
    }
}

type ProgressFn = Box<dyn FnMut(&BatchReport) + Send>;

pub struct BatchPipeline {
    config: AnalysisConfig,
    frames: Box<dyn FrameSource>,
    encoder: Box<dyn Encoder>,
    detectors: DetectorRegistry,
    policy: Box<dyn RecheckPolicy>,
    controller: ParameterController,
    cache: RoiCache,
    cancel: Arc<AtomicBool>,
    progress: Option<ProgressFn>,
}

/// Result sets accumulated across batches.
#[derive(Default)]
struct RunState {
    results: ResultSet,
    low: ResultSet,
    high: ResultSet,
    low_bytes: u64,
    high_bytes: u64,
    timings: PhaseTimings,
}

impl BatchPipeline {
    pub fn new(
        config: AnalysisConfig,
        frames: Box<dyn FrameSource>,
        encoder: Box<dyn Encoder>,
        detectors: DetectorRegistry,
    ) -> Self {
        let policy = config.build_recheck_policy();
        let controller = ParameterController::new(config.initial_parameters());
        let cache = RoiCache::new(config.cache_cols, config.cache_rows);
        Self {
            config,
            frames,
            encoder,
            detectors,
            policy,
            controller,
            cache,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn RecheckPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Re-decides encoding parameters from `monitor` before every batch.
    pub fn with_bandwidth_monitor<M: BandwidthMonitor + 'static>(mut self, monitor: M) -> Self {
        self.controller = ParameterController::new(self.config.initial_parameters()).with_monitor(monitor);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_batch<F: FnMut(&BatchReport) + Send + 'static>(mut self, callback: F) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cache(&self) -> &RoiCache {
        &self.cache
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn frame_count(&self) -> u32 {
        self.frames.frame_count()
    }

    /// Analyzes every batch, then merges and optionally writes the results.
    pub fn run(&mut self, output: Option<&Path>) -> Result<AnalysisOutcome, PipelineError> {
        let started = Instant::now();
        let frame_count = self.frames.frame_count();
        let mut state = RunState::default();
        let mut batches = 0;
        let mut final_low_resolution = self.config.low_resolution;

        log::info!(
            "analyzing {} frames in batches of {} (detector {:?}, encoder {}, policy {})",
            frame_count,
            self.config.batch_size,
            self.detectors.names(),
            self.encoder.name(),
            self.policy.name()
        );

        for range in FrameRange::batches(frame_count, self.config.batch_size) {
            let report = self.run_batch(range, &mut state)?;
            batches += 1;
            final_low_resolution = report.low_resolution;
            log::info!(
                "batch {}: low {} bytes @ qp {} x{:.2}, high {} bytes @ qp {} ({} regions rechecked)",
                range,
                report.low_bytes,
                report.parameters.low_qp,
                report.low_resolution,
                report.high_bytes,
                report.parameters.high_qp,
                report.rechecked_regions
            );
            if let Some(progress) = self.progress.as_mut() {
                progress(&report);
            }
        }

        let tail = FrameRange::new(frame_count, frame_count);
        self.check_cancel(BatchState::Done, tail)?;

        state.results.fill_gaps(frame_count);
        let mut merged = merge_results(
            &state.results,
            self.config.merge_confidence_threshold,
            self.config.merge_iou_threshold,
        );
        merged.fill_gaps(frame_count);

        if let Some(path) = output {
            merged.write(path).map_err(|source| PipelineError::Output {
                path: path.to_path_buf(),
                source,
            })?;
            log::info!("wrote {} regions to {}", merged.len(), path.display());
        }

        state.timings.total = started.elapsed();
        Ok(AnalysisOutcome {
            results: merged,
            low_results: state.low,
            high_results: state.high,
            low_bytes: state.low_bytes,
            high_bytes: state.high_bytes,
            frame_count,
            batches,
            timings: state.timings,
            final_parameters: self.controller.current(),
            final_low_resolution,
        })
    }

    fn run_batch(
        &mut self,
        range: FrameRange,
        state: &mut RunState,
    ) -> Result<BatchReport, PipelineError> {
        let frames = &self.frames;
        let params = self
            .controller
            .next_parameters(|| frames.block_size(range))
            .map_err(|source| PipelineError::Frames { range, source })?;
        let low_resolution = if self.controller.has_monitor() {
            params
                .resolution
                .scale_relative_to(self.config.reference_resolution)
        } else {
            self.config.low_resolution
        };
        let threshold = self.config.intersection_threshold;

        let carried = self.cache.carried_results(
            range,
            self.config.tracker_length,
            self.config.tracking_threshold,
        );
        state.results.combine(&carried, threshold);

        // Low phase: whole frames at low quality.
        self.check_cancel(BatchState::LowPhase, range)?;
        log::debug!("{}: {}", range, BatchState::LowPhase);
        let requests: Vec<Region> = range
            .frames()
            .map(|fid| Region::whole_frame(fid, low_resolution, Phase::Low.origin()))
            .collect();
        let (low_bytes, low_batch) =
            self.encode_and_detect(Phase::Low, range, &requests, low_resolution, params.low_qp, state)?;
        state.low_bytes += low_bytes;
        state.low.combine(&low_batch, threshold);
        state.results.combine(&low_batch, threshold);

        self.check_cancel(BatchState::RegionSelect, range)?;
        log::debug!("{}: {}", range, BatchState::RegionSelect);
        let select_started = Instant::now();
        let mut selected = self
            .policy
            .select_regions_for_recheck(&self.cache, &low_batch, range);
        state.timings.roi_prediction += select_started.elapsed();

        let mut high_bytes = 0;
        let mut high_detections = 0;
        if selected.is_empty() {
            log::debug!("{}: nothing to recheck, skipping high phase", range);
        } else {
            self.check_cancel(BatchState::HighPhase, range)?;
            log::debug!("{}: {} ({} regions)", range, BatchState::HighPhase, selected.len());
            let high_resolution = self.config.high_resolution;
            for region in &mut selected {
                region.resolution = high_resolution;
            }
            let (bytes, mut high_batch) = self.encode_and_detect(
                Phase::High,
                range,
                &selected,
                high_resolution,
                params.high_qp,
                state,
            )?;
            high_batch.suppress(self.config.suppression_threshold);
            high_bytes = bytes;
            high_detections = high_batch.len();
            state.high_bytes += bytes;
            state.high.combine(&high_batch, threshold);
            state.results.combine(&high_batch, threshold);
        }

        self.check_cancel(BatchState::CacheUpdate, range)?;
        log::debug!("{}: {}", range, BatchState::CacheUpdate);
        self.cache
            .update(range, &state.results)
            .map_err(|source| PipelineError::Cache { range, source })?;
        if let Err(e) = self.encoder.release_artifacts() {
            log::warn!("failed to release encoder artifacts for {}: {:#}", range, e);
        }

        Ok(BatchReport {
            range,
            parameters: params,
            low_resolution,
            low_bytes,
            high_bytes,
            low_detections: low_batch.len(),
            rechecked_regions: selected.len(),
            high_detections,
        })
    }

    fn encode_and_detect(
        &mut self,
        phase: Phase,
        range: FrameRange,
        regions: &[Region],
        resolution: f64,
        qp: u32,
        state: &mut RunState,
    ) -> Result<(u64, ResultSet), PipelineError> {
        let encode_started = Instant::now();
        let encoded = self
            .encoder
            .encode_and_measure(&EncodeRequest {
                phase,
                range,
                regions,
                resolution,
                qp,
                enforce_iframes: self.config.enforce_iframes,
            })
            .map_err(|source| PipelineError::Encode {
                phase,
                range,
                source,
            })?;
        state.timings.transmission += encode_started.elapsed();

        let detect_started = Instant::now();
        let request = DetectRequest {
            phase,
            range,
            regions,
            resolution,
            qp,
            frames_dir: encoded.frames_dir.as_deref(),
        };
        let detected = self
            .detectors
            .detect_within(&request, self.config.detector_timeout, &self.cancel)
            .map_err(|e| match e {
                DetectError::Cancelled => PipelineError::Cancelled {
                    state: BatchState::during(phase),
                    range,
                },
                DetectError::Failed(source) => PipelineError::Detect {
                    phase,
                    range,
                    source,
                },
                timed_out => PipelineError::Detect {
                    phase,
                    range,
                    source: anyhow::Error::new(timed_out),
                },
            })?;
        let elapsed = detect_started.elapsed();
        match phase {
            Phase::Low => state.timings.inference_reuse += elapsed,
            Phase::High => state.timings.inference_sharing += elapsed,
        }

        // Detectors must stay inside the batch.
        let in_range: ResultSet = detected
            .into_regions()
            .into_iter()
            .filter(|r| range.contains(r.frame_id))
            .collect();
        Ok((encoded.bytes, in_range))
    }

    fn check_cancel(&self, state: BatchState, range: FrameRange) -> Result<(), PipelineError> {
        if self.cancel.load(Ordering::SeqCst) {
            log::warn!("cancellation requested before {} of {}", state, range);
            return Err(PipelineError::Cancelled { state, range });
        }
        Ok(())
    }
}
