use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use streamduet::detect::DetectError;
use streamduet::pipeline::{BatchReport, BatchState};
use streamduet::{
    write_stats, AnalysisConfig, AreaEstimator, BatchPipeline, DetectRequest, DetectorBackend,
    DetectorRegistry, EncodeRequest, EncodedBatch, Encoder, FrameRange, Phase, PipelineError,
    Region, ReplayBackend, ResultSet, StaticBandwidth, StatsRow, SyntheticFrames,
};

fn car(frame_id: u32, conf: f64) -> Region {
    Region::new(frame_id, 0.2, 0.3, 0.1, 0.1, conf, "vehicle", 1.0, "generic")
}

fn config() -> AnalysisConfig {
    AnalysisConfig {
        batch_size: 5,
        ..AnalysisConfig::default()
    }
}

fn replay(low: ResultSet, high: ResultSet) -> DetectorRegistry {
    let mut detectors = DetectorRegistry::new();
    detectors.register(ReplayBackend::new(low, Some(high)));
    detectors
}

fn collect_reports(pipeline: BatchPipeline) -> (BatchPipeline, mpsc::Receiver<BatchReport>) {
    let (tx, rx) = mpsc::channel();
    let pipeline = pipeline.on_batch(move |report| {
        let _ = tx.send(report.clone());
    });
    (pipeline, rx)
}

#[test]
fn writes_gap_filled_results() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("highway_0");

    let low: ResultSet = (0..12).filter(|f| f % 3 != 0).map(|f| car(f, 0.9)).collect();
    let high: ResultSet = (0..12).filter(|f| f % 3 != 0).map(|f| car(f, 0.95)).collect();
    let mut pipeline = BatchPipeline::new(
        config(),
        Box::new(SyntheticFrames::new(12)),
        Box::new(AreaEstimator::new(1000.0)),
        replay(low, high),
    );
    let outcome = pipeline.run(Some(&output)).expect("run");

    assert_eq!(outcome.frame_count, 12);
    assert_eq!(outcome.batches, 3);
    for fid in 0..12 {
        assert!(outcome.results.contains_frame(fid), "frame {} missing", fid);
    }

    let content = std::fs::read_to_string(&output).expect("read output");
    assert_eq!(content.lines().count(), outcome.results.len());
    assert!(content.starts_with("0,0.0,0.0,0.0,0.0,no obj,"));

    let reloaded = ResultSet::read(&output).expect("reload");
    assert_eq!(reloaded.len(), outcome.results.without_placeholders().len());
    assert_eq!(reloaded.len(), 8);
}

#[test]
fn confirmed_objects_are_not_rechecked() {
    let low: ResultSet = (0..10).map(|f| car(f, 0.95)).collect();
    let high: ResultSet = (0..10).map(|f| car(f, 0.99)).collect();
    let pipeline = BatchPipeline::new(
        config(),
        Box::new(SyntheticFrames::new(10)),
        Box::new(AreaEstimator::new(1000.0)),
        replay(low, high),
    );
    let (mut pipeline, rx) = collect_reports(pipeline);
    let outcome = pipeline.run(None).expect("run");
    let reports: Vec<BatchReport> = rx.try_iter().collect();

    assert_eq!(reports.len(), 2);
    assert!(reports[0].rechecked_regions > 0);
    assert!(reports[0].high_bytes > 0);
    assert_eq!(reports[1].rechecked_regions, 0);
    assert_eq!(reports[1].high_bytes, 0);
    assert_eq!(outcome.high_bytes, reports[0].high_bytes);
    assert_eq!(outcome.total_bytes(), outcome.low_bytes + outcome.high_bytes);
    assert!(!pipeline.cache().is_empty());
}

#[test]
fn tracked_objects_carry_into_the_next_batch() {
    let low: ResultSet = (0..5).map(|f| car(f, 0.95)).collect();
    let high: ResultSet = (0..5).map(|f| car(f, 0.99)).collect();
    let cfg = AnalysisConfig {
        tracker_length: 3,
        ..config()
    };
    let mut pipeline = BatchPipeline::new(
        cfg,
        Box::new(SyntheticFrames::new(10)),
        Box::new(AreaEstimator::new(1000.0)),
        replay(low, high),
    );
    let outcome = pipeline.run(None).expect("run");

    for fid in 5..8 {
        let tracked: Vec<&Region> = outcome.results.regions_for_frame(fid).collect();
        assert_eq!(tracked.len(), 1);
        assert!(tracked[0].origin_has("tracking"), "frame {}: {:?}", fid, tracked[0]);
    }
    for fid in 8..10 {
        assert!(outcome.results.regions_for_frame(fid).all(Region::is_placeholder));
    }
}

struct FailingHighPhase {
    inner: AreaEstimator,
}

impl Encoder for FailingHighPhase {
    fn name(&self) -> &'static str {
        "failing-high"
    }

    fn encode_and_measure(&mut self, request: &EncodeRequest<'_>) -> Result<EncodedBatch> {
        match request.phase {
            Phase::Low => self.inner.encode_and_measure(request),
            Phase::High => Err(anyhow!("encoder exited with status 1")),
        }
    }
}

#[test]
fn encoder_failure_aborts_without_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("results.csv");

    let low: ResultSet = (0..10).map(|f| car(f, 0.5)).collect();
    let mut pipeline = BatchPipeline::new(
        config(),
        Box::new(SyntheticFrames::new(10)),
        Box::new(FailingHighPhase {
            inner: AreaEstimator::new(1000.0),
        }),
        replay(low, ResultSet::new()),
    );

    match pipeline.run(Some(&output)) {
        Err(PipelineError::Encode { phase, range, source }) => {
            assert_eq!(phase, Phase::High);
            assert_eq!(range, FrameRange::new(0, 5));
            assert!(source.to_string().contains("status 1"));
        }
        other => panic!("unexpected outcome: {:?}", other.map(|o| o.batches)),
    }
    assert!(!output.exists());
}

#[test]
fn cancellation_between_batches_stops_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("results");
    let cancel = Arc::new(AtomicBool::new(false));
    let raise = Arc::clone(&cancel);

    let mut pipeline = BatchPipeline::new(
        config(),
        Box::new(SyntheticFrames::new(15)),
        Box::new(AreaEstimator::new(1000.0)),
        replay(ResultSet::new(), ResultSet::new()),
    )
    .with_cancel_flag(cancel)
    .on_batch(move |_| raise.store(true, Ordering::SeqCst));

    let err = pipeline.run(Some(&output)).unwrap_err();
    match err {
        PipelineError::Cancelled { state, range } => {
            assert_eq!(state, BatchState::LowPhase);
            assert_eq!(range, FrameRange::new(5, 10));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!output.exists());
}

#[test]
fn bandwidth_monitor_picks_parameters_per_batch() {
    let pipeline = BatchPipeline::new(
        config(),
        Box::new(SyntheticFrames::new(10).with_frame_bytes(300_000)),
        Box::new(AreaEstimator::new(1000.0)),
        replay(ResultSet::new(), ResultSet::new()),
    )
    .with_bandwidth_monitor(StaticBandwidth::new(2e6));
    let (mut pipeline, rx) = collect_reports(pipeline);
    let outcome = pipeline.run(None).expect("run");
    let reports: Vec<BatchReport> = rx.try_iter().collect();

    assert_eq!(outcome.final_parameters.low_qp, 28);
    // Five 300 kB frames make a large block.
    assert_eq!(outcome.final_parameters.high_qp, 26);
    for report in &reports {
        assert!((report.low_resolution - 720.0 / 1080.0).abs() < 1e-9);
    }
    // Nothing detected, so no regions beyond placeholders.
    assert!(outcome.results.iter().all(Region::is_placeholder));
    assert_eq!(outcome.high_bytes, 0);
}

#[test]
fn stats_row_records_adapted_parameters() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stats = dir.path().join("stats");

    let mut pipeline = BatchPipeline::new(
        config(),
        Box::new(SyntheticFrames::new(10).with_frame_bytes(300_000)),
        Box::new(AreaEstimator::new(1000.0)),
        replay(ResultSet::new(), ResultSet::new()),
    )
    .with_bandwidth_monitor(StaticBandwidth::new(2e6));
    let outcome = pipeline.run(None).expect("run");

    let row = StatsRow::new("highway_0", &config(), "emulation").with_outcome(&outcome);
    assert_eq!(row.low_qp, 28);
    assert_eq!(row.high_qp, 26);
    assert!((row.low_resolution - 720.0 / 1080.0).abs() < 1e-9);

    write_stats(&stats, &row).expect("write stats");
    let content = std::fs::read_to_string(&stats).expect("read stats");
    let fields: Vec<&str> = content.lines().nth(1).expect("row").split(',').collect();
    assert_eq!(&fields[3..5], &["28", "26"]);
}

#[test]
fn stats_row_keeps_configured_parameters_without_monitor() {
    let mut pipeline = BatchPipeline::new(
        config(),
        Box::new(SyntheticFrames::new(5)),
        Box::new(AreaEstimator::new(1000.0)),
        replay(ResultSet::new(), ResultSet::new()),
    );
    let outcome = pipeline.run(None).expect("run");
    let row = StatsRow::new("highway_0", &config(), "emulation").with_outcome(&outcome);
    assert_eq!((row.low_qp, row.high_qp), (36, 26));
    assert_eq!(row.low_resolution, 0.8);
}

/// Replays detections after a fixed delay.
struct SlowReplay {
    inner: ReplayBackend,
    delay: Duration,
}

impl DetectorBackend for SlowReplay {
    fn name(&self) -> &'static str {
        "slow-replay"
    }

    fn supports(&self, phase: Phase) -> bool {
        self.inner.supports(phase)
    }

    fn detect(&mut self, request: &DetectRequest<'_>) -> Result<ResultSet> {
        thread::sleep(self.delay);
        self.inner.detect(request)
    }
}

fn slow_pipeline(cfg: AnalysisConfig, delay: Duration) -> BatchPipeline {
    let mut detectors = DetectorRegistry::new();
    detectors.register(SlowReplay {
        inner: ReplayBackend::new(ResultSet::new(), Some(ResultSet::new())),
        delay,
    });
    BatchPipeline::new(
        cfg,
        Box::new(SyntheticFrames::new(10)),
        Box::new(AreaEstimator::new(1000.0)),
        detectors,
    )
}

#[test]
fn stuck_detector_hits_the_deadline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("results");
    let cfg = AnalysisConfig {
        detector_timeout: Duration::from_millis(100),
        ..config()
    };
    let mut pipeline = slow_pipeline(cfg, Duration::from_secs(3));

    let started = Instant::now();
    match pipeline.run(Some(&output)) {
        Err(PipelineError::Detect { phase, range, source }) => {
            assert_eq!(phase, Phase::Low);
            assert_eq!(range, FrameRange::new(0, 5));
            assert!(matches!(
                source.downcast_ref::<DetectError>(),
                Some(DetectError::TimedOut { .. })
            ));
        }
        other => panic!("unexpected outcome: {:?}", other.map(|o| o.batches)),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!output.exists());
}

#[test]
fn cancellation_interrupts_a_running_detector() {
    let mut pipeline = slow_pipeline(config(), Duration::from_secs(3));
    let cancel = pipeline.cancel_flag();
    let raiser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        cancel.store(true, Ordering::SeqCst);
    });

    let started = Instant::now();
    let err = pipeline.run(None).unwrap_err();
    raiser.join().expect("raiser thread");
    match err {
        PipelineError::Cancelled { state, range } => {
            assert_eq!(state, BatchState::LowPhase);
            assert_eq!(range, FrameRange::new(0, 5));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
}
