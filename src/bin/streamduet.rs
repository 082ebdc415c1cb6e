//! streamduet - run the two-phase analysis over one video in emulation mode

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use streamduet::frames::open_frame_source;
use streamduet::stats::write_stats;
use streamduet::{
    evaluate, AnalysisConfig, AreaEstimator, BatchPipeline, DetectorRegistry, Encoder,
    EvaluationConfig, ReplayBackend, ResultSet, StaticBandwidth, StatsRow,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EncoderKind {
    /// Estimate segment sizes from covered area.
    Area,
    /// Encode with the ffmpeg CLI (requires the encode-ffmpeg feature).
    Ffmpeg,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Name of the video; also the default result file path.
    #[arg(long)]
    video_name: String,
    /// Directory of `%08d.jpg|png` frames, or `stub://<count>`.
    #[arg(long)]
    images: String,
    /// Precomputed low-quality detections replayed in the low phase.
    #[arg(long)]
    low_results: PathBuf,
    /// Precomputed high-quality detections replayed in the high phase.
    #[arg(long)]
    high_results: Option<PathBuf>,
    /// Result file (`.csv` suffix selects CSV).
    #[arg(long)]
    output: Option<PathBuf>,
    /// Statistics file to append a row to.
    #[arg(long)]
    stats: Option<PathBuf>,
    /// Ground truth to score the results against.
    #[arg(long)]
    ground_truth: Option<PathBuf>,
    /// Configuration file (JSON, or TOML with a `.toml` extension).
    #[arg(long, env = "STREAMDUET_CONFIG")]
    config: Option<PathBuf>,
    /// Fixed bandwidth in bit/s; enables per-batch parameter adaptation.
    #[arg(long)]
    bandwidth: Option<f64>,
    #[arg(long, value_enum, default_value_t = EncoderKind::Area)]
    encoder: EncoderKind,
    /// ffmpeg executable used by the ffmpeg encoder.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,
    /// Mode recorded in the statistics file.
    #[arg(long, default_value = "emulation")]
    mode: String,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(&args.ui, std::io::stderr().is_terminal());

    let cfg = AnalysisConfig::load_from(args.config.as_deref())?;
    let frames = open_frame_source(&args.images)?;
    let encoder = build_encoder(&args, &cfg)?;
    let mut detectors = DetectorRegistry::new();
    {
        let _stage = ui.stage("Load replay detections");
        detectors.register(ReplayBackend::from_files(
            &args.low_results,
            args.high_results.as_deref(),
        )?);
        detectors.warm_up()?;
    }

    let frame_count = frames.frame_count();
    let progress = ui.frames(frame_count);
    let mut pipeline = BatchPipeline::new(cfg.clone(), frames, encoder, detectors).on_batch(
        move |report| {
            progress.advance_to(
                report.range.end,
                &format!(
                    "low {}B high {}B qp {}/{}",
                    report.low_bytes,
                    report.high_bytes,
                    report.parameters.low_qp,
                    report.parameters.high_qp
                ),
            );
        },
    );
    if let Some(bps) = args.bandwidth {
        pipeline = pipeline.with_bandwidth_monitor(StaticBandwidth::new(bps));
    }

    let cancel = pipeline.cancel_flag();
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&args.video_name));
    let outcome = pipeline.run(Some(&output))?;
    drop(pipeline);

    log::info!(
        "{}: {} frames, {} bytes low + {} bytes high = {} bytes",
        args.video_name,
        outcome.frame_count,
        outcome.low_bytes,
        outcome.high_bytes,
        outcome.total_bytes()
    );

    let mut row = StatsRow::new(&args.video_name, &cfg, &args.mode).with_outcome(&outcome);
    if let Some(bps) = args.bandwidth {
        row.push_note(&format!("bandwidth={}", bps));
    }
    if let Some(gt_path) = &args.ground_truth {
        let ground_truth = ResultSet::read(gt_path)?;
        let max_frame = outcome.frame_count.saturating_sub(1);
        let summary = evaluate(
            max_frame,
            &outcome.results,
            &ground_truth,
            &EvaluationConfig::default(),
        );
        log::info!(
            "tp={} fp={} fn={} precision={} recall={} f1={}",
            summary.true_positives,
            summary.false_positives,
            summary.false_negatives,
            summary.precision,
            summary.recall,
            summary.f1
        );
        row = row.with_evaluation(&summary);
    }
    if let Some(stats_path) = &args.stats {
        write_stats(stats_path, &row)?;
    }
    Ok(())
}

fn build_encoder(args: &Args, cfg: &AnalysisConfig) -> Result<Box<dyn Encoder>> {
    match args.encoder {
        EncoderKind::Area => Ok(Box::new(AreaEstimator::new(cfg.bytes_per_frame))),
        EncoderKind::Ffmpeg => ffmpeg_encoder(args, cfg),
    }
}

#[cfg(feature = "encode-ffmpeg")]
fn ffmpeg_encoder(args: &Args, cfg: &AnalysisConfig) -> Result<Box<dyn Encoder>> {
    use streamduet::encode::{FfmpegEncoder, FfmpegRunner};
    use streamduet::FrameDirectory;

    let frames = FrameDirectory::open(&args.images)?;
    let runner = FfmpegRunner::new()
        .with_program(args.ffmpeg.clone())
        .with_timeout(cfg.encoder_timeout);
    Ok(Box::new(FfmpegEncoder::new(frames, runner)))
}

#[cfg(not(feature = "encode-ffmpeg"))]
fn ffmpeg_encoder(_args: &Args, _cfg: &AnalysisConfig) -> Result<Box<dyn Encoder>> {
    Err(anyhow::anyhow!(
        "the ffmpeg encoder requires the encode-ffmpeg feature"
    ))
}
