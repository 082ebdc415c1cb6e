//! evaluate_results - score a result file against ground truth

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use streamduet::{
    evaluate, split_scores, AnalysisConfig, EvaluationConfig, ResultSet, StatsRow,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Result file to score.
    #[arg(long)]
    results: PathBuf,
    /// Ground-truth result file.
    #[arg(long)]
    ground_truth: PathBuf,
    /// Last frame id to score; defaults to the last frame in the ground truth.
    #[arg(long)]
    max_frame: Option<u32>,
    /// Labels counted as objects of interest.
    #[arg(long = "label", default_values_t = vec!["vehicle".to_string()])]
    labels: Vec<String>,
    #[arg(long, default_value_t = 0.3)]
    iou_threshold: f64,
    #[arg(long, default_value_t = 0.5)]
    detection_confidence: f64,
    #[arg(long, default_value_t = 0.3)]
    ground_truth_confidence: f64,
    /// Maximum box area (fraction of the frame) on either side.
    #[arg(long, default_value_t = 0.04)]
    max_area: f64,
    /// Print matched/unmatched detection confidences instead of the summary.
    #[arg(long)]
    scores: bool,
    /// Statistics file to append a row to.
    #[arg(long)]
    stats: Option<PathBuf>,
    /// Video name recorded in the statistics row.
    #[arg(long)]
    video_name: Option<String>,
    #[arg(long, default_value = "evaluation")]
    mode: String,
    #[arg(long, env = "STREAMDUET_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let detections = ResultSet::read(&args.results)?;
    let ground_truth = ResultSet::read(&args.ground_truth)?;

    if args.scores {
        let (positives, negatives) = split_scores(&detections, &ground_truth, args.iou_threshold);
        let out = serde_json::json!({ "positive": positives, "negative": negatives });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let eval_cfg = EvaluationConfig {
        relevant_labels: args.labels.clone(),
        ground_truth_confidence: args.ground_truth_confidence,
        detection_confidence: args.detection_confidence,
        ground_truth_max_area: args.max_area,
        detection_max_area: args.max_area,
        iou_threshold: args.iou_threshold,
    };
    let max_frame = args
        .max_frame
        .or_else(|| ground_truth.frame_ids().max())
        .unwrap_or(0);
    let summary = evaluate(max_frame, &detections, &ground_truth, &eval_cfg);
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(stats_path) = &args.stats {
        let cfg = AnalysisConfig::load_from(args.config.as_deref())?;
        let video_name = match &args.video_name {
            Some(name) => name.clone(),
            None => args
                .results
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .context("result path has no file name")?,
        };
        let mut row = StatsRow::new(video_name, &cfg, &args.mode).with_evaluation(&summary);
        row.frames = max_frame + 1;
        streamduet::write_stats(stats_path, &row)?;
        log::info!("appended statistics row to {}", stats_path.display());
    }
    Ok(())
}
