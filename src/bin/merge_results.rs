//! merge_results - re-merge and gap-fill an existing result file
//!
//! Combines one or more result files, collapses overlapping same-label boxes
//! into one region per object per frame, and writes a gap-filled result file.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use streamduet::merge::merge_results;
use streamduet::{AnalysisConfig, ResultSet};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Result files to merge (text, or CSV with a `.csv` suffix).
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Output result file.
    #[arg(long, short)]
    output: PathBuf,
    /// Number of frames in the video; defaults to one past the last frame seen.
    #[arg(long)]
    frames: Option<u32>,
    /// Configuration file supplying the merge thresholds.
    #[arg(long, env = "STREAMDUET_CONFIG")]
    config: Option<PathBuf>,
    /// Override the merge confidence floor.
    #[arg(long)]
    min_confidence: Option<f64>,
    /// Override the merge IoU threshold.
    #[arg(long)]
    iou_threshold: Option<f64>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(&args.ui, std::io::stderr().is_terminal());
    let cfg = AnalysisConfig::load_from(args.config.as_deref())?;

    let min_confidence = args.min_confidence.unwrap_or(cfg.merge_confidence_threshold);
    let iou_threshold = args.iou_threshold.unwrap_or(cfg.merge_iou_threshold);
    for (name, value) in [("min-confidence", min_confidence), ("iou-threshold", iou_threshold)] {
        if !(0.0..=1.0).contains(&value) {
            return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
        }
    }

    let mut combined = ResultSet::new();
    {
        let _stage = ui.stage("Read result files");
        for input in &args.inputs {
            let results = ResultSet::read(input)?;
            log::info!("{}: {} regions", input.display(), results.len());
            for region in results.into_regions() {
                combined.append(region);
            }
        }
    }

    let frame_count = args
        .frames
        .unwrap_or_else(|| combined.frame_ids().max().map_or(0, |last| last + 1));

    let merged = {
        let _stage = ui.stage("Merge regions");
        combined.fill_gaps(frame_count);
        let mut merged = merge_results(&combined, min_confidence, iou_threshold);
        merged.fill_gaps(frame_count);
        merged
    };

    merged.write(&args.output)?;
    log::info!(
        "wrote {} regions over {} frames to {}",
        merged.len(),
        frame_count,
        args.output.display()
    );
    Ok(())
}
