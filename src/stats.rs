//! Statistics file: one row per analysis run, header on first write.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::AnalysisConfig;
use crate::evaluate::EvaluationSummary;
use crate::pipeline::{AnalysisOutcome, PhaseTimings};
use crate::results::{csv_field, format_float, ResultFormat};

const COLUMNS: [&str; 24] = [
    "video-name",
    "low-resolution",
    "high-resolution",
    "low_qp",
    "high_qp",
    "batch-size",
    "low-threshold",
    "high-threshold",
    "tracker-length",
    "TP",
    "FP",
    "FN",
    "F1",
    "low-size",
    "high-size",
    "total-size",
    "frames",
    "mode",
    "transmission_time",
    "inference_reuse_time",
    "roi_prediction_time",
    "inference_sharing_time",
    "total_time",
    "notes",
];

#[derive(Clone, Debug, PartialEq)]
pub struct StatsRow {
    pub video_name: String,
    pub low_resolution: f64,
    pub high_resolution: f64,
    pub low_qp: u32,
    pub high_qp: u32,
    pub batch_size: u32,
    pub low_threshold: f64,
    pub high_threshold: f64,
    pub tracker_length: u32,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub f1: f64,
    pub low_size: u64,
    pub high_size: u64,
    pub frames: u32,
    pub mode: String,
    pub timings: PhaseTimings,
    pub notes: String,
}

impl StatsRow {
    /// Row with the run's configuration and no scores, sizes or timings yet.
    pub fn new(video_name: impl Into<String>, config: &AnalysisConfig, mode: impl Into<String>) -> Self {
        Self {
            video_name: video_name.into(),
            low_resolution: config.low_resolution,
            high_resolution: config.high_resolution,
            low_qp: config.low_qp,
            high_qp: config.high_qp,
            batch_size: config.batch_size,
            low_threshold: config.low_threshold,
            high_threshold: config.high_threshold,
            tracker_length: config.tracker_length,
            true_positives: 0,
            false_positives: 0,
            false_negatives: 0,
            f1: 0.0,
            low_size: 0,
            high_size: 0,
            frames: 0,
            mode: mode.into(),
            timings: PhaseTimings::default(),
            notes: String::new(),
        }
    }

    /// Sizes, timings and the encoding parameters the run ended with.
    pub fn with_outcome(mut self, outcome: &AnalysisOutcome) -> Self {
        self.low_qp = outcome.final_parameters.low_qp;
        self.high_qp = outcome.final_parameters.high_qp;
        self.low_resolution = outcome.final_low_resolution;
        self.low_size = outcome.low_bytes;
        self.high_size = outcome.high_bytes;
        self.frames = outcome.frame_count;
        self.timings = outcome.timings;
        self
    }

    pub fn with_evaluation(mut self, summary: &EvaluationSummary) -> Self {
        self.true_positives = summary.true_positives;
        self.false_positives = summary.false_positives;
        self.false_negatives = summary.false_negatives;
        self.f1 = summary.f1;
        self.push_note(&summary.notes());
        self
    }

    pub fn push_note(&mut self, note: &str) {
        if note.is_empty() {
            return;
        }
        if !self.notes.is_empty() {
            self.notes.push(';');
        }
        self.notes.push_str(note);
    }

    fn fields(&self) -> Vec<String> {
        let secs = |d: std::time::Duration| format_float(d.as_secs_f64());
        vec![
            self.video_name.clone(),
            format_float(self.low_resolution),
            format_float(self.high_resolution),
            self.low_qp.to_string(),
            self.high_qp.to_string(),
            self.batch_size.to_string(),
            format_float(self.low_threshold),
            format_float(self.high_threshold),
            self.tracker_length.to_string(),
            self.true_positives.to_string(),
            self.false_positives.to_string(),
            self.false_negatives.to_string(),
            format_float(self.f1),
            self.low_size.to_string(),
            self.high_size.to_string(),
            (self.low_size + self.high_size).to_string(),
            self.frames.to_string(),
            self.mode.clone(),
            secs(self.timings.transmission),
            secs(self.timings.inference_reuse),
            secs(self.timings.roi_prediction),
            secs(self.timings.inference_sharing),
            secs(self.timings.total),
            self.notes.clone(),
        ]
    }
}

fn render_line(fields: &[String], format: ResultFormat) -> String {
    match format {
        ResultFormat::Text => format!("{}\n", fields.join(",")),
        ResultFormat::Csv => {
            let quoted: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
            format!("{}\r\n", quoted.join(","))
        }
    }
}

fn header(format: ResultFormat) -> Vec<String> {
    COLUMNS
        .iter()
        .map(|col| match (format, *col) {
            (ResultFormat::Csv, "low_qp") => "low-qp".to_string(),
            (ResultFormat::Csv, "high_qp") => "high-qp".to_string(),
            (_, col) => col.to_string(),
        })
        .collect()
}

/// Appends `row` to the statistics file, writing the header first when the
/// file is new or empty. The format follows the file name like result files.
pub fn write_stats(path: impl AsRef<Path>, row: &StatsRow) -> Result<()> {
    let path = path.as_ref();
    let format = ResultFormat::from_path(path);
    let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

    let mut out = String::new();
    if needs_header {
        out.push_str(&render_line(&header(format), format));
    }
    out.push_str(&render_line(&row.fields(), format));

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open stats file {}", path.display()))?;
    file.write_all(out.as_bytes())
        .with_context(|| format!("failed to append to stats file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> StatsRow {
        let mut row = StatsRow::new("highway_0", &AnalysisConfig::default(), "emulation");
        row.true_positives = 10;
        row.false_positives = 2;
        row.false_negatives = 1;
        row.f1 = 0.87;
        row.low_size = 1000;
        row.high_size = 250;
        row.frames = 30;
        row
    }

    #[test]
    fn text_header_is_written_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats");
        write_stats(&path, &row()).expect("first");
        write_stats(&path, &row()).expect("second");

        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("video-name,low-resolution,high-resolution,low_qp,high_qp,"));
        assert!(lines[0].ends_with(",total_time,notes"));
        assert!(lines[1].starts_with("highway_0,0.8,1.0,36,26,15,0.3,0.8,0,10,2,1,0.87,1000,250,1250,30,emulation,"));
        assert_eq!(lines[1], lines[2]);
    }

    #[test]
    fn csv_uses_dashed_qp_columns_and_quotes_notes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.csv");
        let summary = EvaluationSummary {
            missing_detection_frames: 1,
            missing_ground_truth_frames: 3,
            ..EvaluationSummary::default()
        };
        let mut with_notes = row().with_evaluation(&summary);
        with_notes.push_note("bandwidth=static, 2e6");
        write_stats(&path, &with_notes).expect("write");

        let content = fs::read_to_string(&path).expect("read");
        assert!(content.contains("low-qp,high-qp"));
        assert!(content.ends_with(
            ",\"missing_dt_frames=1;missing_gt_frames=3;bandwidth=static, 2e6\"\r\n"
        ));
    }

    #[test]
    fn empty_existing_file_gets_header() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        write_stats(file.path(), &row()).expect("write");
        let content = fs::read_to_string(file.path()).expect("read");
        assert!(content.starts_with("video-name,"));
    }
}
