//! FFmpeg-backed encoder.
//!
//! Requested regions are pasted onto black canvases (whole-frame requests keep
//! the frame), the canvases are encoded as one libx264 segment, and the segment
//! is decoded again so the detector sees exactly what a receiver would.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops, RgbImage};
use tempfile::TempDir;

use crate::frames::{FrameDirectory, FrameSource};
use crate::region::Region;

use super::{EncodeRequest, EncodedBatch, Encoder, FfmpegCommand, FfmpegRunner};

const GOP_FRAMES: u32 = 15;
const FALLBACK_CRF: u8 = 23;
const SEGMENT_NAME: &str = "temp.mp4";

pub struct FfmpegEncoder {
    frames: FrameDirectory,
    runner: FfmpegRunner,
    workdirs: Vec<TempDir>,
}

impl FfmpegEncoder {
    pub fn new(frames: FrameDirectory, runner: FfmpegRunner) -> Self {
        Self {
            frames,
            runner,
            workdirs: Vec::new(),
        }
    }

    /// Writes one canvas per requested frame as `%08d.png`, numbered from zero.
    fn stage_canvases(&self, regions: &[Region], staging: &Path) -> Result<Vec<u32>> {
        let mut by_frame: BTreeMap<u32, Vec<&Region>> = BTreeMap::new();
        for region in regions {
            by_frame.entry(region.frame_id).or_default().push(region);
        }

        for (idx, (frame_id, wanted)) in by_frame.iter().enumerate() {
            let path = self
                .frames
                .frame_path(*frame_id)
                .ok_or_else(|| anyhow!("frame {} is not in {}", frame_id, self.frames.dir().display()))?;
            let source = image::open(&path)
                .with_context(|| format!("failed to load frame {}", path.display()))?
                .to_rgb8();
            let canvas = paste_regions(&source, wanted);
            let out = staging.join(format!("{:08}.png", idx));
            canvas
                .save(&out)
                .with_context(|| format!("failed to write {}", out.display()))?;
        }
        Ok(by_frame.into_keys().collect())
    }

    /// Decodes the segment and renames the frames after the ids they came from.
    fn decode_to_frames(&self, segment: &Path, frame_ids: &[u32], out: &Path) -> Result<()> {
        let cmd = FfmpegCommand::new(segment, out.join("%08d.png"))
            .pixel_format("yuvj420p")
            .output_arg("-q:v")
            .output_arg("2")
            .output_arg("-vsync")
            .output_arg("0")
            .output_arg("-start_number")
            .output_arg("0");
        self.runner
            .run(&cmd)
            .with_context(|| format!("failed to decode {}", segment.display()))?;

        // Renaming in descending order never overwrites a decoded frame that is
        // still waiting to be renamed, since ids are at least their index.
        for (idx, frame_id) in frame_ids.iter().enumerate().rev() {
            let from = out.join(format!("{:08}.png", idx));
            let to = out.join(format!("{:08}.png", frame_id));
            if from != to {
                fs::rename(&from, &to).with_context(|| {
                    format!("failed to rename {} to {}", from.display(), to.display())
                })?;
            }
        }
        Ok(())
    }
}

fn paste_regions(source: &RgbImage, regions: &[&Region]) -> RgbImage {
    let (width, height) = source.dimensions();
    if regions.iter().any(|r| r.x == 0.0 && r.y == 0.0 && r.w == 1.0 && r.h == 1.0) {
        return source.clone();
    }
    let mut canvas = RgbImage::new(width, height);
    for region in regions {
        let x0 = ((region.x * width as f64) as u32).min(width);
        let y0 = ((region.y * height as f64) as u32).min(height);
        let x1 = ((region.w * width as f64) as u32 + x0).min(width);
        let y1 = ((region.h * height as f64) as u32 + y0).min(height);
        if x1 <= x0 || y1 <= y0 {
            continue;
        }
        let patch = imageops::crop_imm(source, x0, y0, x1 - x0, y1 - y0).to_image();
        imageops::replace(&mut canvas, &patch, x0 as i64, y0 as i64);
    }
    canvas
}

impl Encoder for FfmpegEncoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn encode_and_measure(&mut self, request: &EncodeRequest<'_>) -> Result<EncodedBatch> {
        if request.regions.is_empty() {
            return Ok(EncodedBatch::default());
        }
        let staging = TempDir::new().context("failed to create staging directory")?;
        let frame_ids = self.stage_canvases(request.regions, staging.path())?;

        let segment = staging.path().join(SEGMENT_NAME);
        let mut cmd = FfmpegCommand::new(staging.path().join("%08d.png"), &segment)
            .start_number(0)
            .video_codec("libx264");
        cmd = if request.enforce_iframes {
            cmd.keyframe_interval(GOP_FRAMES).qp(request.qp)
        } else {
            cmd.crf(FALLBACK_CRF)
        };
        let cmd = cmd
            .pixel_format("yuv420p")
            .scale(request.resolution)
            .frame_limit(frame_ids.len() as u32);
        self.runner
            .run(&cmd)
            .with_context(|| format!("failed to encode {} of {}", request.range, request.phase))?;

        let bytes = fs::metadata(&segment)
            .with_context(|| format!("failed to stat {}", segment.display()))?
            .len();

        let decoded = TempDir::new().context("failed to create decode directory")?;
        self.decode_to_frames(&segment, &frame_ids, decoded.path())?;
        let frames_dir = decoded.path().to_path_buf();
        self.workdirs.push(staging);
        self.workdirs.push(decoded);

        let requested: crate::results::ResultSet = request.regions.iter().cloned().collect();
        Ok(EncodedBatch {
            bytes,
            pixel_area: crate::geometry::union_area(&requested),
            frames_dir: Some(frames_dir),
        })
    }

    fn release_artifacts(&mut self) -> Result<()> {
        for dir in self.workdirs.drain(..) {
            let path = dir.path().to_path_buf();
            dir.close()
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}
