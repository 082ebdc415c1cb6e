//! Frame sources.
//!
//! The pipeline only needs to know how many frames a video has, how large a
//! batch of them is on disk (for the bandwidth controller) and, for encoders
//! that touch pixels, where each frame lives. `stub://<count>` selects a
//! synthetic source with no files behind it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::FrameRange;

const FRAME_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const SYNTHETIC_FRAME_BYTES: u64 = 50_000;

pub trait FrameSource: Send {
    fn name(&self) -> &str;

    fn frame_count(&self) -> u32;

    /// Bytes occupied by the frames of `range`.
    fn block_size(&self, range: FrameRange) -> Result<u64>;

    /// Image file holding `frame_id`, when the source is backed by files.
    fn frame_path(&self, _frame_id: u32) -> Option<PathBuf> {
        None
    }
}

/// Opens `stub://<count>` as [`SyntheticFrames`], anything else as a [`FrameDirectory`].
pub fn open_frame_source(location: &str) -> Result<Box<dyn FrameSource>> {
    if location.starts_with("stub://") {
        Ok(Box::new(SyntheticFrames::parse(location)?))
    } else {
        Ok(Box::new(FrameDirectory::open(location)?))
    }
}

/// Directory of extracted frames named `%08d.<ext>`, numbered from zero.
#[derive(Clone, Debug)]
pub struct FrameDirectory {
    dir: PathBuf,
    extension: &'static str,
    count: u32,
}

impl FrameDirectory {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to list frame directory {}", dir.display()))?;

        let mut counts = [0u32; FRAME_EXTENSIONS.len()];
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let path = entry.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|e| e.to_str()),
            ) else {
                continue;
            };
            if stem.len() != 8 || !stem.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Some(idx) = FRAME_EXTENSIONS.iter().position(|known| *known == ext) {
                counts[idx] += 1;
            }
        }

        let (idx, count) = counts
            .iter()
            .copied()
            .enumerate()
            .max_by_key(|&(idx, count)| (count, std::cmp::Reverse(idx)))
            .filter(|&(_, count)| count > 0)
            .ok_or_else(|| anyhow!("no frames named %08d.jpg/png in {}", dir.display()))?;

        let source = Self {
            dir,
            extension: FRAME_EXTENSIONS[idx],
            count,
        };
        if let Some(missing) = (0..count).find(|&fid| !source.path_of(fid).is_file()) {
            return Err(anyhow!(
                "frame directory {} has {} frames but frame {} is missing",
                source.dir.display(),
                count,
                missing
            ));
        }
        log::debug!(
            "frame directory {}: {} .{} frames",
            source.dir.display(),
            count,
            source.extension
        );
        Ok(source)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, frame_id: u32) -> PathBuf {
        self.dir.join(format!("{:08}.{}", frame_id, self.extension))
    }
}

impl FrameSource for FrameDirectory {
    fn name(&self) -> &str {
        "directory"
    }

    fn frame_count(&self) -> u32 {
        self.count
    }

    fn block_size(&self, range: FrameRange) -> Result<u64> {
        let mut total = 0;
        for frame_id in range.frames() {
            let path = self.path_of(frame_id);
            let meta = fs::metadata(&path)
                .with_context(|| format!("failed to stat frame {}", path.display()))?;
            total += meta.len();
        }
        Ok(total)
    }

    fn frame_path(&self, frame_id: u32) -> Option<PathBuf> {
        (frame_id < self.count).then(|| self.path_of(frame_id))
    }
}

/// File-less source with a fixed size per frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyntheticFrames {
    count: u32,
    frame_bytes: u64,
}

impl SyntheticFrames {
    pub fn new(count: u32) -> Self {
        Self {
            count,
            frame_bytes: SYNTHETIC_FRAME_BYTES,
        }
    }

    pub fn with_frame_bytes(mut self, frame_bytes: u64) -> Self {
        self.frame_bytes = frame_bytes;
        self
    }

    /// Parses `stub://<count>`.
    pub fn parse(location: &str) -> Result<Self> {
        let count = location
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic frame source must start with stub://"))?;
        let count: u32 = count
            .parse()
            .map_err(|_| anyhow!("invalid synthetic frame count in '{}'", location))?;
        Ok(Self::new(count))
    }
}

impl FrameSource for SyntheticFrames {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn frame_count(&self) -> u32 {
        self.count
    }

    fn block_size(&self, range: FrameRange) -> Result<u64> {
        let end = range.end.min(self.count);
        let frames = end.saturating_sub(range.start) as u64;
        Ok(frames * self.frame_bytes)
    }
}
