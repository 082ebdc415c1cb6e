//! Encoder collaborator.
//!
//! An [`Encoder`] turns the regions requested for one phase of a batch into an
//! encoded segment and reports its size. The pipeline only consumes the byte
//! count (bandwidth accounting) and, when present, a directory of decoded
//! frames that the detector reads.

use std::path::PathBuf;

use anyhow::Result;

use crate::region::Region;
use crate::{FrameRange, Phase};

mod area;
mod command;
mod error;
#[cfg(feature = "encode-ffmpeg")]
mod ffmpeg;

pub use area::AreaEstimator;
pub use command::{FfmpegCommand, FfmpegRunner};
pub use error::{EncodeError, EncodeResult};
#[cfg(feature = "encode-ffmpeg")]
pub use ffmpeg::FfmpegEncoder;

#[derive(Clone, Copy, Debug)]
pub struct EncodeRequest<'a> {
    pub phase: Phase,
    pub range: FrameRange,
    pub regions: &'a [Region],
    pub resolution: f64,
    pub qp: u32,
    /// Fixed key-frame interval with constant qp; otherwise constant quality.
    pub enforce_iframes: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EncodedBatch {
    pub bytes: u64,
    /// Union area of the encoded regions, summed over frames.
    pub pixel_area: f64,
    /// Decoded frames named `%08d` by frame id, valid until `release_artifacts`.
    pub frames_dir: Option<PathBuf>,
}

pub trait Encoder: Send {
    fn name(&self) -> &'static str;

    fn encode_and_measure(&mut self, request: &EncodeRequest<'_>) -> Result<EncodedBatch>;

    /// Drops temporary files of previous batches.
    fn release_artifacts(&mut self) -> Result<()> {
        Ok(())
    }
}
