use std::path::Path;

use anyhow::Result;

use crate::region::Region;
use crate::results::ResultSet;
use crate::{FrameRange, Phase};

/// One detection call: the regions of a batch that were encoded for `phase`.
#[derive(Clone, Copy, Debug)]
pub struct DetectRequest<'a> {
    pub phase: Phase,
    pub range: FrameRange,
    /// Whole-frame requests in the low phase, selected boxes in the high phase.
    pub regions: &'a [Region],
    /// Resolution factor the regions were encoded at.
    pub resolution: f64,
    pub qp: u32,
    /// Decoded frames of this batch, when the encoder produced any.
    pub frames_dir: Option<&'a Path>,
}

impl DetectRequest<'_> {
    /// True when at least one requested region lies on `frame_id`.
    pub fn covers_frame(&self, frame_id: u32) -> bool {
        self.regions.iter().any(|r| r.frame_id == frame_id)
    }
}

/// Detector backend trait.
///
/// Implementations return regions with normalized coordinates, stamped with the
/// request's resolution and the phase origin. Frames outside `request.range`
/// must not appear in the answer.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend can serve `phase`.
    fn supports(&self, phase: Phase) -> bool;

    fn detect(&mut self, request: &DetectRequest<'_>) -> Result<ResultSet>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
