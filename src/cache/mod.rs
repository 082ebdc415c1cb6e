//! Region-of-interest cache.
//!
//! The cache divides the unit frame into a uniform grid of blocks and remembers,
//! per block, the last confirmed detection: its box, confidence, label, the
//! resolution it was confirmed at and the frame that confirmed it. The
//! orchestrator updates it once per batch, strictly in frame order, and asks a
//! [`RecheckPolicy`] which low-phase detections need a high-quality second look.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::geometry::Rect;
use crate::region::Region;
use crate::results::ResultSet;
use crate::FrameRange;

mod policy;

pub use policy::{RecheckPolicy, RecheckReason, StalenessPolicy, UncertaintyPolicy};

/// Origin stamped on detections carried over from the cache.
pub const TRACKING_ORIGIN: &str = "tracking";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub col: u32,
    pub row: u32,
}

/// Last confirmed detection inside one block.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockState {
    pub rect: Rect,
    pub confidence: f64,
    pub label: String,
    pub resolution: f64,
    pub confirmed_at: u32,
}

#[derive(Clone, Debug)]
pub struct RoiCache {
    cols: u32,
    rows: u32,
    blocks: BTreeMap<BlockId, BlockState>,
    last_range: Option<FrameRange>,
}

impl RoiCache {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols: cols.max(1),
            rows: rows.max(1),
            blocks: BTreeMap::new(),
            last_range: None,
        }
    }

    pub fn grid(&self) -> (u32, u32) {
        (self.cols, self.rows)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Frame range of the most recent update.
    pub fn last_range(&self) -> Option<FrameRange> {
        self.last_range
    }

    /// Block containing the center of `rect`.
    pub fn block_of(&self, rect: &Rect) -> BlockId {
        let (cx, cy) = rect.center();
        let cell = |v: f64, n: u32| ((v.clamp(0.0, 1.0) * n as f64) as u32).min(n - 1);
        BlockId {
            col: cell(cx, self.cols),
            row: cell(cy, self.rows),
        }
    }

    pub fn get(&self, block: BlockId) -> Option<&BlockState> {
        self.blocks.get(&block)
    }

    pub fn state_for(&self, region: &Region) -> Option<&BlockState> {
        self.get(self.block_of(&region.rect()))
    }

    /// Records the confirmed detections of `range`.
    ///
    /// Placeholders and carried-over tracking regions do not confirm anything.
    /// Within a block the latest frame wins, then the higher confidence.
    /// Ranges must arrive in increasing, non-overlapping order.
    pub fn update(&mut self, range: FrameRange, results: &ResultSet) -> Result<usize> {
        if let Some(last) = self.last_range {
            if range.start < last.end {
                bail!(
                    "cache update for {} overlaps previously cached batch {}",
                    range,
                    last
                );
            }
        }

        let mut updated = 0;
        for frame_id in range.frames() {
            for region in results.regions_for_frame(frame_id) {
                if region.is_placeholder() || region.origin_has(TRACKING_ORIGIN) {
                    continue;
                }
                let block = self.block_of(&region.rect());
                let replace = match self.blocks.get(&block) {
                    None => true,
                    Some(state) => {
                        state.confirmed_at < frame_id
                            || (state.confirmed_at == frame_id
                                && region.confidence > state.confidence)
                    }
                };
                if replace {
                    self.blocks.insert(
                        block,
                        BlockState {
                            rect: region.rect(),
                            confidence: region.confidence,
                            label: region.label.clone(),
                            resolution: region.resolution,
                            confirmed_at: frame_id,
                        },
                    );
                    updated += 1;
                }
            }
        }
        self.last_range = Some(range);
        log::debug!(
            "roi cache updated {} blocks for {} ({} tracked)",
            updated,
            range,
            self.blocks.len()
        );
        Ok(updated)
    }

    /// Detections carried over from cached blocks onto the frames of `range`.
    ///
    /// A block contributes to frame `f` when it was confirmed at most
    /// `tracker_length` frames before `f` with confidence of at least
    /// `min_confidence`. `tracker_length == 0` disables carry-over.
    pub fn carried_results(
        &self,
        range: FrameRange,
        tracker_length: u32,
        min_confidence: f64,
    ) -> ResultSet {
        let mut carried = ResultSet::new();
        if tracker_length == 0 {
            return carried;
        }
        for frame_id in range.frames() {
            for state in self.blocks.values() {
                let fresh = frame_id > state.confirmed_at
                    && frame_id - state.confirmed_at <= tracker_length;
                if !fresh || state.confidence < min_confidence {
                    continue;
                }
                let mut region = Region::new(
                    frame_id,
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                    state.confidence,
                    state.label.clone(),
                    state.resolution,
                    TRACKING_ORIGIN,
                );
                region.set_rect(state.rect);
                carried.append(region);
            }
        }
        carried
    }
}
