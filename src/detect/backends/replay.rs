use std::path::Path;

use anyhow::{Context, Result};

use crate::detect::backend::{DetectRequest, DetectorBackend};
use crate::geometry::intersection_area;
use crate::results::ResultSet;
use crate::Phase;

/// Serves precomputed detections instead of running a model.
///
/// The low phase answers with the low-quality file's detections for the batch.
/// The high phase answers with the high-quality file's detections that overlap
/// a requested box on the same frame. Answers are restamped with the request's
/// resolution and the phase origin.
pub struct ReplayBackend {
    low: ResultSet,
    high: Option<ResultSet>,
}

impl ReplayBackend {
    pub fn new(low: ResultSet, high: Option<ResultSet>) -> Self {
        Self { low, high }
    }

    pub fn from_files(low: &Path, high: Option<&Path>) -> Result<Self> {
        let low = ResultSet::read(low).context("failed to load low-phase detections")?;
        let high = match high {
            Some(path) => {
                Some(ResultSet::read(path).context("failed to load high-phase detections")?)
            }
            None => None,
        };
        Ok(Self::new(low, high))
    }
}

impl DetectorBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn supports(&self, phase: Phase) -> bool {
        match phase {
            Phase::Low => true,
            Phase::High => self.high.is_some(),
        }
    }

    fn detect(&mut self, request: &DetectRequest<'_>) -> Result<ResultSet> {
        let source = match request.phase {
            Phase::Low => &self.low,
            Phase::High => self
                .high
                .as_ref()
                .context("replay backend has no high-phase detections")?,
        };

        let mut answer = ResultSet::new();
        for frame_id in request.range.frames() {
            if !request.covers_frame(frame_id) {
                continue;
            }
            for region in source.regions_for_frame(frame_id) {
                let wanted = match request.phase {
                    Phase::Low => true,
                    Phase::High => request.regions.iter().any(|req| {
                        req.frame_id == frame_id
                            && intersection_area(&req.rect(), &region.rect()) > 0.0
                    }),
                };
                if wanted {
                    let mut hit = region.clone();
                    hit.resolution = request.resolution;
                    hit.origin = request.phase.origin().to_string();
                    answer.append(hit);
                }
            }
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;
    use crate::FrameRange;

    fn car(frame_id: u32, x: f64, conf: f64) -> Region {
        Region::new(frame_id, x, 0.1, 0.1, 0.1, conf, "car", 1.0, "generic")
    }

    #[test]
    fn low_phase_replays_frames_in_range() {
        let low: ResultSet = vec![car(0, 0.1, 0.5), car(1, 0.1, 0.6), car(5, 0.1, 0.7)]
            .into_iter()
            .collect();
        let mut backend = ReplayBackend::new(low, None);
        assert!(!backend.supports(Phase::High));

        let requests: Vec<Region> = (0..3).map(|fid| Region::whole_frame(fid, 0.8, "low")).collect();
        let answer = backend
            .detect(&DetectRequest {
                phase: Phase::Low,
                range: FrameRange::new(0, 3),
                regions: &requests,
                resolution: 0.8,
                qp: 36,
                frames_dir: None,
            })
            .expect("detect");
        assert_eq!(answer.len(), 2);
        assert!(answer.iter().all(|r| r.origin == "low" && r.resolution == 0.8));
    }

    #[test]
    fn high_phase_only_answers_requested_boxes() {
        let high: ResultSet = vec![car(0, 0.1, 0.9), car(0, 0.7, 0.9), car(1, 0.1, 0.9)]
            .into_iter()
            .collect();
        let mut backend = ReplayBackend::new(ResultSet::new(), Some(high));
        let requests = vec![car(0, 0.15, 0.5)];
        let answer = backend
            .detect(&DetectRequest {
                phase: Phase::High,
                range: FrameRange::new(0, 2),
                regions: &requests,
                resolution: 1.0,
                qp: 26,
                frames_dir: None,
            })
            .expect("detect");
        assert_eq!(answer.len(), 1);
        let hit = &answer.regions()[0];
        assert_eq!((hit.frame_id, hit.x), (0, 0.1));
        assert_eq!(hit.origin, "high");
    }
}
