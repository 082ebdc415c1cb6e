use anyhow::Result;

use crate::geometry::union_area;
use crate::results::ResultSet;

use super::{EncodeRequest, EncodedBatch, Encoder};

/// Size model used in emulation: bytes grow with the covered area and the
/// square of the resolution factor. Never touches pixels.
#[derive(Clone, Copy, Debug)]
pub struct AreaEstimator {
    bytes_per_frame: f64,
}

impl AreaEstimator {
    pub fn new(bytes_per_frame: f64) -> Self {
        Self { bytes_per_frame }
    }

    pub fn estimate(&self, request: &EncodeRequest<'_>) -> EncodedBatch {
        let requested: ResultSet = request.regions.iter().cloned().collect();
        let area = union_area(&requested);
        let bytes = area * self.bytes_per_frame * request.resolution * request.resolution;
        EncodedBatch {
            bytes: bytes.round().max(0.0) as u64,
            pixel_area: area,
            frames_dir: None,
        }
    }
}

impl Encoder for AreaEstimator {
    fn name(&self) -> &'static str {
        "area"
    }

    fn encode_and_measure(&mut self, request: &EncodeRequest<'_>) -> Result<EncodedBatch> {
        Ok(self.estimate(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;
    use crate::{FrameRange, Phase};

    fn request(regions: &[Region], resolution: f64) -> EncodeRequest<'_> {
        EncodeRequest {
            phase: Phase::Low,
            range: FrameRange::new(0, 4),
            regions,
            resolution,
            qp: 36,
            enforce_iframes: true,
        }
    }

    #[test]
    fn whole_frames_cost_a_frame_each() {
        let regions: Vec<Region> = (0..4).map(|fid| Region::whole_frame(fid, 1.0, "low")).collect();
        let batch = AreaEstimator::new(1000.0).estimate(&request(&regions, 1.0));
        assert_eq!(batch.bytes, 4000);
        assert_eq!(batch.frames_dir, None);

        let scaled = AreaEstimator::new(1000.0).estimate(&request(&regions, 0.5));
        assert_eq!(scaled.bytes, 1000);
    }

    #[test]
    fn overlapping_boxes_are_counted_once() {
        let regions = vec![
            Region::new(0, 0.0, 0.0, 0.5, 0.5, 0.9, "car", 1.0, "low"),
            Region::new(0, 0.25, 0.0, 0.5, 0.5, 0.9, "car", 1.0, "low"),
        ];
        let batch = AreaEstimator::new(1000.0).estimate(&request(&regions, 1.0));
        assert_eq!(batch.bytes, 375);
        assert!((batch.pixel_area - 0.375).abs() < 1e-12);
    }

    #[test]
    fn empty_request_is_free() {
        let batch = AreaEstimator::new(1000.0).estimate(&request(&[], 1.0));
        assert_eq!(batch.bytes, 0);
    }
}
