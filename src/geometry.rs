//! Pure geometry over normalized axis-aligned boxes.
//!
//! All functions are total: zero-area boxes contribute nothing and an empty
//! union yields an IoU of 0 rather than a division by zero.

use crate::region::Region;
use crate::results::ResultSet;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Axis-aligned box in unit-frame coordinates (top-left corner plus extent).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> f64 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.h
    }

    pub fn area(&self) -> f64 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn is_degenerate(&self) -> bool {
        self.w <= 0.0 || self.h <= 0.0
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Smallest box containing both `self` and `other`.
    pub fn bounding_union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect {
            x,
            y,
            w: self.right().max(other.right()) - x,
            h: self.bottom().max(other.bottom()) - y,
        }
    }
}

/// Overlap area. Each side is capped at the narrower box's extent so a box
/// overlaps itself by exactly its own area.
pub fn intersection_area(a: &Rect, b: &Rect) -> f64 {
    let top = a.y.max(b.y);
    let left = a.x.max(b.x);
    let bottom = a.bottom().min(b.bottom());
    let right = a.right().min(b.right());
    let width = (right - left).min(a.w).min(b.w).max(0.0);
    let height = (bottom - top).min(a.h).min(b.h).max(0.0);
    width * height
}

/// Intersection over union in `[0, 1]`. Returns 0 when the union has no area.
pub fn iou(a: &Rect, b: &Rect) -> f64 {
    let intersection = intersection_area(a, b);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    (intersection / union).min(1.0)
}

/// Exact area covered by a set of rectangles belonging to one frame.
///
/// Sweeps the distinct x-boundaries; inside each vertical slab the covered
/// y-intervals are merged and multiplied by the slab width.
pub fn union_area_of_rects(rects: &[Rect]) -> f64 {
    let rects: Vec<&Rect> = rects.iter().filter(|r| !r.is_degenerate()).collect();
    if rects.is_empty() {
        return 0.0;
    }

    let mut xs: Vec<f64> = rects.iter().flat_map(|r| [r.x, r.right()]).collect();
    xs.sort_by(f64::total_cmp);
    xs.dedup();

    let mut area = 0.0;
    let mut intervals: Vec<(f64, f64)> = Vec::with_capacity(rects.len());
    for slab in xs.windows(2) {
        let (x1, x2) = (slab[0], slab[1]);
        intervals.clear();
        intervals.extend(
            rects
                .iter()
                .filter(|r| r.x < x2 && r.right() > x1)
                .map(|r| (r.y, r.bottom())),
        );
        area += covered_length(&mut intervals) * (x2 - x1);
    }
    area
}

/// Total length covered by a set of closed intervals.
fn covered_length(intervals: &mut [(f64, f64)]) -> f64 {
    if intervals.is_empty() {
        return 0.0;
    }
    intervals.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut total = 0.0;
    let (mut start, mut end) = intervals[0];
    for &(lo, hi) in &intervals[1..] {
        if lo > end {
            total += end - start;
            start = lo;
            end = hi;
        } else if hi > end {
            end = hi;
        }
    }
    total + (end - start)
}

pub fn union_area_of_frame(regions: &[Region]) -> f64 {
    let rects: Vec<Rect> = regions.iter().map(Region::rect).collect();
    union_area_of_rects(&rects)
}

/// Union area summed over every frame present in `results`.
pub fn union_area(results: &ResultSet) -> f64 {
    let frames: Vec<Vec<Rect>> = results
        .frame_ids()
        .map(|fid| results.regions_for_frame(fid).map(Region::rect).collect())
        .collect();

    #[cfg(feature = "parallel")]
    let total = frames
        .par_iter()
        .map(|rects| union_area_of_rects(rects))
        .sum();
    #[cfg(not(feature = "parallel"))]
    let total = frames.iter().map(|rects| union_area_of_rects(rects)).sum();

    total
}
