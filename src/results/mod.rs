//! Frame-indexed collection of regions.
//!
//! `ResultSet` owns an ordered list of regions plus a private
//! `frame_id -> positions` index. Every mutation goes through a method that
//! keeps both in lock-step; callers only ever get read-only views.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};

use crate::geometry::iou;
use crate::region::Region;

mod format;

pub use format::{format_float, ResultFormat};
pub(crate) use format::csv_field;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    regions: Vec<Region>,
    by_frame: BTreeMap<u32, Vec<usize>>,
}

/// Which side of a duplicate pair keeps its box, confidence and origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Winner {
    Existing,
    Incoming,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Region> {
        self.regions.iter()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn into_regions(self) -> Vec<Region> {
        self.regions
    }

    /// Frame ids that have at least one region, ascending.
    pub fn frame_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_frame.keys().copied()
    }

    pub fn contains_frame(&self, frame_id: u32) -> bool {
        self.by_frame.contains_key(&frame_id)
    }

    pub fn regions_for_frame(&self, frame_id: u32) -> impl Iterator<Item = &Region> + '_ {
        self.by_frame
            .get(&frame_id)
            .into_iter()
            .flatten()
            .map(move |&pos| &self.regions[pos])
    }

    /// Number of regions with confidence strictly above `threshold`.
    pub fn count_above(&self, threshold: f64) -> usize {
        self.regions
            .iter()
            .filter(|r| r.confidence > threshold)
            .count()
    }

    pub fn max_resolution(&self) -> Option<f64> {
        self.regions.iter().map(|r| r.resolution).reduce(f64::max)
    }

    /// Frame id -> real detections. Frames holding only placeholders map to an empty list.
    pub fn frame_map(&self) -> BTreeMap<u32, Vec<Region>> {
        let mut map: BTreeMap<u32, Vec<Region>> = BTreeMap::new();
        for region in &self.regions {
            let entry = map.entry(region.frame_id).or_default();
            if !region.is_placeholder() {
                entry.push(region.clone());
            }
        }
        map
    }

    /// Copy of this set with every gap-filling placeholder removed.
    pub fn without_placeholders(&self) -> ResultSet {
        self.regions
            .iter()
            .filter(|r| !r.is_placeholder())
            .cloned()
            .collect()
    }

    /// Unconditional insert.
    pub fn append(&mut self, region: Region) {
        let pos = self.regions.len();
        self.by_frame.entry(region.frame_id).or_default().push(pos);
        self.regions.push(region);
    }

    /// Removes the first region equal to `region` from both the list and the index.
    pub fn remove(&mut self, region: &Region) -> Result<Region> {
        let pos = self
            .by_frame
            .get(&region.frame_id)
            .and_then(|positions| positions.iter().copied().find(|&p| self.regions[p] == *region))
            .ok_or_else(|| anyhow!("region not present in result set: {}", region))?;
        let removed = self.regions.remove(pos);
        self.rebuild_index();
        Ok(removed)
    }

    /// Dedup-aware insert.
    ///
    /// With `threshold >= 1` the region is appended unconditionally. Otherwise a
    /// same-frame duplicate (see [`Region::is_same`]) absorbs the new region
    /// according to origin priority, except that two tracking hypotheses coexist.
    pub fn add_with_threshold(&mut self, region: Region, threshold: f64) {
        if threshold >= 1.0 {
            self.append(region);
            return;
        }
        let Some(pos) = self.find_duplicate(&region, threshold) else {
            self.append(region);
            return;
        };

        if self.regions[pos].origin_has("tracking") && region.origin_has("tracking") {
            self.append(region);
            return;
        }

        let existing = &mut self.regions[pos];
        if resolve_duplicate(existing, &region) == Winner::Incoming {
            existing.set_rect(region.rect());
            existing.confidence = region.confidence;
            existing.origin = region.origin;
        }
        existing.feature = None;
    }

    /// Adds every region of `other` with [`ResultSet::add_with_threshold`].
    pub fn combine(&mut self, other: &ResultSet, threshold: f64) {
        for region in other.iter() {
            self.add_with_threshold(region.clone(), threshold);
        }
    }

    /// Greedy non-max suppression over the whole set.
    ///
    /// Repeatedly keeps the most confident remaining region and drops every
    /// other region on its frame with IoU above `threshold`. The survivors are
    /// ordered by frame id.
    pub fn suppress(&mut self, threshold: f64) {
        let mut remaining = std::mem::take(&mut self.regions);
        let mut kept = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut best = 0;
            for (idx, region) in remaining.iter().enumerate().skip(1) {
                if region.confidence > remaining[best].confidence {
                    best = idx;
                }
            }
            let winner = remaining.remove(best);
            let rect = winner.rect();
            remaining.retain(|r| r.frame_id != winner.frame_id || iou(&r.rect(), &rect) <= threshold);
            kept.push(winner);
        }

        kept.sort_by_key(|r| r.frame_id);
        self.regions = kept;
        self.rebuild_index();
    }

    /// Ensures every frame in `[0, frame_count)` has at least one region.
    ///
    /// Missing frames get a placeholder at the highest resolution present in
    /// the set (1.0 for an empty set). The set is then ordered by frame id.
    pub fn fill_gaps(&mut self, frame_count: u32) {
        let resolution = self.max_resolution().unwrap_or(1.0);
        let present: BTreeSet<u32> = self.frame_ids().collect();
        for frame_id in (0..frame_count).filter(|fid| !present.contains(fid)) {
            self.append(Region::placeholder(frame_id, resolution));
        }
        self.sort_by_frame();
    }

    /// Stable sort by frame id.
    pub fn sort_by_frame(&mut self) {
        self.regions.sort_by_key(|r| r.frame_id);
        self.rebuild_index();
    }

    fn find_duplicate(&self, region: &Region, threshold: f64) -> Option<usize> {
        let mut best: Option<usize> = None;
        for &pos in self.by_frame.get(&region.frame_id)? {
            let candidate = &self.regions[pos];
            if !candidate.is_same(region, threshold) {
                continue;
            }
            if best.map_or(true, |b| candidate.confidence > self.regions[b].confidence) {
                best = Some(pos);
            }
        }
        best
    }

    fn rebuild_index(&mut self) {
        self.by_frame.clear();
        for (pos, region) in self.regions.iter().enumerate() {
            self.by_frame.entry(region.frame_id).or_default().push(pos);
        }
    }
}

/// Origin priority for two duplicates.
///
/// Same origin: higher confidence wins, the incoming region on ties. A "high"
/// detection beats a "low" one in either direction. Any other pairing lets the
/// incoming region overwrite the existing one.
fn resolve_duplicate(existing: &Region, incoming: &Region) -> Winner {
    if existing.origin == incoming.origin {
        if existing.confidence > incoming.confidence {
            Winner::Existing
        } else {
            Winner::Incoming
        }
    } else if existing.origin_has("low") && incoming.origin_has("high") {
        Winner::Incoming
    } else if existing.origin_has("high") && incoming.origin_has("low") {
        Winner::Existing
    } else {
        Winner::Incoming
    }
}

impl FromIterator<Region> for ResultSet {
    fn from_iter<I: IntoIterator<Item = Region>>(iter: I) -> Self {
        let mut results = ResultSet::new();
        for region in iter {
            results.append(region);
        }
        results
    }
}

impl Extend<Region> for ResultSet {
    fn extend<I: IntoIterator<Item = Region>>(&mut self, iter: I) {
        for region in iter {
            self.append(region);
        }
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a Region;
    type IntoIter = std::slice::Iter<'a, Region>;

    fn into_iter(self) -> Self::IntoIter {
        self.regions.iter()
    }
}
