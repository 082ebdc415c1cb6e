//! Cross-detector deduplication.
//!
//! For every frame, regions above a confidence floor become nodes of an overlap
//! graph (edge: same label and IoU above the threshold). Each connected
//! component collapses into its bounding rectangle. The representative member
//! is chosen by spatial extremes, not by confidence: frame id, confidence,
//! label, resolution and origin come from the leftmost member and the y-extent
//! starts at the topmost member.
//!
//! Clustering is repeated on the merged boxes until no edge remains, so
//! merging an already merged set is a no-op.

use std::collections::BTreeMap;

use crate::geometry::iou;
use crate::region::Region;
use crate::results::ResultSet;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Merges overlapping same-label regions frame by frame.
///
/// Regions with confidence below `min_confidence` are dropped first. The
/// output holds one region per connected component per frame, frames in
/// ascending order and larger components first within a frame.
pub fn merge_boxes(
    frames: &BTreeMap<u32, Vec<Region>>,
    min_confidence: f64,
    iou_threshold: f64,
) -> ResultSet {
    let work: Vec<Vec<Region>> = frames
        .values()
        .map(|regions| {
            regions
                .iter()
                .filter(|r| r.confidence >= min_confidence)
                .cloned()
                .collect()
        })
        .collect();

    #[cfg(feature = "parallel")]
    let merged: Vec<Vec<Region>> = work
        .into_par_iter()
        .map(|regions| merge_frame(regions, iou_threshold))
        .collect();
    #[cfg(not(feature = "parallel"))]
    let merged: Vec<Vec<Region>> = work
        .into_iter()
        .map(|regions| merge_frame(regions, iou_threshold))
        .collect();

    merged.into_iter().flatten().collect()
}

/// [`merge_boxes`] over the real detections of a result set.
pub fn merge_results(results: &ResultSet, min_confidence: f64, iou_threshold: f64) -> ResultSet {
    merge_boxes(&results.frame_map(), min_confidence, iou_threshold)
}

fn merge_frame(regions: Vec<Region>, iou_threshold: f64) -> Vec<Region> {
    let mut current = regions;
    loop {
        let groups = overlap_components(&current, iou_threshold);
        let merged_any = groups.len() < current.len();
        current = groups
            .iter()
            .map(|members| merge_component(&current, members))
            .collect();
        if !merged_any {
            return current;
        }
    }
}

/// Connected components of the overlap graph, largest first.
fn overlap_components(regions: &[Region], iou_threshold: f64) -> Vec<Vec<usize>> {
    let mut sets = DisjointSets::new(regions.len());
    for i in 0..regions.len() {
        for j in (i + 1)..regions.len() {
            let (a, b) = (&regions[i], &regions[j]);
            if a.label == b.label && iou(&a.rect(), &b.rect()) > iou_threshold {
                sets.union(i, j);
            }
        }
    }

    let mut by_root: BTreeMap<usize, usize> = BTreeMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for idx in 0..regions.len() {
        let root = sets.find(idx);
        let slot = *by_root.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(idx);
    }
    groups.sort_by(|a, b| b.len().cmp(&a.len()));
    groups
}

fn merge_component(regions: &[Region], members: &[usize]) -> Region {
    let first = &regions[members[0]];
    let (mut left, mut top, mut right, mut bottom) = (first, first, first, first);
    for region in members[1..].iter().map(|&idx| &regions[idx]) {
        if region.x < left.x {
            left = region;
        }
        if region.y < top.y {
            top = region;
        }
        if region.x + region.w > right.x + right.w {
            right = region;
        }
        if region.y + region.h > bottom.y + bottom.h {
            bottom = region;
        }
    }
    Region::new(
        left.frame_id,
        left.x,
        top.y,
        right.x + right.w - left.x,
        bottom.y + bottom.h - top.y,
        left.confidence,
        left.label.clone(),
        left.resolution,
        left.origin.clone(),
    )
}

struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, idx: usize) -> usize {
        let mut root = idx;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = idx;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}
