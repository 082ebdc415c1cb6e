use crate::config::AnalysisConfig;
use crate::region::Region;
use crate::results::ResultSet;
use crate::FrameRange;

use super::RoiCache;

/// Decides which low-phase detections are re-analyzed at high quality.
pub trait RecheckPolicy: Send {
    fn name(&self) -> &'static str;

    /// Regions to request in the high phase for `range`, already enlarged.
    fn select_regions_for_recheck(
        &self,
        cache: &RoiCache,
        low: &ResultSet,
        range: FrameRange,
    ) -> Vec<Region>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecheckReason {
    /// Confidence between the low and high thresholds.
    Uncertain,
    /// Nothing confirmed yet in the block.
    NewlyAppeared,
    /// Block confirmation is too old, too coarse or for another label.
    Stale,
}

/// Confidence window and size bounds shared by both policies.
#[derive(Clone, Copy, Debug)]
struct CandidateFilter {
    low_threshold: f64,
    high_threshold: f64,
    min_object_size: f64,
    max_object_size: f64,
}

impl CandidateFilter {
    fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            low_threshold: config.low_threshold,
            high_threshold: config.high_threshold,
            min_object_size: config.min_object_size,
            max_object_size: config.max_object_size,
        }
    }

    fn admits(&self, region: &Region) -> bool {
        let area = region.area();
        !region.is_placeholder()
            && region.confidence >= self.low_threshold
            && area >= self.min_object_size
            && area <= self.max_object_size
    }

    fn is_uncertain(&self, region: &Region) -> bool {
        region.confidence < self.high_threshold
    }
}

fn enlarged(region: &Region, ratio: f64) -> Region {
    let mut selected = region.clone();
    selected.feature = None;
    if ratio > 0.0 {
        selected.enlarge(ratio);
    }
    selected
}

/// Cache-aware policy: uncertain detections plus anything the cache cannot vouch for.
#[derive(Clone, Debug)]
pub struct StalenessPolicy {
    filter: CandidateFilter,
    max_age: u32,
    high_resolution: f64,
    enlarge_ratio: f64,
}

impl StalenessPolicy {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            filter: CandidateFilter::from_config(config),
            max_age: config.cache_max_age(),
            high_resolution: config.high_resolution,
            enlarge_ratio: config.rpn_enlarge_ratio,
        }
    }

    /// Why `region` needs a second look, or `None` when the cache covers it.
    pub fn reason_for(
        &self,
        cache: &RoiCache,
        region: &Region,
        range: FrameRange,
    ) -> Option<RecheckReason> {
        if !self.filter.admits(region) {
            return None;
        }
        if self.filter.is_uncertain(region) {
            return Some(RecheckReason::Uncertain);
        }
        let Some(state) = cache.state_for(region) else {
            return Some(RecheckReason::NewlyAppeared);
        };
        let age = range.start.saturating_sub(state.confirmed_at);
        if age > self.max_age
            || state.resolution < self.high_resolution
            || state.label != region.label
        {
            return Some(RecheckReason::Stale);
        }
        None
    }
}

impl RecheckPolicy for StalenessPolicy {
    fn name(&self) -> &'static str {
        "staleness"
    }

    fn select_regions_for_recheck(
        &self,
        cache: &RoiCache,
        low: &ResultSet,
        range: FrameRange,
    ) -> Vec<Region> {
        let mut selected = Vec::new();
        let (mut uncertain, mut fresh, mut stale) = (0usize, 0usize, 0usize);
        for frame_id in range.frames() {
            for region in low.regions_for_frame(frame_id) {
                match self.reason_for(cache, region, range) {
                    Some(RecheckReason::Uncertain) => uncertain += 1,
                    Some(RecheckReason::NewlyAppeared) => fresh += 1,
                    Some(RecheckReason::Stale) => stale += 1,
                    None => continue,
                }
                selected.push(enlarged(region, self.enlarge_ratio));
            }
        }
        log::debug!(
            "recheck {}: {} uncertain, {} new, {} stale",
            range,
            uncertain,
            fresh,
            stale
        );
        selected
    }
}

/// Cache-blind policy: re-checks every detection inside the confidence window.
#[derive(Clone, Debug)]
pub struct UncertaintyPolicy {
    filter: CandidateFilter,
    enlarge_ratio: f64,
}

impl UncertaintyPolicy {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            filter: CandidateFilter::from_config(config),
            enlarge_ratio: config.rpn_enlarge_ratio,
        }
    }
}

impl RecheckPolicy for UncertaintyPolicy {
    fn name(&self) -> &'static str {
        "uncertainty"
    }

    fn select_regions_for_recheck(
        &self,
        _cache: &RoiCache,
        low: &ResultSet,
        range: FrameRange,
    ) -> Vec<Region> {
        range
            .frames()
            .flat_map(|fid| low.regions_for_frame(fid))
            .filter(|r| self.filter.admits(r) && self.filter.is_uncertain(r))
            .map(|r| enlarged(r, self.enlarge_ratio))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            batch_size: 10,
            ..AnalysisConfig::default()
        }
    }

    fn car(frame_id: u32, conf: f64) -> Region {
        Region::new(frame_id, 0.4, 0.4, 0.1, 0.1, conf, "car", 0.8, "low")
    }

    fn confirmed(cache: &mut RoiCache, frame_id: u32, label: &str, resolution: f64, range: FrameRange) {
        let results: ResultSet = vec![Region::new(
            frame_id, 0.4, 0.4, 0.1, 0.1, 0.9, label, resolution, "high",
        )]
        .into_iter()
        .collect();
        cache.update(range, &results).expect("cache update");
    }

    #[test]
    fn uncertain_detections_are_selected() {
        let policy = StalenessPolicy::from_config(&config());
        let cache = RoiCache::new(16, 9);
        let range = FrameRange::new(0, 10);
        assert_eq!(
            policy.reason_for(&cache, &car(0, 0.5), range),
            Some(RecheckReason::Uncertain)
        );
        assert_eq!(policy.reason_for(&cache, &car(0, 0.2), range), None);
    }

    #[test]
    fn confident_detection_in_empty_block_is_new() {
        let policy = StalenessPolicy::from_config(&config());
        let cache = RoiCache::new(16, 9);
        assert_eq!(
            policy.reason_for(&cache, &car(0, 0.95), FrameRange::new(0, 10)),
            Some(RecheckReason::NewlyAppeared)
        );
    }

    #[test]
    fn fresh_cache_entry_suppresses_recheck() {
        let policy = StalenessPolicy::from_config(&config());
        let mut cache = RoiCache::new(16, 9);
        confirmed(&mut cache, 8, "car", 1.0, FrameRange::new(0, 10));
        assert_eq!(policy.reason_for(&cache, &car(12, 0.95), FrameRange::new(10, 20)), None);
    }

    #[test]
    fn old_coarse_or_relabelled_entries_are_stale() {
        let policy = StalenessPolicy::from_config(&config());

        let mut old = RoiCache::new(16, 9);
        confirmed(&mut old, 0, "car", 1.0, FrameRange::new(0, 10));
        assert_eq!(
            policy.reason_for(&old, &car(40, 0.95), FrameRange::new(40, 50)),
            Some(RecheckReason::Stale)
        );

        let mut coarse = RoiCache::new(16, 9);
        confirmed(&mut coarse, 8, "car", 0.8, FrameRange::new(0, 10));
        assert_eq!(
            policy.reason_for(&coarse, &car(10, 0.95), FrameRange::new(10, 20)),
            Some(RecheckReason::Stale)
        );

        let mut relabelled = RoiCache::new(16, 9);
        confirmed(&mut relabelled, 8, "truck", 1.0, FrameRange::new(0, 10));
        assert_eq!(
            policy.reason_for(&relabelled, &car(10, 0.95), FrameRange::new(10, 20)),
            Some(RecheckReason::Stale)
        );
    }

    #[test]
    fn oversized_and_placeholder_regions_are_ignored() {
        let policy = StalenessPolicy::from_config(&config());
        let cache = RoiCache::new(16, 9);
        let big = Region::new(0, 0.0, 0.0, 0.9, 0.9, 0.5, "car", 0.8, "low");
        let range = FrameRange::new(0, 10);
        assert_eq!(policy.reason_for(&cache, &big, range), None);
        assert_eq!(policy.reason_for(&cache, &Region::placeholder(0, 0.8), range), None);
    }

    #[test]
    fn selection_is_limited_to_range_and_enlarged() {
        let cfg = AnalysisConfig {
            rpn_enlarge_ratio: 0.5,
            ..config()
        };
        let policy = StalenessPolicy::from_config(&cfg);
        let low: ResultSet = vec![car(3, 0.5), car(12, 0.5)].into_iter().collect();
        let selected =
            policy.select_regions_for_recheck(&RoiCache::new(16, 9), &low, FrameRange::new(0, 10));
        assert_eq!(selected.len(), 1);
        let r = &selected[0];
        assert_eq!(r.frame_id, 3);
        assert!((r.x - 0.35).abs() < 1e-9);
        assert!((r.w - 0.2).abs() < 1e-9);
    }

    #[test]
    fn uncertainty_policy_ignores_cache() {
        let policy = UncertaintyPolicy::from_config(&config());
        let low: ResultSet = vec![car(0, 0.5), car(1, 0.95)].into_iter().collect();
        let selected =
            policy.select_regions_for_recheck(&RoiCache::new(16, 9), &low, FrameRange::new(0, 10));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].confidence, 0.5);
    }
}
