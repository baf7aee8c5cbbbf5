//! Local, non-networked crowd estimation.
//!
//! The last line of defense: an ordered chain where the first applicable
//! link wins and the final link cannot fail. Used when every networked path
//! is exhausted, when a batch window dies, and when a caller's wait times
//! out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngExt as _;

use crate::cache::MultiLevelCache;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::types::{
    AnalysisResult, AnalysisSource, Confidence, DataQuality, FrameSummary, Fingerprint,
    ServiceKind,
};

/// Bounds for the pseudo-random last resort.
const RANDOM_ESTIMATE_MIN: u32 = 5;
const RANDOM_ESTIMATE_MAX: u32 = 20;

/// Cap applied to the frame heuristic, matching the densest crowd one frame
/// can plausibly show at this camera scale.
const HEURISTIC_MAX_COUNT: u32 = 35;

/// How many recent successful counts feed the historical average.
const HISTORY_CAPACITY: usize = 32;

/// Everything the estimator may draw on for one request.
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub service: ServiceKind,
    pub fingerprint: Fingerprint,
    pub frame: Option<FrameSummary>,
}

/// Produces a usable result without any network access.
///
/// Chain, first applicable wins:
/// 1. the most recent cache entry for the fingerprint (any age), confidence
///    decayed by how stale it is;
/// 2. the most recent entry for any fingerprint, if it is younger than the
///    longest cache tier;
/// 3. a luminance/region heuristic over the caller's frame summary;
/// 4. the historical average of recent successful counts, else a bounded
///    pseudo-random estimate. This link never fails.
pub struct FallbackEstimator {
    cache: Arc<MultiLevelCache>,
    clock: Arc<dyn Clock>,
    decay_bands: CacheConfig,
    history: Mutex<VecDeque<u32>>,
}

impl FallbackEstimator {
    pub fn new(cache: Arc<MultiLevelCache>, config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            clock,
            decay_bands: config.clone(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Feed a successful upstream count into the historical average.
    pub fn observe(&self, people_count: u32) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(people_count);
    }

    /// Produce an estimate. Infallible by construction.
    pub fn estimate(&self, context: &FallbackContext) -> AnalysisResult {
        if let Some(result) = self.from_cache_decay(context) {
            return result;
        }
        if let Some(frame) = &context.frame {
            return self.from_frame(frame);
        }
        self.last_resort()
    }

    fn from_cache_decay(&self, context: &FallbackContext) -> Option<AnalysisResult> {
        let (value, age) = self.cache.latest(&context.fingerprint).or_else(|| {
            // No history for this fingerprint: a recent answer for a related
            // one is still better than guessing.
            self.cache
                .latest_any()
                .filter(|(_, age)| *age < self.decay_bands.long_ttl)
        })?;

        let steps = self.decay_steps(age);
        let mut result = value;
        result.source = AnalysisSource::Cache;
        result.confidence_level = result.confidence_level.degrade(steps);
        result.data_quality = if age < self.decay_bands.long_ttl {
            DataQuality::Fair
        } else {
            DataQuality::Estimated
        };
        result.analysis_method = "cached extrapolation".to_string();
        result.timestamp = self.clock.now();
        tracing::debug!(
            fingerprint = %context.fingerprint,
            age_secs = age.as_secs(),
            "fallback served from cache decay"
        );
        Some(result)
    }

    fn decay_steps(&self, age: Duration) -> u32 {
        if age < self.decay_bands.fresh_ttl {
            0
        } else if age < self.decay_bands.medium_ttl {
            1
        } else if age < self.decay_bands.long_ttl {
            2
        } else {
            3
        }
    }

    /// Geometric estimate from precomputed frame statistics: average the
    /// person-sized region count with a darkness-density estimate, clamped
    /// to a plausible band.
    fn from_frame(&self, frame: &FrameSummary) -> AnalysisResult {
        let contour_estimate = frame.region_count;
        let density_estimate = (frame.dark_pixel_ratio.clamp(0.0, 1.0) * 30.0) as u32;
        let averaged = (contour_estimate + density_estimate) / 2;
        let count = averaged.max(1).min(HEURISTIC_MAX_COUNT);

        tracing::debug!(
            region_count = frame.region_count,
            dark_pixel_ratio = frame.dark_pixel_ratio,
            estimate = count,
            "fallback served from frame heuristic"
        );
        AnalysisResult::from_count(
            count,
            AnalysisSource::LocalCv,
            DataQuality::Fair,
            "contour heuristic",
            self.clock.now(),
        )
    }

    fn last_resort(&self) -> AnalysisResult {
        let history = self.history.lock();
        let (count, method) = if history.is_empty() {
            let count = rand::rng().random_range(RANDOM_ESTIMATE_MIN..=RANDOM_ESTIMATE_MAX);
            (count, "statistical estimate")
        } else {
            let sum: u64 = history.iter().map(|c| u64::from(*c)).sum();
            let mean = (sum / history.len() as u64) as u32;
            (mean, "historical average")
        };
        drop(history);

        let mut result = AnalysisResult::from_count(
            count,
            AnalysisSource::Estimate,
            DataQuality::Estimated,
            method,
            self.clock.now(),
        );
        result.confidence_level = Confidence::Low;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::Fingerprint;

    fn setup() -> (FallbackEstimator, Arc<MultiLevelCache>, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let config = CacheConfig::default();
        let cache = Arc::new(MultiLevelCache::new(&config, clock.clone()));
        let estimator = FallbackEstimator::new(cache.clone(), &config, clock.clone());
        (estimator, cache, clock)
    }

    fn context(fingerprint: Fingerprint) -> FallbackContext {
        FallbackContext {
            service: ServiceKind::Vision,
            fingerprint,
            frame: None,
        }
    }

    #[test]
    fn test_cache_decay_link() {
        let (estimator, cache, clock) = setup();
        let fp = Fingerprint::from_image(b"frame", "prompt");
        let stored = AnalysisResult::from_count(
            18,
            AnalysisSource::Api,
            DataQuality::Excellent,
            "ai vision",
            clock.now(),
        );
        cache.put(&fp, &stored);

        clock.advance(Duration::from_secs(20 * 60));
        let result = estimator.estimate(&context(fp));
        assert_eq!(result.people_count, 18);
        assert_eq!(result.source, AnalysisSource::Cache);
        // 20 minutes old: two decay steps off very_high.
        assert_eq!(result.confidence_level, Confidence::Medium);
        assert_eq!(result.data_quality, DataQuality::Fair);
    }

    #[test]
    fn test_related_fingerprint_reuse() {
        let (estimator, cache, clock) = setup();
        let stored_fp = Fingerprint::from_image(b"other-frame", "prompt");
        let stored = AnalysisResult::from_count(
            9,
            AnalysisSource::Api,
            DataQuality::Excellent,
            "ai vision",
            clock.now(),
        );
        cache.put(&stored_fp, &stored);

        let unseen = Fingerprint::from_image(b"new-frame", "prompt");
        let result = estimator.estimate(&context(unseen));
        assert_eq!(result.people_count, 9);
        assert_eq!(result.source, AnalysisSource::Cache);
    }

    #[test]
    fn test_frame_heuristic_link() {
        let (estimator, _, _) = setup();
        let fp = Fingerprint::from_image(b"frame", "prompt");
        let mut ctx = context(fp);
        ctx.frame = Some(FrameSummary {
            width: 640,
            height: 480,
            dark_pixel_ratio: 0.5,
            region_count: 11,
        });

        let result = estimator.estimate(&ctx);
        // (11 + 15) / 2 = 13
        assert_eq!(result.people_count, 13);
        assert_eq!(result.source, AnalysisSource::LocalCv);
        assert_eq!(result.confidence_level, Confidence::Medium);
    }

    #[test]
    fn test_frame_heuristic_bounds() {
        let (estimator, _, _) = setup();
        let fp = Fingerprint::from_image(b"frame", "prompt");

        let mut ctx = context(fp.clone());
        ctx.frame = Some(FrameSummary {
            width: 640,
            height: 480,
            dark_pixel_ratio: 0.0,
            region_count: 0,
        });
        assert_eq!(estimator.estimate(&ctx).people_count, 1);

        let mut ctx = context(fp);
        ctx.frame = Some(FrameSummary {
            width: 640,
            height: 480,
            dark_pixel_ratio: 1.0,
            region_count: 500,
        });
        assert_eq!(estimator.estimate(&ctx).people_count, HEURISTIC_MAX_COUNT);
    }

    #[test]
    fn test_last_resort_random_is_bounded() {
        let (estimator, _, _) = setup();
        for _ in 0..50 {
            let fp = Fingerprint::from_image(b"frame", "prompt");
            let result = estimator.estimate(&context(fp));
            assert_eq!(result.source, AnalysisSource::Estimate);
            assert_eq!(result.confidence_level, Confidence::Low);
            assert!(
                (RANDOM_ESTIMATE_MIN..=RANDOM_ESTIMATE_MAX).contains(&result.people_count),
                "estimate {} out of bounds",
                result.people_count
            );
        }
    }

    #[test]
    fn test_last_resort_prefers_historical_average() {
        let (estimator, _, _) = setup();
        estimator.observe(10);
        estimator.observe(20);
        estimator.observe(30);

        let fp = Fingerprint::from_image(b"frame", "prompt");
        let result = estimator.estimate(&context(fp));
        assert_eq!(result.people_count, 20);
        assert_eq!(result.analysis_method, "historical average");
        assert_eq!(result.source, AnalysisSource::Estimate);
    }

    #[test]
    fn test_stale_unrelated_entries_are_not_reused() {
        let (estimator, cache, clock) = setup();
        let stored_fp = Fingerprint::from_image(b"other-frame", "prompt");
        let stored = AnalysisResult::from_count(
            9,
            AnalysisSource::Api,
            DataQuality::Excellent,
            "ai vision",
            clock.now(),
        );
        cache.put(&stored_fp, &stored);

        // Entry is older than the longest tier: skip to the last resort.
        clock.advance(Duration::from_secs(2 * 60 * 60));
        let unseen = Fingerprint::from_image(b"new-frame", "prompt");
        let result = estimator.estimate(&context(unseen));
        assert_eq!(result.source, AnalysisSource::Estimate);
    }
}
