//! The top-level "always answer" request path.
//!
//! `CrowdAnalyzer::resolve` sequences the mitigation components into an
//! ordered chain of strategies: cache lookup, checked upstream call (batched
//! or direct), local fallback. The final link cannot miss, so `resolve`
//! always returns a well-formed result within bounded time and never
//! surfaces an error, a rate limit, or a timeout to the caller.
//!
//! All shared state lives in this explicitly constructed instance; two
//! analyzers (say, one per venue) are fully independent.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::batch::{BatchCoordinator, BatchStatsSnapshot};
use crate::breaker::CircuitBreaker;
use crate::cache::MultiLevelCache;
use crate::clock::{chrono_duration, Clock, SystemClock};
use crate::config::MitigationConfig;
use crate::dispatch::UpstreamDispatcher;
use crate::fallback::{FallbackContext, FallbackEstimator};
use crate::keys::KeyRotator;
use crate::types::{
    AnalysisRequest, AnalysisResult, AnalysisSource, Confidence, CrowdLevel, DataQuality,
    Fingerprint, ServiceKind,
};
use crate::upstream::{
    maps_payload, parse_maps_activity, parse_people_count, vision_payload, ReqwestUpstreamClient,
    UpstreamClient,
};

/// Degraded-trust state entered after repeated full-chain failures
/// (cache miss plus a failed or short-circuited upstream path).
struct EmergencyState {
    consecutive_failures: AtomicU32,
    activated_at: Mutex<Option<DateTime<Utc>>>,
}

/// Orchestrates cache, circuit breaker, key rotation, batching, and fallback
/// into a single request path that always answers.
pub struct CrowdAnalyzer<H: UpstreamClient + 'static> {
    config: MitigationConfig,
    clock: Arc<dyn Clock>,
    cache: Arc<MultiLevelCache>,
    breaker: Arc<CircuitBreaker>,
    rotator: Arc<KeyRotator>,
    dispatcher: Arc<UpstreamDispatcher<H>>,
    batches: BatchCoordinator<H>,
    fallback: Arc<FallbackEstimator>,
    emergency: EmergencyState,
    in_flight: Arc<AtomicUsize>,
}

impl CrowdAnalyzer<ReqwestUpstreamClient> {
    /// Build an analyzer with the production HTTP client.
    pub fn from_config(config: MitigationConfig) -> Self {
        let client = ReqwestUpstreamClient::new(
            config.vision.endpoint.clone(),
            config.maps.endpoint.clone(),
        );
        Self::with_clock(config, client, Arc::new(SystemClock))
    }

    /// Build an analyzer from the environment configuration surface.
    pub fn from_env() -> crate::error::Result<Self> {
        Ok(Self::from_config(MitigationConfig::from_env()?))
    }
}

impl<H: UpstreamClient + 'static> CrowdAnalyzer<H> {
    pub fn new(config: MitigationConfig, client: H) -> Self {
        Self::with_clock(config, client, Arc::new(SystemClock))
    }

    /// Build an analyzer with an injected clock. Every component shares it,
    /// so tests can simulate elapsed time without real delays.
    pub fn with_clock(config: MitigationConfig, client: H, clock: Arc<dyn Clock>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(&config.breaker, clock.clone()));
        let rotator = Arc::new(KeyRotator::new(&config, clock.clone()));
        let dispatcher = Arc::new(UpstreamDispatcher::new(
            client,
            breaker.clone(),
            rotator.clone(),
            config.request_timeout,
        ));
        let cache = Arc::new(MultiLevelCache::new(&config.cache, clock.clone()));
        let fallback = Arc::new(FallbackEstimator::new(
            cache.clone(),
            &config.cache,
            clock.clone(),
        ));
        let batches = BatchCoordinator::new(&config, dispatcher.clone(), fallback.clone(), clock.clone());

        Self {
            config,
            clock,
            cache,
            breaker,
            rotator,
            dispatcher,
            batches,
            fallback,
            emergency: EmergencyState {
                consecutive_failures: AtomicU32::new(0),
                activated_at: Mutex::new(None),
            },
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Resolve one analysis request. Never errors; every failure is absorbed
    /// into the `source`/`data_quality`/`confidence_level` fields of the
    /// returned result.
    #[tracing::instrument(skip(self, request), fields(service = %request.service))]
    pub async fn resolve(&self, request: AnalysisRequest) -> AnalysisResult {
        let started = Instant::now();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::Relaxed);
        });

        let fingerprint = request.fingerprint();

        // The resolution chain. Links are tried in order; the final one
        // cannot miss.
        if let Some(result) = self.try_cache(&fingerprint) {
            return result.with_response_time(elapsed_ms(started));
        }
        if let Some(result) = self.try_upstream(&request, &fingerprint).await {
            return result.with_response_time(elapsed_ms(started));
        }
        self.resolve_via_fallback(&request, &fingerprint)
            .with_response_time(elapsed_ms(started))
    }

    /// Caller-facing surface: analyze a frame (plus an optional location for
    /// area context) and always get a well-formed crowd-density result.
    pub async fn get_crowd_density(
        &self,
        image: Vec<u8>,
        location: Option<(f64, f64)>,
    ) -> AnalysisResult {
        match location {
            Some((lat, lng)) => {
                let (vision, maps) = futures::join!(
                    self.resolve(AnalysisRequest::vision(image)),
                    self.resolve(AnalysisRequest::maps(lat, lng)),
                );
                combine_results(vision, maps)
            }
            None => self.resolve(AnalysisRequest::vision(image)).await,
        }
    }

    /// Number of `resolve` calls currently in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Batch effectiveness counters.
    pub fn batch_stats(&self) -> BatchStatsSnapshot {
        self.batches.stats()
    }

    /// Whether the analyzer is currently in its degraded-trust mode.
    pub fn emergency_active(&self) -> bool {
        let mut activated_at = self.emergency.activated_at.lock();
        match *activated_at {
            None => false,
            Some(at) => {
                let elapsed = self.clock.now() - at;
                if elapsed >= chrono_duration(self.config.emergency.cooldown) {
                    tracing::info!("emergency mode cleared after cooldown");
                    *activated_at = None;
                    self.emergency.consecutive_failures.store(0, Ordering::Relaxed);
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Drain any open batch windows and stop their timers.
    pub fn shutdown(&self) {
        self.batches.shutdown();
    }

    // ------------------------------------------------------------------
    // Chain links
    // ------------------------------------------------------------------

    fn try_cache(&self, fingerprint: &Fingerprint) -> Option<AnalysisResult> {
        let hit = if self.emergency_active() {
            self.cache
                .get_relaxed(fingerprint, self.config.emergency.cache_extension_factor)
        } else {
            self.cache.get(fingerprint)
        };

        hit.map(|(mut value, tier)| {
            tracing::debug!(fingerprint = %fingerprint, tier = tier.as_str(), "cache hit");
            value.source = AnalysisSource::Cache;
            value.data_quality = tier.data_quality();
            value
        })
    }

    async fn try_upstream(
        &self,
        request: &AnalysisRequest,
        fingerprint: &Fingerprint,
    ) -> Option<AnalysisResult> {
        let service = request.service;

        // While emergency mode holds, do not hammer a recovering upstream
        // even if a key is technically available.
        if self.emergency_active() {
            tracing::debug!(service = %service, "emergency mode active, skipping network path");
            return None;
        }

        // Cheap read-only pre-check; the authoritative breaker/key checks run
        // inside the dispatch itself.
        if !self.dispatcher.preview(service) {
            tracing::debug!(service = %service, "network path unavailable (circuit open or no key)");
            self.note_full_chain_failure();
            return None;
        }

        if self.config.service(service).batch.enabled {
            self.upstream_batched(request, fingerprint).await
        } else {
            self.upstream_direct(request, fingerprint).await
        }
    }

    async fn upstream_batched(
        &self,
        request: &AnalysisRequest,
        fingerprint: &Fingerprint,
    ) -> Option<AnalysisResult> {
        let context = FallbackContext {
            service: request.service,
            fingerprint: fingerprint.clone(),
            frame: request.frame,
        };
        let handle = self.batches.enqueue(
            request.service,
            request.prompt.clone(),
            request.priority,
            context,
        );
        let result = self
            .batches
            .await_result(handle, self.config.result_timeout)
            .await;

        if result.source == AnalysisSource::Api {
            self.note_upstream_success(result.people_count);
            self.cache.put(fingerprint, &result);
        } else {
            // The window failed or the wait expired; the coordinator already
            // produced the fallback result, so return it as the final answer.
            self.note_full_chain_failure();
            if self.config.seed_fallback_results {
                self.cache.seed_fresh(fingerprint, &result);
            }
        }
        Some(result)
    }

    async fn upstream_direct(
        &self,
        request: &AnalysisRequest,
        fingerprint: &Fingerprint,
    ) -> Option<AnalysisResult> {
        let service = request.service;
        let payload = match (service, &request.image, request.location) {
            (ServiceKind::Vision, Some(image), _) => vision_payload(image, &request.prompt),
            (ServiceKind::Maps, _, Some((lat, lng))) => maps_payload(lat, lng, &request.prompt),
            _ => {
                tracing::debug!(service = %service, "request carries no upstream payload data");
                self.note_full_chain_failure();
                return None;
            }
        };

        match self.dispatcher.dispatch(service, payload).await {
            Ok(response) => match self.parse_direct(service, &response.body) {
                Ok(result) => {
                    self.note_upstream_success(result.people_count);
                    self.cache.put(fingerprint, &result);
                    Some(result)
                }
                Err(e) => {
                    tracing::warn!(service = %service, error = %e, "unusable upstream response");
                    self.note_full_chain_failure();
                    None
                }
            },
            Err(e) => {
                tracing::debug!(service = %service, error = %e, "upstream path failed");
                self.note_full_chain_failure();
                None
            }
        }
    }

    fn parse_direct(&self, service: ServiceKind, body: &str) -> crate::error::Result<AnalysisResult> {
        match service {
            ServiceKind::Vision => {
                let count = parse_people_count(body)?;
                Ok(AnalysisResult::from_count(
                    count,
                    AnalysisSource::Api,
                    DataQuality::Excellent,
                    "ai vision",
                    self.clock.now(),
                ))
            }
            ServiceKind::Maps => {
                let factor = parse_maps_activity(body)?;
                // The maps factor is already a density score; back out a
                // nominal people count so the result type stays uniform.
                let mut result = AnalysisResult::from_count(
                    factor / 3,
                    AnalysisSource::Api,
                    DataQuality::Excellent,
                    "maps api",
                    self.clock.now(),
                );
                result.density_score = f64::from(factor);
                result.crowd_level = CrowdLevel::from_score(result.density_score);
                Ok(result)
            }
        }
    }

    fn resolve_via_fallback(
        &self,
        request: &AnalysisRequest,
        fingerprint: &Fingerprint,
    ) -> AnalysisResult {
        let context = FallbackContext {
            service: request.service,
            fingerprint: fingerprint.clone(),
            frame: request.frame,
        };
        let result = self.fallback.estimate(&context);
        if self.config.seed_fallback_results {
            self.cache.seed_fresh(fingerprint, &result);
        }
        result
    }

    // ------------------------------------------------------------------
    // Emergency accounting
    // ------------------------------------------------------------------

    fn note_full_chain_failure(&self) {
        let failures = self
            .emergency
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if failures >= self.config.emergency.activation_threshold {
            let mut activated_at = self.emergency.activated_at.lock();
            if activated_at.is_none() {
                tracing::warn!(failures, "emergency mode activated");
                *activated_at = Some(self.clock.now());
            }
        }
    }

    fn note_upstream_success(&self, people_count: u32) {
        self.emergency.consecutive_failures.store(0, Ordering::Relaxed);
        let mut activated_at = self.emergency.activated_at.lock();
        if activated_at.take().is_some() {
            tracing::info!("emergency mode cleared after upstream success");
        }
        drop(activated_at);
        self.fallback.observe(people_count);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Merge a vision result with a maps result using confidence-weighted
/// density averaging. The people count stays with the vision result; the
/// maps factor shifts the density score and crowd level.
fn combine_results(vision: AnalysisResult, maps: AnalysisResult) -> AnalysisResult {
    let vision_weight = vision.source.confidence_weight();
    let maps_weight = maps.source.confidence_weight();
    let total = vision_weight + maps_weight;
    let density =
        (vision.density_score * vision_weight + maps.density_score * maps_weight) / total;

    let analysis_method = format!("{} + {}", vision.analysis_method, maps.analysis_method);
    let data_quality = worse_quality(vision.data_quality, maps.data_quality);
    let response_time_ms = vision.response_time_ms + maps.response_time_ms;

    let mut result = vision;
    result.density_score = (density * 10.0).round() / 10.0;
    result.crowd_level = CrowdLevel::from_score(density);
    result.confidence_level = Confidence::from_weight(total / 2.0);
    result.analysis_method = analysis_method;
    result.data_quality = data_quality;
    result.response_time_ms = response_time_ms;
    result
}

fn worse_quality(a: DataQuality, b: DataQuality) -> DataQuality {
    fn rank(q: DataQuality) -> u8 {
        match q {
            DataQuality::Excellent => 3,
            DataQuality::Good => 2,
            DataQuality::Fair => 1,
            DataQuality::Estimated => 0,
        }
    }
    if rank(a) <= rank(b) {
        a
    } else {
        b
    }
}
