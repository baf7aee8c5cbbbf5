//! Batch coordination: accumulate pending analysis requests per service and
//! flush them as one combined multi-part upstream call.
//!
//! A window flushes when it reaches `max_batch_size` entries or when
//! `batch_timeout` elapses after its first admission, whichever comes first.
//! Both triggers can race; taking the window out of its slot under the slot
//! lock guarantees exactly one flush. Every admitted entry is resolved with
//! exactly one result — demultiplexed from the combined response on success,
//! produced by the fallback estimator when the call or the parse fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{BatchConfig, MitigationConfig};
use crate::dispatch::UpstreamDispatcher;
use crate::fallback::{FallbackContext, FallbackEstimator};
use crate::types::{AnalysisResult, AnalysisSource, DataQuality, Priority, RequestId, ServiceKind};
use crate::upstream::{multipart_payload, parse_batch_counts, UpstreamClient};

/// Handle a caller uses to wait for its batched result.
pub struct ResultHandle {
    pub request_id: RequestId,
    rx: oneshot::Receiver<AnalysisResult>,
    context: FallbackContext,
}

struct WindowEntry {
    request_id: RequestId,
    fragment: String,
    #[allow(dead_code)] // Admission order is the demux contract; priority is carried for observability.
    priority: Priority,
    context: FallbackContext,
    responder: oneshot::Sender<AnalysisResult>,
}

struct OpenWindow {
    id: Uuid,
    entries: Vec<WindowEntry>,
    opened_at: DateTime<Utc>,
}

/// Running counters for batch effectiveness.
#[derive(Default)]
pub struct BatchStats {
    total_requests: AtomicU64,
    upstream_calls: AtomicU64,
    saved_calls: AtomicU64,
    failed_windows: AtomicU64,
}

/// Point-in-time view of `BatchStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchStatsSnapshot {
    pub total_requests: u64,
    pub upstream_calls: u64,
    /// API calls avoided by coalescing (window size minus one, per window).
    pub saved_calls: u64,
    pub failed_windows: u64,
}

struct Inner<H: UpstreamClient> {
    windows: HashMap<ServiceKind, Mutex<Option<OpenWindow>>>,
    configs: HashMap<ServiceKind, BatchConfig>,
    dispatcher: Arc<UpstreamDispatcher<H>>,
    fallback: Arc<FallbackEstimator>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    stats: BatchStats,
}

/// Aggregates pending requests into per-service batch windows.
pub struct BatchCoordinator<H: UpstreamClient + 'static> {
    inner: Arc<Inner<H>>,
}

impl<H: UpstreamClient + 'static> Clone for BatchCoordinator<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: UpstreamClient + 'static> BatchCoordinator<H> {
    pub fn new(
        config: &MitigationConfig,
        dispatcher: Arc<UpstreamDispatcher<H>>,
        fallback: Arc<FallbackEstimator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut windows = HashMap::new();
        let mut configs = HashMap::new();
        for service in ServiceKind::all() {
            windows.insert(service, Mutex::new(None));
            configs.insert(service, config.service(service).batch.clone());
        }
        Self {
            inner: Arc::new(Inner {
                windows,
                configs,
                dispatcher,
                fallback,
                clock,
                cancel: CancellationToken::new(),
                stats: BatchStats::default(),
            }),
        }
    }

    /// Admit a request into the service's open window, creating one (and its
    /// flush timer) if necessary. Returns immediately; the caller waits via
    /// `await_result`.
    pub fn enqueue(
        &self,
        service: ServiceKind,
        fragment: String,
        priority: Priority,
        context: FallbackContext,
    ) -> ResultHandle {
        let request_id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        let handle = ResultHandle {
            request_id,
            rx,
            context: context.clone(),
        };
        let entry = WindowEntry {
            request_id,
            fragment,
            priority,
            context,
            responder: tx,
        };
        self.inner.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let (Some(slot), Some(config)) = (
            self.inner.windows.get(&service),
            self.inner.configs.get(&service),
        ) else {
            // Unknown service: resolve straight through fallback.
            let result = self.inner.fallback.estimate(&entry.context);
            let _ = entry.responder.send(result);
            return handle;
        };

        let (spawn_timer, flushed) = {
            let mut slot = slot.lock();
            let was_empty = slot.is_none();
            let window = slot.get_or_insert_with(|| {
                tracing::debug!(service = %service, "opened batch window");
                OpenWindow {
                    id: Uuid::new_v4(),
                    entries: Vec::new(),
                    opened_at: self.inner.clock.now(),
                }
            });
            let window_id = window.id;
            window.entries.push(entry);
            let full = window.entries.len() >= config.max_batch_size;

            if full {
                (None, slot.take())
            } else if was_empty {
                (Some(window_id), None)
            } else {
                (None, None)
            }
        };

        if let Some(window_id) = spawn_timer {
            let inner = self.inner.clone();
            let timeout = config.batch_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    // On shutdown, drain the window early instead of leaving
                    // callers to their await timeouts.
                    _ = inner.cancel.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {}
                }
                Self::flush(inner, service, Some(window_id)).await;
            });
        }

        if let Some(window) = flushed {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                Self::process_window(inner, service, window).await;
            });
        }

        handle
    }

    /// Wait for the request's result. A caller never waits past `timeout`:
    /// on timeout (or a dropped window) the result is produced by the
    /// fallback estimator instead. Abandoning the returned future does not
    /// disturb the window's other members.
    pub async fn await_result(&self, handle: ResultHandle, timeout: Duration) -> AnalysisResult {
        match tokio::time::timeout(timeout, handle.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                tracing::warn!(request_id = %handle.request_id, "result channel dropped, serving fallback");
                self.inner.fallback.estimate(&handle.context)
            }
            Err(_) => {
                tracing::warn!(request_id = %handle.request_id, "result wait timed out, serving fallback");
                self.inner.fallback.estimate(&handle.context)
            }
        }
    }

    /// Flush the service's open window if it still matches `expected_id`.
    /// Taking the window under the slot lock makes the flush one-shot even
    /// when the size and timer triggers race.
    async fn flush(inner: Arc<Inner<H>>, service: ServiceKind, expected_id: Option<Uuid>) {
        let taken = {
            let mut slot = match inner.windows.get(&service) {
                Some(slot) => slot.lock(),
                None => return,
            };
            let should_take = matches!(
                &*slot,
                Some(window) if expected_id.map_or(true, |id| window.id == id)
            );
            if should_take {
                slot.take()
            } else {
                None
            }
        };
        if let Some(window) = taken {
            Self::process_window(inner, service, window).await;
        }
    }

    /// Execute one combined call for the window and resolve every member.
    async fn process_window(inner: Arc<Inner<H>>, service: ServiceKind, window: OpenWindow) {
        let n = window.entries.len();
        if n == 0 {
            return;
        }
        let waited_ms = (inner.clock.now() - window.opened_at).num_milliseconds().max(0) as u64;
        tracing::debug!(
            service = %service,
            window_id = %window.id,
            members = n,
            waited_ms,
            "flushing batch window"
        );

        let fragments: Vec<String> = window
            .entries
            .iter()
            .map(|entry| entry.fragment.clone())
            .collect();
        let payload = multipart_payload(&fragments);

        inner.stats.upstream_calls.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = match inner.dispatcher.dispatch(service, payload).await {
            Ok(response) => parse_batch_counts(&response.body, n),
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let per_member_ms = elapsed_ms / n as u64;

        match outcome {
            Ok(counts) => {
                inner
                    .stats
                    .saved_calls
                    .fetch_add(n as u64 - 1, Ordering::Relaxed);
                tracing::info!(
                    service = %service,
                    members = n,
                    "batch window completed in one upstream call"
                );
                for (entry, count) in window.entries.into_iter().zip(counts) {
                    let result = AnalysisResult::from_count(
                        count,
                        AnalysisSource::Api,
                        DataQuality::Excellent,
                        "ai vision",
                        inner.clock.now(),
                    )
                    .with_response_time(per_member_ms);
                    // Send failures mean the caller abandoned its wait.
                    let _ = entry.responder.send(result);
                }
            }
            Err(e) => {
                inner.stats.failed_windows.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    service = %service,
                    members = n,
                    error = %e,
                    "batch window failed, resolving members via fallback"
                );
                for entry in window.entries {
                    let result = inner
                        .fallback
                        .estimate(&entry.context)
                        .with_response_time(elapsed_ms);
                    let _ = entry.responder.send(result);
                }
            }
        }
    }

    /// Drain open windows early and stop their timers.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    pub fn stats(&self) -> BatchStatsSnapshot {
        BatchStatsSnapshot {
            total_requests: self.inner.stats.total_requests.load(Ordering::Relaxed),
            upstream_calls: self.inner.stats.upstream_calls.load(Ordering::Relaxed),
            saved_calls: self.inner.stats.saved_calls.load(Ordering::Relaxed),
            failed_windows: self.inner.stats.failed_windows.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::cache::MultiLevelCache;
    use crate::clock::SystemClock;
    use crate::keys::KeyRotator;
    use crate::types::Fingerprint;
    use crate::upstream::{vision_body_with_text, MockUpstreamClient, UpstreamResponse};
    use secrecy::SecretString;

    fn test_config() -> MitigationConfig {
        let mut config = MitigationConfig::default();
        config.vision.credentials = vec![SecretString::from("vision-secret".to_string())];
        config.maps.credentials = vec![SecretString::from("maps-secret".to_string())];
        config
    }

    fn coordinator(
        config: &MitigationConfig,
        client: MockUpstreamClient,
    ) -> BatchCoordinator<MockUpstreamClient> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let breaker = Arc::new(CircuitBreaker::new(&config.breaker, clock.clone()));
        let rotator = Arc::new(KeyRotator::new(config, clock.clone()));
        let dispatcher = Arc::new(UpstreamDispatcher::new(
            client,
            breaker,
            rotator,
            config.request_timeout,
        ));
        let cache = Arc::new(MultiLevelCache::new(&config.cache, clock.clone()));
        let fallback = Arc::new(FallbackEstimator::new(cache, &config.cache, clock.clone()));
        BatchCoordinator::new(config, dispatcher, fallback, clock)
    }

    fn vision_context(marker: &[u8]) -> FallbackContext {
        FallbackContext {
            service: ServiceKind::Vision,
            fingerprint: Fingerprint::from_image(marker, "prompt"),
            frame: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_coalesce_into_one_call() {
        let client = MockUpstreamClient::new();
        client.add_response(
            ServiceKind::Vision,
            Ok(UpstreamResponse {
                status: 200,
                body: vision_body_with_text(
                    "REQUEST_1_RESPONSE: 10\nREQUEST_2_RESPONSE: 20\nREQUEST_3_RESPONSE: 30",
                ),
            }),
        );
        let config = test_config();
        let coordinator = coordinator(&config, client.clone());

        let handles: Vec<ResultHandle> = (0..3u8)
            .map(|i| {
                coordinator.enqueue(
                    ServiceKind::Vision,
                    format!("count crowd in frame {i}"),
                    Priority::Medium,
                    vision_context(&[i]),
                )
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(
                coordinator
                    .await_result(handle, Duration::from_secs(10))
                    .await,
            );
        }

        // Exactly one upstream call for three callers, demuxed in admission
        // order.
        assert_eq!(client.call_count(), 1);
        let counts: Vec<u32> = results.iter().map(|r| r.people_count).collect();
        assert_eq!(counts, vec![10, 20, 30]);
        for result in &results {
            assert_eq!(result.source, AnalysisSource::Api);
        }

        let stats = coordinator.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.upstream_calls, 1);
        assert_eq!(stats.saved_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_flushes_before_timer() {
        let client = MockUpstreamClient::new();
        client.add_response(
            ServiceKind::Vision,
            Ok(UpstreamResponse {
                status: 200,
                body: vision_body_with_text("REQUEST_1_RESPONSE: 4\nREQUEST_2_RESPONSE: 6"),
            }),
        );
        let mut config = test_config();
        config.vision.batch.max_batch_size = 2;
        // A timer long enough that only the size trigger can explain a flush.
        config.vision.batch.batch_timeout = Duration::from_secs(3600);
        let coordinator = coordinator(&config, client.clone());

        let a = coordinator.enqueue(
            ServiceKind::Vision,
            "frame a".to_string(),
            Priority::Medium,
            vision_context(b"a"),
        );
        let b = coordinator.enqueue(
            ServiceKind::Vision,
            "frame b".to_string(),
            Priority::Medium,
            vision_context(b"b"),
        );

        let ra = coordinator.await_result(a, Duration::from_secs(5)).await;
        let rb = coordinator.await_result(b, Duration::from_secs(5)).await;
        assert_eq!((ra.people_count, rb.people_count), (4, 6));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_window_resolves_all_members_via_fallback() {
        let client = MockUpstreamClient::new();
        client.add_status(ServiceKind::Vision, 500);
        let config = test_config();
        let coordinator = coordinator(&config, client.clone());

        let handles: Vec<ResultHandle> = (0..2u8)
            .map(|i| {
                coordinator.enqueue(
                    ServiceKind::Vision,
                    format!("frame {i}"),
                    Priority::Medium,
                    vision_context(&[i]),
                )
            })
            .collect();

        for handle in handles {
            let result = coordinator
                .await_result(handle, Duration::from_secs(10))
                .await;
            // Empty cache and no frame summary: the estimator's last resort.
            assert_eq!(result.source, AnalysisSource::Estimate);
        }
        assert_eq!(client.call_count(), 1);
        assert_eq!(coordinator.stats().failed_windows, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_response_is_full_window_failure() {
        let client = MockUpstreamClient::new();
        client.add_response(
            ServiceKind::Vision,
            Ok(UpstreamResponse {
                status: 200,
                body: vision_body_with_text("no numbers anywhere in here"),
            }),
        );
        let config = test_config();
        let coordinator = coordinator(&config, client.clone());

        let a = coordinator.enqueue(
            ServiceKind::Vision,
            "frame a".to_string(),
            Priority::Medium,
            vision_context(b"a"),
        );
        let b = coordinator.enqueue(
            ServiceKind::Vision,
            "frame b".to_string(),
            Priority::Medium,
            vision_context(b"b"),
        );

        let ra = coordinator.await_result(a, Duration::from_secs(10)).await;
        let rb = coordinator.await_result(b, Duration::from_secs(10)).await;
        assert_eq!(ra.source, AnalysisSource::Estimate);
        assert_eq!(rb.source, AnalysisSource::Estimate);
        assert_eq!(coordinator.stats().failed_windows, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_timeout_serves_fallback() {
        let client = MockUpstreamClient::new();
        let mut config = test_config();
        // Nothing will flush before the caller's wait expires.
        config.vision.batch.batch_timeout = Duration::from_secs(3600);
        let coordinator = coordinator(&config, client.clone());

        let handle = coordinator.enqueue(
            ServiceKind::Vision,
            "frame".to_string(),
            Priority::Medium,
            vision_context(b"x"),
        );
        let result = coordinator
            .await_result(handle, Duration::from_secs(1))
            .await;
        assert_eq!(result.source, AnalysisSource::Estimate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_caller_does_not_affect_other_members() {
        let client = MockUpstreamClient::new();
        client.add_response(
            ServiceKind::Vision,
            Ok(UpstreamResponse {
                status: 200,
                body: vision_body_with_text("REQUEST_1_RESPONSE: 7\nREQUEST_2_RESPONSE: 9"),
            }),
        );
        let mut config = test_config();
        config.vision.batch.max_batch_size = 2;
        let coordinator = coordinator(&config, client.clone());

        let abandoned = coordinator.enqueue(
            ServiceKind::Vision,
            "frame a".to_string(),
            Priority::Medium,
            vision_context(b"a"),
        );
        let kept = coordinator.enqueue(
            ServiceKind::Vision,
            "frame b".to_string(),
            Priority::Medium,
            vision_context(b"b"),
        );
        drop(abandoned);

        let result = coordinator
            .await_result(kept, Duration::from_secs(10))
            .await;
        assert_eq!(result.people_count, 9);
        assert_eq!(result.source, AnalysisSource::Api);
    }

    #[tokio::test(start_paused = true)]
    async fn test_windows_refill_after_flush() {
        let client = MockUpstreamClient::new();
        client.add_response(
            ServiceKind::Vision,
            Ok(UpstreamResponse {
                status: 200,
                body: vision_body_with_text("REQUEST_1_RESPONSE: 3"),
            }),
        );
        client.add_response(
            ServiceKind::Vision,
            Ok(UpstreamResponse {
                status: 200,
                body: vision_body_with_text("REQUEST_1_RESPONSE: 5"),
            }),
        );
        let mut config = test_config();
        config.vision.batch.max_batch_size = 1;
        let coordinator = coordinator(&config, client.clone());

        let first = coordinator.enqueue(
            ServiceKind::Vision,
            "frame a".to_string(),
            Priority::Medium,
            vision_context(b"a"),
        );
        let first = coordinator
            .await_result(first, Duration::from_secs(5))
            .await;
        assert_eq!(first.people_count, 3);

        let second = coordinator.enqueue(
            ServiceKind::Vision,
            "frame b".to_string(),
            Priority::Medium,
            vision_context(b"b"),
        );
        let second = coordinator
            .await_result(second, Duration::from_secs(5))
            .await;
        assert_eq!(second.people_count, 5);
        assert_eq!(client.call_count(), 2);
    }
}
