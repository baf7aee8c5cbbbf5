//! The checked upstream call path shared by direct and batched requests.
//!
//! One dispatch = circuit check, key selection, quota record, network call,
//! outcome classification, and the matching breaker/rotator reports. All
//! bookkeeping happens before and after the call; no lock is held while the
//! request is in flight.

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use serde_json::Value;

use crate::breaker::CircuitBreaker;
use crate::error::{MitigationError, Result};
use crate::keys::KeyRotator;
use crate::types::ServiceKind;
use crate::upstream::{UpstreamClient, UpstreamRequest, UpstreamResponse};

/// Executes individual upstream calls with full mitigation bookkeeping.
pub struct UpstreamDispatcher<H: UpstreamClient> {
    client: H,
    breaker: Arc<CircuitBreaker>,
    rotator: Arc<KeyRotator>,
    request_timeout: Duration,
}

impl<H: UpstreamClient + 'static> UpstreamDispatcher<H> {
    pub fn new(
        client: H,
        breaker: Arc<CircuitBreaker>,
        rotator: Arc<KeyRotator>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            breaker,
            rotator,
            request_timeout,
        }
    }

    /// Perform one checked call to the service.
    ///
    /// # Errors
    /// - `CircuitOpen` when the breaker denies the call at call-start
    /// - `NoKeyAvailable` when every key is blacklisted or over quota
    /// - `RateLimited` on an upstream 429 (key blacklisted, breaker notified)
    /// - `UpstreamStatus`/`Http` on other failures (breaker notified)
    #[tracing::instrument(skip(self, payload), fields(service = %service))]
    pub async fn dispatch(&self, service: ServiceKind, payload: Value) -> Result<UpstreamResponse> {
        if !self.breaker.check(service) {
            tracing::debug!(service = %service, "circuit open, not attempting network");
            return Err(MitigationError::CircuitOpen(service));
        }

        let key = self
            .rotator
            .select_key(service)
            .ok_or(MitigationError::NoKeyAvailable(service))?;
        self.rotator.record_send(service, &key.key_id);

        let request = UpstreamRequest {
            service,
            body: payload,
        };
        let result = self
            .client
            .execute(&request, key.credential.expose_secret(), self.request_timeout)
            .await;

        match result {
            Ok(response) if response.is_success() => {
                self.breaker.record_success(service);
                self.rotator.report_success(service, &key.key_id);
                Ok(response)
            }
            Ok(response) if response.is_rate_limited() => {
                tracing::warn!(service = %service, key_id = %key.key_id, "upstream rate limited");
                self.breaker.record_failure(service);
                self.rotator.report_rate_limited(service, &key.key_id);
                Err(MitigationError::RateLimited {
                    service,
                    status: response.status,
                })
            }
            Ok(response) => {
                tracing::warn!(
                    service = %service,
                    status = response.status,
                    "upstream returned failure status"
                );
                self.breaker.record_failure(service);
                Err(MitigationError::UpstreamStatus {
                    service,
                    status: response.status,
                    body: truncate(&response.body, 200),
                })
            }
            Err(e) => {
                tracing::warn!(service = %service, error = %e, "upstream call failed");
                self.breaker.record_failure(service);
                Err(e)
            }
        }
    }

    /// Cheap read-only check of whether a dispatch could currently proceed.
    /// Used to skip enqueueing work that would immediately short-circuit;
    /// the authoritative checks still run inside `dispatch`.
    pub fn preview(&self, service: ServiceKind) -> bool {
        self.breaker.would_allow(service) && self.rotator.has_eligible(service)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MitigationConfig;
    use crate::upstream::MockUpstreamClient;
    use secrecy::SecretString;
    use serde_json::json;

    fn setup(keys: usize) -> (UpstreamDispatcher<MockUpstreamClient>, MockUpstreamClient, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let mut config = MitigationConfig::default();
        config.vision.credentials = (0..keys)
            .map(|i| SecretString::from(format!("secret-{i}")))
            .collect();
        let breaker = Arc::new(CircuitBreaker::new(&config.breaker, clock.clone()));
        let rotator = Arc::new(KeyRotator::new(&config, clock.clone()));
        let client = MockUpstreamClient::new();
        let dispatcher = UpstreamDispatcher::new(
            client.clone(),
            breaker,
            rotator,
            config.request_timeout,
        );
        (dispatcher, client, clock)
    }

    #[tokio::test]
    async fn test_success_path_reports_and_returns() {
        let (dispatcher, client, _) = setup(1);
        client.add_vision_count(14);

        let response = dispatcher
            .dispatch(ServiceKind::Vision, json!({}))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_blacklists_key() {
        let (dispatcher, client, _) = setup(1);
        client.add_status(ServiceKind::Vision, 429);

        let err = dispatcher
            .dispatch(ServiceKind::Vision, json!({}))
            .await
            .unwrap_err();
        assert!(err.is_rate_limit());

        // The only key is benched, so the next dispatch never reaches the
        // network.
        let err = dispatcher
            .dispatch(ServiceKind::Vision, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MitigationError::NoKeyAvailable(_)));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failures_open_circuit_and_short_circuit() {
        let (dispatcher, client, _) = setup(1);
        for _ in 0..3 {
            client.add_status(ServiceKind::Vision, 503);
        }

        for _ in 0..3 {
            let err = dispatcher
                .dispatch(ServiceKind::Vision, json!({}))
                .await
                .unwrap_err();
            assert!(matches!(err, MitigationError::UpstreamStatus { .. }));
        }
        assert_eq!(client.call_count(), 3);

        let err = dispatcher
            .dispatch(ServiceKind::Vision, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MitigationError::CircuitOpen(_)));
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_no_keys_configured() {
        let (dispatcher, client, _) = setup(0);
        let err = dispatcher
            .dispatch(ServiceKind::Vision, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MitigationError::NoKeyAvailable(_)));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_preview_reflects_breaker_and_keys() {
        let (dispatcher, client, _) = setup(1);
        assert!(dispatcher.preview(ServiceKind::Vision));

        for _ in 0..3 {
            client.add_status(ServiceKind::Vision, 500);
            let _ = dispatcher.dispatch(ServiceKind::Vision, json!({})).await;
        }
        assert!(!dispatcher.preview(ServiceKind::Vision));
    }
}
