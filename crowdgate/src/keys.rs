//! Credential pool rotation with temporary blacklisting.
//!
//! Each upstream service has a pool of API keys. Selection walks the pool in
//! round-robin order, skipping keys that are blacklisted (recently
//! rate-limited) or over their sliding-window quota. A rate-limited key is
//! benched for `blacklist_duration`; a success clears the bench immediately
//! so capacity recovers as soon as the upstream does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use secrecy::SecretString;

use crate::clock::{chrono_duration, Clock};
use crate::config::MitigationConfig;
use crate::rate::RateTracker;
use crate::types::{KeyId, ServiceKind};

/// A key chosen for one upstream attempt.
#[derive(Clone)]
pub struct SelectedKey {
    pub key_id: KeyId,
    pub credential: SecretString,
}

struct KeyState {
    id: KeyId,
    credential: SecretString,
    blacklisted_until: Option<DateTime<Utc>>,
}

struct Pool {
    entries: Mutex<Vec<KeyState>>,
    cursor: AtomicUsize,
    tracker: Arc<RateTracker>,
}

/// Round-robin key selection over per-service credential pools.
pub struct KeyRotator {
    pools: HashMap<ServiceKind, Pool>,
    blacklist_duration: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl KeyRotator {
    pub fn new(config: &MitigationConfig, clock: Arc<dyn Clock>) -> Self {
        let mut pools = HashMap::new();
        for service in ServiceKind::all() {
            let service_config = config.service(service);
            let entries = service_config
                .credentials
                .iter()
                .enumerate()
                .map(|(i, credential)| KeyState {
                    id: KeyId::new(service, i),
                    credential: credential.clone(),
                    blacklisted_until: None,
                })
                .collect();
            pools.insert(
                service,
                Pool {
                    entries: Mutex::new(entries),
                    cursor: AtomicUsize::new(0),
                    tracker: Arc::new(RateTracker::new(
                        service_config.max_requests_per_minute,
                        config.rate_window,
                        clock.clone(),
                    )),
                },
            );
        }
        Self {
            pools,
            blacklist_duration: chrono_duration(config.blacklist_duration),
            clock,
        }
    }

    /// Select a usable key for the service, or `None` when every key is
    /// blacklisted or over quota.
    pub fn select_key(&self, service: ServiceKind) -> Option<SelectedKey> {
        let pool = self.pools.get(&service)?;
        let now = self.clock.now();
        let mut entries = pool.entries.lock();
        let n = entries.len();
        if n == 0 {
            return None;
        }

        let start = pool.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let entry = &mut entries[idx];

            if let Some(until) = entry.blacklisted_until {
                if until > now {
                    continue;
                }
                // Blacklist expired: lazily clear it.
                entry.blacklisted_until = None;
            }

            if !pool.tracker.can_send(&entry.id) {
                continue;
            }

            tracing::trace!(service = %service, key_id = %entry.id, "selected key");
            return Some(SelectedKey {
                key_id: entry.id.clone(),
                credential: entry.credential.clone(),
            });
        }

        tracing::debug!(service = %service, "no eligible key in pool");
        None
    }

    /// Whether any key would currently be selectable. Read-only: does not
    /// advance the round-robin cursor or clear expired blacklists.
    pub fn has_eligible(&self, service: ServiceKind) -> bool {
        let Some(pool) = self.pools.get(&service) else {
            return false;
        };
        let now = self.clock.now();
        let entries = pool.entries.lock();
        entries.iter().any(|entry| {
            entry.blacklisted_until.map_or(true, |until| until <= now)
                && pool.tracker.can_send(&entry.id)
        })
    }

    /// Record a send against the key's quota window. Called immediately
    /// before the network attempt.
    pub fn record_send(&self, service: ServiceKind, key: &KeyId) {
        if let Some(pool) = self.pools.get(&service) {
            pool.tracker.record(key);
        }
    }

    /// Bench the key for the configured blacklist duration.
    pub fn report_rate_limited(&self, service: ServiceKind, key: &KeyId) {
        if let Some(pool) = self.pools.get(&service) {
            let until = self.clock.now() + self.blacklist_duration;
            let mut entries = pool.entries.lock();
            if let Some(entry) = entries.iter_mut().find(|e| &e.id == key) {
                entry.blacklisted_until = Some(until);
                tracing::warn!(service = %service, key_id = %key, "key blacklisted after rate limit");
            }
        }
    }

    /// Clear any blacklist on the key immediately.
    pub fn report_success(&self, service: ServiceKind, key: &KeyId) {
        if let Some(pool) = self.pools.get(&service) {
            let mut entries = pool.entries.lock();
            if let Some(entry) = entries.iter_mut().find(|e| &e.id == key) {
                entry.blacklisted_until = None;
            }
        }
    }

    /// The quota tracker for a service. Exposed for observability and tests.
    pub fn tracker(&self, service: ServiceKind) -> Option<&Arc<RateTracker>> {
        self.pools.get(&service).map(|pool| &pool.tracker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn config_with_keys(n: usize) -> MitigationConfig {
        let mut config = MitigationConfig::default();
        config.vision.credentials = (0..n)
            .map(|i| SecretString::from(format!("vision-secret-{i}")))
            .collect();
        config
    }

    #[test]
    fn test_round_robin_rotation() {
        let clock = ManualClock::starting_now();
        let rotator = KeyRotator::new(&config_with_keys(3), clock);

        let first = rotator.select_key(ServiceKind::Vision).unwrap();
        let second = rotator.select_key(ServiceKind::Vision).unwrap();
        let third = rotator.select_key(ServiceKind::Vision).unwrap();
        let fourth = rotator.select_key(ServiceKind::Vision).unwrap();

        assert_ne!(first.key_id, second.key_id);
        assert_ne!(second.key_id, third.key_id);
        assert_eq!(first.key_id, fourth.key_id);
    }

    #[test]
    fn test_blacklisted_key_is_skipped() {
        let clock = ManualClock::starting_now();
        let rotator = KeyRotator::new(&config_with_keys(2), clock);

        let first = rotator.select_key(ServiceKind::Vision).unwrap();
        rotator.report_rate_limited(ServiceKind::Vision, &first.key_id);

        for _ in 0..4 {
            let selected = rotator.select_key(ServiceKind::Vision).unwrap();
            assert_ne!(selected.key_id, first.key_id);
        }
    }

    #[test]
    fn test_blacklist_expires_after_duration() {
        let clock = ManualClock::starting_now();
        let rotator = KeyRotator::new(&config_with_keys(1), clock.clone());

        let key = rotator.select_key(ServiceKind::Vision).unwrap();
        rotator.report_rate_limited(ServiceKind::Vision, &key.key_id);
        assert!(rotator.select_key(ServiceKind::Vision).is_none());

        clock.advance(Duration::from_secs(301));
        assert!(rotator.select_key(ServiceKind::Vision).is_some());
    }

    #[test]
    fn test_success_clears_blacklist_immediately() {
        let clock = ManualClock::starting_now();
        let rotator = KeyRotator::new(&config_with_keys(1), clock);

        let key = rotator.select_key(ServiceKind::Vision).unwrap();
        rotator.report_rate_limited(ServiceKind::Vision, &key.key_id);
        assert!(rotator.select_key(ServiceKind::Vision).is_none());

        rotator.report_success(ServiceKind::Vision, &key.key_id);
        assert!(rotator.select_key(ServiceKind::Vision).is_some());
    }

    #[test]
    fn test_over_quota_key_is_skipped() {
        let clock = ManualClock::starting_now();
        let mut config = config_with_keys(2);
        config.vision.max_requests_per_minute = 1;
        let rotator = KeyRotator::new(&config, clock);

        let first = rotator.select_key(ServiceKind::Vision).unwrap();
        rotator.record_send(ServiceKind::Vision, &first.key_id);

        let second = rotator.select_key(ServiceKind::Vision).unwrap();
        assert_ne!(second.key_id, first.key_id);

        rotator.record_send(ServiceKind::Vision, &second.key_id);
        assert!(rotator.select_key(ServiceKind::Vision).is_none());
        assert!(!rotator.has_eligible(ServiceKind::Vision));
    }

    #[test]
    fn test_empty_pool_selects_nothing() {
        let clock = ManualClock::starting_now();
        let rotator = KeyRotator::new(&MitigationConfig::default(), clock);
        assert!(rotator.select_key(ServiceKind::Vision).is_none());
        assert!(!rotator.has_eligible(ServiceKind::Vision));
    }

    #[test]
    fn test_has_eligible_does_not_rotate() {
        let clock = ManualClock::starting_now();
        let rotator = KeyRotator::new(&config_with_keys(2), clock);

        assert!(rotator.has_eligible(ServiceKind::Vision));
        assert!(rotator.has_eligible(ServiceKind::Vision));
        let first = rotator.select_key(ServiceKind::Vision).unwrap();
        let second = rotator.select_key(ServiceKind::Vision).unwrap();
        // The cursor only moved for the two real selections.
        assert_ne!(first.key_id, second.key_id);
    }
}
