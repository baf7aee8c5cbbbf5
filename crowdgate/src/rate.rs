//! Sliding-window request quota tracking, one window per API key.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::{chrono_duration, Clock};
use crate::types::KeyId;

/// Per-key sliding-window counter enforcing a requests-per-window quota.
///
/// One tracker exists per upstream service, holding a window for each key in
/// that service's pool. `can_send` is a pure read; `record` is called
/// immediately before a network attempt. Each key's window is an independent
/// critical section (a dashmap shard entry), so concurrent callers touching
/// different keys never contend.
pub struct RateTracker {
    limit: usize,
    window: chrono::Duration,
    clock: Arc<dyn Clock>,
    windows: DashMap<KeyId, Vec<DateTime<Utc>>>,
}

impl RateTracker {
    pub fn new(limit: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            window: chrono_duration(window),
            clock,
            windows: DashMap::new(),
        }
    }

    /// Whether the key is under quota. No side effects.
    pub fn can_send(&self, key: &KeyId) -> bool {
        let cutoff = self.clock.now() - self.window;
        match self.windows.get(key) {
            Some(entries) => entries.iter().filter(|t| **t > cutoff).count() < self.limit,
            None => self.limit > 0,
        }
    }

    /// Record a send for the key: append now, prune entries older than the
    /// window.
    pub fn record(&self, key: &KeyId) {
        let now = self.clock.now();
        let cutoff = now - self.window;
        let mut entries = self.windows.entry(key.clone()).or_default();
        entries.retain(|t| *t > cutoff);
        entries.push(now);
    }

    /// Number of sends currently inside the window for this key.
    pub fn in_window(&self, key: &KeyId) -> usize {
        let cutoff = self.clock.now() - self.window;
        self.windows
            .get(key)
            .map(|entries| entries.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0)
    }
}
