//! Three-tier time-bucketed result cache.
//!
//! A write lands in all three tiers at once with tier-specific expirations;
//! the tiers exist purely to extend availability of the same value, not to
//! hold different values. Reads probe fresh -> medium -> long and report
//! which tier served, which callers map to a data-quality grade. Expired
//! entries are lazily evicted on probe, never returned.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::{chrono_duration, Clock};
use crate::config::CacheConfig;
use crate::types::{AnalysisResult, DataQuality, Fingerprint};

/// The cache tier that served a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Fresh,
    Medium,
    Long,
}

impl CacheTier {
    pub fn data_quality(&self) -> DataQuality {
        match self {
            CacheTier::Fresh => DataQuality::Excellent,
            CacheTier::Medium => DataQuality::Good,
            CacheTier::Long => DataQuality::Fair,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Fresh => "fresh",
            CacheTier::Medium => "medium",
            CacheTier::Long => "long",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: AnalysisResult,
    stored_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

struct Tier {
    tier: CacheTier,
    ttl: chrono::Duration,
    entries: DashMap<Fingerprint, Entry>,
}

/// Multi-level cache keyed by request fingerprint.
pub struct MultiLevelCache {
    tiers: [Tier; 3],
    clock: Arc<dyn Clock>,
}

impl MultiLevelCache {
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            tiers: [
                Tier {
                    tier: CacheTier::Fresh,
                    ttl: chrono_duration(config.fresh_ttl),
                    entries: DashMap::new(),
                },
                Tier {
                    tier: CacheTier::Medium,
                    ttl: chrono_duration(config.medium_ttl),
                    entries: DashMap::new(),
                },
                Tier {
                    tier: CacheTier::Long,
                    ttl: chrono_duration(config.long_ttl),
                    entries: DashMap::new(),
                },
            ],
            clock,
        }
    }

    /// Store the value in every tier with tier-specific expirations.
    pub fn put(&self, fingerprint: &Fingerprint, value: &AnalysisResult) {
        let now = self.clock.now();
        for tier in &self.tiers {
            tier.entries.insert(
                fingerprint.clone(),
                Entry {
                    value: value.clone(),
                    stored_at: now,
                    expires_at: now + tier.ttl,
                },
            );
        }
    }

    /// Seed only the fresh tier, used to damp repeated fallback work without
    /// letting a low-confidence value linger for an hour.
    pub fn seed_fresh(&self, fingerprint: &Fingerprint, value: &AnalysisResult) {
        let now = self.clock.now();
        let fresh = &self.tiers[0];
        fresh.entries.insert(
            fingerprint.clone(),
            Entry {
                value: value.clone(),
                stored_at: now,
                expires_at: now + fresh.ttl,
            },
        );
    }

    /// First unexpired hit probing fresh -> medium -> long.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<(AnalysisResult, CacheTier)> {
        self.get_with_factor(fingerprint, 1)
    }

    /// Like `get`, but with every tier's lifetime multiplied by `factor`.
    /// Used while emergency mode holds to keep serving slightly stale data
    /// instead of hammering a recovering upstream.
    pub fn get_relaxed(
        &self,
        fingerprint: &Fingerprint,
        factor: u32,
    ) -> Option<(AnalysisResult, CacheTier)> {
        self.get_with_factor(fingerprint, factor.max(1))
    }

    fn get_with_factor(
        &self,
        fingerprint: &Fingerprint,
        factor: u32,
    ) -> Option<(AnalysisResult, CacheTier)> {
        let now = self.clock.now();
        for tier in &self.tiers {
            if let Some(entry) = tier.entries.get(fingerprint) {
                let expires_at = if factor == 1 {
                    entry.expires_at
                } else {
                    entry.stored_at + tier.ttl * factor as i32
                };
                if now < expires_at {
                    return Some((entry.value.clone(), tier.tier));
                }
                drop(entry);
                // Expired for this tier: evict lazily and keep probing.
                tier.entries.remove(fingerprint);
            }
        }
        None
    }

    /// Most recent entry for the fingerprint regardless of expiry, with its
    /// age. Feeds the fallback estimator's time-decayed reuse.
    pub fn latest(&self, fingerprint: &Fingerprint) -> Option<(AnalysisResult, Duration)> {
        let now = self.clock.now();
        // The long tier outlives the others, so probe it last-to-first.
        self.tiers.iter().rev().find_map(|tier| {
            tier.entries.get(fingerprint).map(|entry| {
                let age = (now - entry.stored_at).to_std().unwrap_or_default();
                (entry.value.clone(), age)
            })
        })
    }

    /// Most recently stored entry across all fingerprints, regardless of
    /// expiry. Last-ditch source for fingerprints never seen before.
    pub fn latest_any(&self) -> Option<(AnalysisResult, Duration)> {
        let now = self.clock.now();
        let mut best: Option<(AnalysisResult, DateTime<Utc>)> = None;
        for tier in self.tiers.iter().rev() {
            for entry in tier.entries.iter() {
                if best.as_ref().map_or(true, |(_, at)| entry.stored_at > *at) {
                    best = Some((entry.value.clone(), entry.stored_at));
                }
            }
        }
        best.map(|(value, stored_at)| {
            let age = (now - stored_at).to_std().unwrap_or_default();
            (value, age)
        })
    }

    /// Total number of live slots across tiers (counting duplicates).
    pub fn len(&self) -> usize {
        self.tiers.iter().map(|t| t.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for tier in &self.tiers {
            tier.entries.clear();
        }
    }
}
