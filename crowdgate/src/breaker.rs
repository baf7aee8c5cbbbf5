//! Per-service circuit breaker.
//!
//! Stops outbound calls to an upstream after repeated failures and allows a
//! single probe after a cooldown. Breaker state is consulted only at
//! call-start: a call already in flight when the circuit opens is allowed to
//! finish and report its outcome normally.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::{chrono_duration, Clock};
use crate::config::BreakerConfig;
use crate::types::ServiceKind;

/// Internal breaker state for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open { opened_at: DateTime<Utc> },
    HalfOpen { probe_taken: bool },
}

/// Observable breaker position, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitSnapshot {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker over all upstream services.
///
/// Transitions: Closed -> Open when the failure count reaches
/// `max_failures`; Open -> HalfOpen once the cooldown elapses; HalfOpen ->
/// Closed on a successful probe, HalfOpen -> Open on a failed one.
pub struct CircuitBreaker {
    max_failures: u32,
    cooldown: chrono::Duration,
    clock: Arc<dyn Clock>,
    states: DashMap<ServiceKind, State>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let states = DashMap::new();
        for service in ServiceKind::all() {
            states.insert(service, State::Closed { failures: 0 });
        }
        Self {
            max_failures: config.max_failures,
            cooldown: chrono_duration(config.cooldown),
            clock,
            states,
        }
    }

    /// Whether a call may start now. This is the transition point: an open
    /// circuit whose cooldown has elapsed moves to half-open here, and the
    /// half-open probe slot is claimed by the first caller to pass.
    pub fn check(&self, service: ServiceKind) -> bool {
        let now = self.clock.now();
        let mut state = self
            .states
            .entry(service)
            .or_insert(State::Closed { failures: 0 });

        match *state {
            State::Closed { .. } => true,
            State::Open { opened_at } => {
                if now - opened_at >= self.cooldown {
                    // Cooldown over: allow exactly one probe.
                    *state = State::HalfOpen { probe_taken: true };
                    tracing::info!(service = %service, "circuit half-open, allowing probe");
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_taken } => {
                if probe_taken {
                    false
                } else {
                    *state = State::HalfOpen { probe_taken: true };
                    true
                }
            }
        }
    }

    /// Read-only view of whether a call would be allowed. Does not claim the
    /// half-open probe slot or perform transitions; used for cheap
    /// pre-checks before enqueueing work.
    pub fn would_allow(&self, service: ServiceKind) -> bool {
        let now = self.clock.now();
        match self.states.get(&service).map(|s| *s) {
            Some(State::Closed { .. }) | None => true,
            Some(State::Open { opened_at }) => now - opened_at >= self.cooldown,
            Some(State::HalfOpen { probe_taken }) => !probe_taken,
        }
    }

    /// Record a successful call: close the circuit and reset the failure
    /// counter.
    pub fn record_success(&self, service: ServiceKind) {
        let mut state = self
            .states
            .entry(service)
            .or_insert(State::Closed { failures: 0 });
        if !matches!(*state, State::Closed { failures: 0 }) {
            tracing::info!(service = %service, "circuit closed after success");
        }
        *state = State::Closed { failures: 0 };
    }

    /// Record a failed call. Failure means transport error, non-2xx, or an
    /// explicit rate-limit signal.
    pub fn record_failure(&self, service: ServiceKind) {
        let now = self.clock.now();
        let mut state = self
            .states
            .entry(service)
            .or_insert(State::Closed { failures: 0 });

        *state = match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.max_failures {
                    tracing::warn!(
                        service = %service,
                        failures,
                        "failure threshold reached, circuit open"
                    );
                    State::Open { opened_at: now }
                } else {
                    State::Closed { failures }
                }
            }
            // A failed probe re-opens with a fresh cooldown.
            State::HalfOpen { .. } => {
                tracing::warn!(service = %service, "probe failed, circuit re-open");
                State::Open { opened_at: now }
            }
            // In-flight call from before the circuit opened; keep the
            // original opened_at so the cooldown is not extended.
            State::Open { opened_at } => State::Open { opened_at },
        };
    }

    pub fn snapshot(&self, service: ServiceKind) -> CircuitSnapshot {
        match self.states.get(&service).map(|s| *s) {
            Some(State::Open { .. }) => CircuitSnapshot::Open,
            Some(State::HalfOpen { .. }) => CircuitSnapshot::HalfOpen,
            _ => CircuitSnapshot::Closed,
        }
    }
}
