//! Backend health monitor and circuit breaker
//!
//! # States
//! ```text
//! HEALTHY   --(consecutive failures >= fail_threshold)--> CIRCUIT_OPEN
//! HEALTHY   --(isolated failure)-----------------------> DEGRADED
//! DEGRADED  --(consecutive successes >= recover)-------> HEALTHY
//! DEGRADED  --(consecutive failures >= fail_threshold)--> CIRCUIT_OPEN
//! CIRCUIT_OPEN --(cooldown elapsed, first admission)---> HALF_OPEN
//! HALF_OPEN --(probe succeeds)-------------------------> HEALTHY
//! HALF_OPEN --(probe fails, cooldown doubles)----------> CIRCUIT_OPEN
//! ```
//!
//! One breaker per backend, each behind its own mutex. Only one probe is
//! admitted per half-open period; concurrent callers are refused with
//! `ProbeInFlight` and fall through to another backend.

use crate::error::{DispatchError, ExclusionReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

// ============================================================================
// Circuit Breaker Configuration
// ============================================================================

/// Thresholds and cooldown schedule for the circuit breaker
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub fail_threshold: u32,
    /// Consecutive successes that return a degraded backend to healthy
    pub recover_threshold: u32,
    pub initial_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 5,
            recover_threshold: 3,
            initial_cooldown_ms: 5_000,
            max_cooldown_ms: 300_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_fail_threshold(mut self, threshold: u32) -> Self {
        self.fail_threshold = threshold;
        self
    }

    pub fn with_recover_threshold(mut self, threshold: u32) -> Self {
        self.recover_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_cooldown_ms = initial.as_millis() as u64;
        self.max_cooldown_ms = max.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.fail_threshold == 0 {
            return Err(DispatchError::config("circuit_breaker.fail_threshold must be > 0"));
        }
        if self.recover_threshold == 0 {
            return Err(DispatchError::config(
                "circuit_breaker.recover_threshold must be > 0",
            ));
        }
        if self.initial_cooldown_ms == 0 {
            return Err(DispatchError::config(
                "circuit_breaker.initial_cooldown_ms must be > 0",
            ));
        }
        if self.max_cooldown_ms < self.initial_cooldown_ms {
            return Err(DispatchError::config(
                "circuit_breaker.max_cooldown_ms must be >= initial_cooldown_ms",
            ));
        }
        Ok(())
    }

    fn initial_cooldown(&self) -> Duration {
        Duration::from_millis(self.initial_cooldown_ms)
    }

    fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

// ============================================================================
// Health State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    CircuitOpen,
    HalfOpen,
}

impl HealthState {
    /// Availability component of the routing score
    pub fn health_score(&self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.5,
            Self::CircuitOpen | Self::HalfOpen => 0.0,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// How a request was let through the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Normal,
    /// The single half-open recovery probe
    Probe,
}

/// Router-facing view of a backend's breaker, without side effects
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingView {
    Available(HealthState),
    /// Open or half-open backend that may take one probe right now
    ProbeEligible,
    Excluded(ExclusionReason),
}

/// Point-in-time copy of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub backend_id: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_ms: u64,
    pub probe_in_flight: bool,
    pub last_reason: Option<String>,
}

// ============================================================================
// Breaker
// ============================================================================

#[derive(Debug)]
struct Breaker {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    cooldown: Duration,
    probe_in_flight: bool,
    last_reason: Option<String>,
}

impl Breaker {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            opened_at_wall: None,
            cooldown,
            probe_in_flight: false,
            last_reason: None,
        }
    }

    fn remaining_cooldown(&self, now: Instant) -> Duration {
        match self.opened_at {
            Some(opened) => self.cooldown.saturating_sub(now.saturating_duration_since(opened)),
            None => Duration::ZERO,
        }
    }

    fn open(&mut self, reason: impl Into<String>) {
        self.state = HealthState::CircuitOpen;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
        self.consecutive_successes = 0;
        self.probe_in_flight = false;
        self.last_reason = Some(reason.into());
    }

    fn close(&mut self, initial_cooldown: Duration) {
        self.state = HealthState::Healthy;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.opened_at_wall = None;
        self.cooldown = initial_cooldown;
        self.probe_in_flight = false;
        self.last_reason = None;
    }
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Circuit breakers for every known backend
#[derive(Debug)]
pub struct HealthMonitor {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<Mutex<Breaker>>>>,
}

impl HealthMonitor {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn register(&self, backend_id: &str) {
        self.breaker(backend_id);
    }

    /// Current state without side effects.
    ///
    /// An open circuit whose cooldown has elapsed reports `HalfOpen`, since
    /// the next admission will move it there.
    pub fn snapshot(&self, backend_id: &str) -> HealthSnapshot {
        let breaker = self.breaker(backend_id);
        let b = lock(&breaker);
        let state = match b.state {
            HealthState::CircuitOpen if b.remaining_cooldown(Instant::now()).is_zero() => {
                HealthState::HalfOpen
            }
            other => other,
        };
        HealthSnapshot {
            backend_id: backend_id.to_string(),
            state,
            consecutive_failures: b.consecutive_failures,
            consecutive_successes: b.consecutive_successes,
            opened_at: b.opened_at_wall,
            cooldown_ms: b.cooldown.as_millis() as u64,
            probe_in_flight: b.probe_in_flight,
            last_reason: b.last_reason.clone(),
        }
    }

    pub fn state(&self, backend_id: &str) -> HealthState {
        self.snapshot(backend_id).state
    }

    /// Whether, and how, the router may rank this backend
    pub fn routing_view(&self, backend_id: &str) -> RoutingView {
        let breaker = self.breaker(backend_id);
        let b = lock(&breaker);
        match b.state {
            HealthState::Healthy | HealthState::Degraded => RoutingView::Available(b.state),
            HealthState::CircuitOpen => {
                let remaining = b.remaining_cooldown(Instant::now());
                if remaining.is_zero() {
                    RoutingView::ProbeEligible
                } else {
                    RoutingView::Excluded(ExclusionReason::CircuitOpen {
                        retry_in_ms: remaining.as_millis() as u64,
                    })
                }
            }
            HealthState::HalfOpen if b.probe_in_flight => {
                RoutingView::Excluded(ExclusionReason::ProbeInFlight)
            }
            HealthState::HalfOpen => RoutingView::ProbeEligible,
        }
    }

    /// Admit a request, claiming the probe slot if the circuit is recovering
    pub fn try_acquire(&self, backend_id: &str) -> Result<Admission, ExclusionReason> {
        let breaker = self.breaker(backend_id);
        let mut b = lock(&breaker);
        match b.state {
            HealthState::Healthy | HealthState::Degraded => Ok(Admission::Normal),
            HealthState::CircuitOpen => {
                let remaining = b.remaining_cooldown(Instant::now());
                if !remaining.is_zero() {
                    return Err(ExclusionReason::CircuitOpen {
                        retry_in_ms: remaining.as_millis() as u64,
                    });
                }
                b.state = HealthState::HalfOpen;
                b.probe_in_flight = true;
                tracing::info!(backend = %backend_id, "Circuit half-open, admitting probe");
                Ok(Admission::Probe)
            }
            HealthState::HalfOpen if b.probe_in_flight => Err(ExclusionReason::ProbeInFlight),
            HealthState::HalfOpen => {
                b.probe_in_flight = true;
                Ok(Admission::Probe)
            }
        }
    }

    /// Release a probe slot that never produced an outcome
    pub fn abandon_probe(&self, backend_id: &str) {
        let breaker = self.breaker(backend_id);
        lock(&breaker).probe_in_flight = false;
    }

    pub fn record_success(&self, backend_id: &str, admission: Admission) -> HealthState {
        let breaker = self.breaker(backend_id);
        let mut b = lock(&breaker);
        b.consecutive_failures = 0;
        b.consecutive_successes = b.consecutive_successes.saturating_add(1);

        match (b.state, admission) {
            (HealthState::HalfOpen, Admission::Probe) => {
                b.close(self.config.initial_cooldown());
                tracing::info!(backend = %backend_id, "Probe succeeded, circuit closed");
            }
            (HealthState::Degraded, _)
                if b.consecutive_successes >= self.config.recover_threshold =>
            {
                b.state = HealthState::Healthy;
                tracing::info!(backend = %backend_id, "Backend recovered from degraded state");
            }
            _ => {
                if admission == Admission::Probe {
                    b.probe_in_flight = false;
                }
            }
        }
        b.state
    }

    pub fn record_failure(
        &self,
        backend_id: &str,
        admission: Admission,
        reason: &str,
    ) -> HealthState {
        let breaker = self.breaker(backend_id);
        let mut b = lock(&breaker);
        b.consecutive_successes = 0;
        b.consecutive_failures = b.consecutive_failures.saturating_add(1);

        match (b.state, admission) {
            (HealthState::HalfOpen, Admission::Probe) => {
                let doubled = b.cooldown.saturating_mul(2).min(self.config.max_cooldown());
                b.cooldown = doubled;
                b.open(reason);
                tracing::warn!(
                    backend = %backend_id,
                    cooldown_ms = doubled.as_millis() as u64,
                    reason = %reason,
                    "Probe failed, circuit reopened"
                );
            }
            (HealthState::Healthy | HealthState::Degraded, _)
                if b.consecutive_failures >= self.config.fail_threshold =>
            {
                b.cooldown = self.config.initial_cooldown();
                b.open(reason);
                tracing::warn!(
                    backend = %backend_id,
                    failures = b.consecutive_failures,
                    reason = %reason,
                    "Circuit opened"
                );
            }
            (HealthState::Healthy, _) => {
                b.state = HealthState::Degraded;
                b.last_reason = Some(reason.to_string());
                tracing::debug!(backend = %backend_id, reason = %reason, "Backend degraded");
            }
            _ => {
                if admission == Admission::Probe {
                    b.probe_in_flight = false;
                }
            }
        }
        b.state
    }

    /// Force the circuit open, e.g. when a backend has no pool members left
    pub fn trip(&self, backend_id: &str, reason: &str) {
        let breaker = self.breaker(backend_id);
        let mut b = lock(&breaker);
        if b.state != HealthState::CircuitOpen {
            b.open(reason);
            tracing::warn!(backend = %backend_id, reason = %reason, "Circuit tripped");
        }
    }

    fn breaker(&self, backend_id: &str) -> Arc<Mutex<Breaker>> {
        {
            let breakers = match self.breakers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(breaker) = breakers.get(backend_id) {
                return breaker.clone();
            }
        }
        let mut breakers = match self.breakers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cooldown = self.config.initial_cooldown();
        breakers
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Breaker::new(cooldown))))
            .clone()
    }
}

fn lock(breaker: &Mutex<Breaker>) -> MutexGuard<'_, Breaker> {
    match breaker.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Tests
// ============================================================================
