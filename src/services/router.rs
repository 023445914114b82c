//! Backend router
//!
//! Ranks the enabled backends that satisfy a request's capabilities by a
//! weighted blend of cost, observed p95 latency and breaker health:
//!
//! ```text
//! score = w_cost * norm(1/cost) + w_latency * norm(1/p95) + w_availability * health_score
//! ```
//!
//! `norm(1/x)` divides by the best candidate, i.e. `min(x) / x`, so the
//! cheapest and fastest candidates score 1.0. The ranked list is returned
//! whole so the dispatcher can fall through without re-scoring.

use super::health::{HealthMonitor, HealthState, RoutingView};
use super::ledger::PerformanceLedger;
use crate::error::{DispatchError, ExclusionReason};
use crate::models::{BackendSpec, Capability};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Latency score for a backend with no latency history yet
const NEUTRAL_LATENCY_SCORE: f64 = 0.5;

/// Scores closer than this are ties
const SCORE_RESOLUTION: f64 = 1e-9;

// ============================================================================
// Routing Weights
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingWeights {
    pub cost: f64,
    pub latency: f64,
    pub availability: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            cost: 0.4,
            latency: 0.3,
            availability: 0.3,
        }
    }
}

impl RoutingWeights {
    pub fn new(cost: f64, latency: f64, availability: f64) -> Self {
        Self {
            cost,
            latency,
            availability,
        }
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        for (name, value) in [
            ("cost", self.cost),
            ("latency", self.latency),
            ("availability", self.availability),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(DispatchError::config(format!(
                    "routing.{} weight must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        let sum = self.cost + self.latency + self.availability;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(DispatchError::config(format!(
                "routing weights must sum to 1, got {}",
                sum
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Candidate
// ============================================================================

/// A ranked backend
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub backend: Arc<BackendSpec>,
    pub score: f64,
    pub health: HealthState,
    /// Ranked only as a half-open recovery probe
    pub probe: bool,
}

impl Candidate {
    pub fn id(&self) -> &str {
        &self.backend.id
    }
}

fn inverse_normalized(value: f64, best: f64) -> f64 {
    if value <= 0.0 {
        1.0
    } else if best <= 0.0 {
        0.0
    } else {
        (best / value).clamp(0.0, 1.0)
    }
}

// ============================================================================
// Backend Router
// ============================================================================

#[derive(Debug)]
pub struct BackendRouter {
    weights: RoutingWeights,
    backends: Vec<Arc<BackendSpec>>,
    health: Arc<HealthMonitor>,
    ledger: Arc<PerformanceLedger>,
}

impl BackendRouter {
    pub fn new(
        weights: RoutingWeights,
        backends: Vec<Arc<BackendSpec>>,
        health: Arc<HealthMonitor>,
        ledger: Arc<PerformanceLedger>,
    ) -> Result<Self, DispatchError> {
        weights.validate()?;
        let mut seen = HashSet::new();
        for backend in &backends {
            if !seen.insert(backend.id.as_str()) {
                return Err(DispatchError::config(format!(
                    "duplicate backend id '{}'",
                    backend.id
                )));
            }
            if !backend.cost_per_unit.is_finite() || backend.cost_per_unit < 0.0 {
                return Err(DispatchError::config(format!(
                    "backend '{}' has invalid cost_per_unit {}",
                    backend.id, backend.cost_per_unit
                )));
            }
            health.register(&backend.id);
            ledger.register(&backend.id);
        }
        Ok(Self {
            weights,
            backends,
            health,
            ledger,
        })
    }

    pub fn backends(&self) -> &[Arc<BackendSpec>] {
        &self.backends
    }

    pub fn weights(&self) -> RoutingWeights {
        self.weights
    }

    /// Rank the backends able to serve `required`
    pub fn select(&self, required: &BTreeSet<Capability>) -> Result<Vec<Candidate>, DispatchError> {
        let mut excluded: Vec<(String, ExclusionReason)> = Vec::new();
        let mut eligible = Vec::new();

        for backend in &self.backends {
            if !backend.enabled {
                excluded.push((backend.id.clone(), ExclusionReason::Disabled));
                continue;
            }
            let missing = backend.missing_capabilities(required);
            if !missing.is_empty() {
                excluded.push((
                    backend.id.clone(),
                    ExclusionReason::MissingCapabilities {
                        missing: missing.iter().map(|c| c.to_string()).collect(),
                    },
                ));
                continue;
            }
            let (health, probe) = match self.health.routing_view(&backend.id) {
                RoutingView::Available(state) => (state, false),
                RoutingView::ProbeEligible => (HealthState::HalfOpen, true),
                RoutingView::Excluded(reason) => {
                    excluded.push((backend.id.clone(), reason));
                    continue;
                }
            };
            let p95 = self.ledger.stats(&backend.id).p95_latency_ms();
            eligible.push((backend.clone(), health, probe, p95));
        }

        if eligible.is_empty() {
            return Err(self.exhausted(excluded));
        }

        let best_cost = eligible
            .iter()
            .map(|(b, ..)| b.cost_per_unit)
            .fold(f64::INFINITY, f64::min);
        let best_latency = eligible
            .iter()
            .filter_map(|(.., p95)| p95.map(|p| p as f64))
            .fold(f64::INFINITY, f64::min);

        let mut ranked: Vec<Candidate> = eligible
            .into_iter()
            .map(|(backend, health, probe, p95)| {
                let cost_score = inverse_normalized(backend.cost_per_unit, best_cost);
                let latency_score = match p95 {
                    Some(p95) => inverse_normalized(p95 as f64, best_latency),
                    None => NEUTRAL_LATENCY_SCORE,
                };
                let score = self.weights.cost * cost_score
                    + self.weights.latency * latency_score
                    + self.weights.availability * health.health_score();
                Candidate {
                    backend,
                    score,
                    health,
                    probe,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            let key = |c: &Candidate| {
                (
                    Reverse((c.score / SCORE_RESOLUTION).round() as i64),
                    c.backend.priority_hint,
                )
            };
            key(a)
                .cmp(&key(b))
                .then_with(|| a.backend.id.cmp(&b.backend.id))
        });

        tracing::debug!(
            ranking = ?ranked.iter().map(|c| (c.id(), c.score)).collect::<Vec<_>>(),
            excluded = excluded.len(),
            "Ranked backends"
        );

        Ok(ranked)
    }

    fn exhausted(&self, excluded: Vec<(String, ExclusionReason)>) -> DispatchError {
        if self.backends.len() == 1 {
            if let Some((backend, ExclusionReason::CircuitOpen { retry_in_ms })) = excluded.first() {
                return DispatchError::CircuitOpen {
                    backend: backend.clone(),
                    retry_in: Duration::from_millis(*retry_in_ms),
                };
            }
        }
        DispatchError::AllBackendsExhausted { reasons: excluded }
    }
}

// ============================================================================
// Tests
// ============================================================================
