//! Load balancing strategies
//!
//! This module provides the strategies for distributing requests across
//! the members of a backend pool, plus the bookkeeping the adaptive
//! strategy and the effectiveness analytics rely on.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

// ============================================================================
// Load Balance Strategy
// ============================================================================

/// Load balancing strategy for pool member selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Cycle through available members (default)
    #[default]
    RoundRobin,
    /// Member with the fewest active connections, ties round-robin
    LeastConnections,
    /// Random, weighted by the inverse of smoothed latency
    WeightedResponseTime,
    /// Epsilon-greedy choice between least connections and weighted response time
    Adaptive,
}

impl LoadBalanceStrategy {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" => Self::RoundRobin,
            "least_connections" | "leastconnections" | "least_conn" => Self::LeastConnections,
            "weighted_response_time" | "weightedresponsetime" | "response_time" => {
                Self::WeightedResponseTime
            }
            "adaptive" => Self::Adaptive,
            _ => Self::RoundRobin,
        }
    }
}

impl std::fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round_robin"),
            Self::LeastConnections => write!(f, "least_connections"),
            Self::WeightedResponseTime => write!(f, "weighted_response_time"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

// ============================================================================
// Strategy State
// ============================================================================

/// State for round-robin selection
#[derive(Debug, Default)]
pub struct RoundRobinState {
    counter: AtomicUsize,
}

impl RoundRobinState {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Get next index for a given total count
    pub fn next(&self, total: usize) -> usize {
        if total == 0 {
            return 0;
        }
        self.counter.fetch_add(1, Ordering::SeqCst) % total
    }
}

/// Pick an index with probability proportional to `weights[i]`
pub fn weighted_index<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    if total <= 0.0 {
        return 0;
    }
    let target = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for (idx, &weight) in weights.iter().enumerate() {
        if !weight.is_finite() || weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        if target < cumulative {
            return idx;
        }
    }
    weights.len().saturating_sub(1)
}

/// Epsilon-greedy bandit over least connections and weighted response time.
///
/// Each arm keeps the latencies of its last `window` completions, failures
/// included at their penalty latency. Until both arms have been tried the
/// untried one is chosen. After that the arm with the lower mean is exploited
/// with probability `1 - epsilon`, and an arm whose completions are all still
/// in flight counts as the better one.
#[derive(Debug)]
pub struct AdaptiveState {
    window: usize,
    epsilon: f64,
    least_connections: Arm,
    response_time: Arm,
}

#[derive(Debug, Default)]
struct Arm {
    tried: bool,
    latencies: VecDeque<u64>,
}

impl Arm {
    fn mean(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            None
        } else {
            Some(self.latencies.iter().sum::<u64>() as f64 / self.latencies.len() as f64)
        }
    }
}

impl AdaptiveState {
    pub fn new(window: usize, epsilon: f64) -> Self {
        let window = window.max(1);
        Self {
            window,
            epsilon: epsilon.clamp(0.0, 1.0),
            least_connections: Arm::default(),
            response_time: Arm::default(),
        }
    }

    fn arm(&self, strategy: LoadBalanceStrategy) -> Option<&Arm> {
        match strategy {
            LoadBalanceStrategy::LeastConnections => Some(&self.least_connections),
            LoadBalanceStrategy::WeightedResponseTime => Some(&self.response_time),
            _ => None,
        }
    }

    fn arm_mut(&mut self, strategy: LoadBalanceStrategy) -> Option<&mut Arm> {
        match strategy {
            LoadBalanceStrategy::LeastConnections => Some(&mut self.least_connections),
            LoadBalanceStrategy::WeightedResponseTime => Some(&mut self.response_time),
            _ => None,
        }
    }

    /// Mean latency over the arm's recent completions
    pub fn predicted_latency(&self, strategy: LoadBalanceStrategy) -> Option<f64> {
        self.arm(strategy)?.mean()
    }

    /// The arm with the lower predicted latency; least connections on ties
    pub fn best(&self) -> LoadBalanceStrategy {
        let lc = self.least_connections.mean();
        let rt = self.response_time.mean();
        match (lc, rt) {
            (Some(lc), Some(rt)) if rt < lc => LoadBalanceStrategy::WeightedResponseTime,
            (Some(_), None) => LoadBalanceStrategy::WeightedResponseTime,
            _ => LoadBalanceStrategy::LeastConnections,
        }
    }

    /// Choose the arm for the next pick and mark it as tried
    pub fn choose<R: Rng + ?Sized>(&mut self, rng: &mut R) -> LoadBalanceStrategy {
        let chosen = if !self.least_connections.tried {
            LoadBalanceStrategy::LeastConnections
        } else if !self.response_time.tried {
            LoadBalanceStrategy::WeightedResponseTime
        } else {
            let best = self.best();
            if rng.gen::<f64>() < self.epsilon {
                match best {
                    LoadBalanceStrategy::LeastConnections => {
                        LoadBalanceStrategy::WeightedResponseTime
                    }
                    _ => LoadBalanceStrategy::LeastConnections,
                }
            } else {
                best
            }
        };
        if let Some(arm) = self.arm_mut(chosen) {
            arm.tried = true;
        }
        chosen
    }

    pub fn record(&mut self, strategy: LoadBalanceStrategy, latency_ms: u64) {
        let window = self.window;
        let Some(arm) = self.arm_mut(strategy) else {
            return;
        };
        arm.tried = true;
        if arm.latencies.len() == window {
            arm.latencies.pop_front();
        }
        arm.latencies.push_back(latency_ms);
    }
}

// ============================================================================
// Strategy Effectiveness
// ============================================================================

/// Counters for the requests a single strategy placed
#[derive(Debug, Default)]
pub struct StrategyCounters {
    selections: AtomicU64,
    completions: AtomicU64,
    failures: AtomicU64,
    latency_total_ms: AtomicU64,
}

impl StrategyCounters {
    pub fn record_selection(&self) {
        self.selections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self, success: bool, latency_ms: u64) {
        self.completions.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_total_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self, strategy: LoadBalanceStrategy) -> StrategyEffectiveness {
        let completions = self.completions.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let latency_total = self.latency_total_ms.load(Ordering::Relaxed);
        StrategyEffectiveness {
            strategy,
            selections: self.selections.load(Ordering::Relaxed),
            completions,
            failures,
            success_rate: (completions > 0)
                .then(|| (completions - failures) as f64 / completions as f64),
            mean_latency_ms: (completions > 0).then(|| latency_total as f64 / completions as f64),
        }
    }
}

/// How well a strategy has performed for a pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyEffectiveness {
    pub strategy: LoadBalanceStrategy,
    pub selections: u64,
    pub completions: u64,
    pub failures: u64,
    pub success_rate: Option<f64>,
    pub mean_latency_ms: Option<f64>,
}

// ============================================================================
// Tests
// ============================================================================
