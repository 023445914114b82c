//! Performance analytics
//!
//! Aggregates the dispatcher's attempt and outcome events into per-backend
//! utilization and combines them with the multiplexer's failover history and
//! strategy effectiveness for reporting.

use super::backend_pool::{FailoverEvent, MultiplexerAnalytics, StrategyEffectiveness};
use crate::models::OutcomeSample;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// How a dispatch cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Default)]
struct BackendCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    latency_total_ms: AtomicU64,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    fallthroughs: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendUtilization {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub success_rate: Option<f64>,
    pub mean_latency_ms: Option<f64>,
    /// Fraction of all attempts that went to this backend
    pub traffic_share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchTotals {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Attempts beyond the first across all dispatches
    pub fallthroughs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub generated_at: DateTime<Utc>,
    pub dispatches: DispatchTotals,
    pub per_backend_utilization: BTreeMap<String, BackendUtilization>,
    pub failover_history: Vec<FailoverEvent>,
    pub strategy_effectiveness: BTreeMap<String, Vec<StrategyEffectiveness>>,
}

/// Lock-free counters keyed by the backends known at construction
#[derive(Debug)]
pub struct PerformanceAnalytics {
    backends: HashMap<String, BackendCounters>,
    dispatches: DispatchCounters,
}

impl PerformanceAnalytics {
    pub fn new<I, S>(backend_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            backends: backend_ids
                .into_iter()
                .map(|id| (id.into(), BackendCounters::default()))
                .collect(),
            dispatches: DispatchCounters::default(),
        }
    }

    /// Fold one executed attempt into its backend's utilization
    pub fn record_attempt(&self, sample: &OutcomeSample) {
        let Some(counters) = self.backends.get(&sample.backend_id) else {
            tracing::debug!(backend = %sample.backend_id, "Ignoring sample for unknown backend");
            return;
        };
        counters.attempts.fetch_add(1, Ordering::Relaxed);
        counters
            .latency_total_ms
            .fetch_add(sample.latency_ms, Ordering::Relaxed);
        if sample.success {
            counters.successes.fetch_add(1, Ordering::Relaxed);
        } else if sample.timed_out {
            counters.timeouts.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dispatch(&self, result: DispatchResult, attempts: u32) {
        let d = &self.dispatches;
        d.total.fetch_add(1, Ordering::Relaxed);
        d.fallthroughs
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);
        let counter = match result {
            DispatchResult::Succeeded => &d.succeeded,
            DispatchResult::Failed => &d.failed,
            DispatchResult::TimedOut => &d.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> DispatchTotals {
        let d = &self.dispatches;
        DispatchTotals {
            total: d.total.load(Ordering::Relaxed),
            succeeded: d.succeeded.load(Ordering::Relaxed),
            failed: d.failed.load(Ordering::Relaxed),
            timed_out: d.timed_out.load(Ordering::Relaxed),
            fallthroughs: d.fallthroughs.load(Ordering::Relaxed),
        }
    }

    pub fn utilization(&self) -> BTreeMap<String, BackendUtilization> {
        let total_attempts: u64 = self
            .backends
            .values()
            .map(|c| c.attempts.load(Ordering::Relaxed))
            .sum();

        self.backends
            .iter()
            .map(|(id, c)| {
                let attempts = c.attempts.load(Ordering::Relaxed);
                let successes = c.successes.load(Ordering::Relaxed);
                let latency_total = c.latency_total_ms.load(Ordering::Relaxed);
                let utilization = BackendUtilization {
                    attempts,
                    successes,
                    failures: c.failures.load(Ordering::Relaxed),
                    timeouts: c.timeouts.load(Ordering::Relaxed),
                    success_rate: (attempts > 0).then(|| successes as f64 / attempts as f64),
                    mean_latency_ms: (attempts > 0)
                        .then(|| latency_total as f64 / attempts as f64),
                    traffic_share: if total_attempts == 0 {
                        0.0
                    } else {
                        attempts as f64 / total_attempts as f64
                    },
                };
                (id.clone(), utilization)
            })
            .collect()
    }

    pub fn report(&self, pools: MultiplexerAnalytics) -> AnalyticsReport {
        AnalyticsReport {
            generated_at: Utc::now(),
            dispatches: self.totals(),
            per_backend_utilization: self.utilization(),
            failover_history: pools.failover_history,
            strategy_effectiveness: pools.strategy_effectiveness,
        }
    }
}
