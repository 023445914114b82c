//! Performance ledger
//!
//! Append-only rolling statistics per backend. Each backend keeps a
//! count-based sliding window of its most recent outcome samples; the
//! oldest sample is discarded once the window is full.
//!
//! Aggregates (counts, mean, percentiles) are computed lazily on the first
//! read after a write and cached until the next write, so recording a sample
//! is O(1) and never sorts.

use crate::models::OutcomeSample;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

// ============================================================================
// Ledger Configuration
// ============================================================================

/// Configuration for the performance ledger
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Samples retained per backend
    pub window_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { window_size: 200 }
    }
}

impl LedgerConfig {
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }
}

// ============================================================================
// Ledger Statistics
// ============================================================================

/// Latency percentiles over representative samples (successes and timeouts)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    /// Number of samples the percentiles were computed from
    pub samples: usize,
}

/// Aggregates over a backend's current window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerStats {
    /// Samples currently in the window
    pub sample_count: usize,
    pub successes: usize,
    pub failures: usize,
    pub timeouts: usize,
    /// Mean latency over successful samples
    pub mean_latency_ms: Option<f64>,
    pub percentiles: Option<LatencyPercentiles>,
    /// Samples ever recorded for this backend, including evicted ones
    pub total_recorded: u64,
}

impl LedgerStats {
    pub fn p95_latency_ms(&self) -> Option<u64> {
        self.percentiles.map(|p| p.p95)
    }

    pub fn success_rate(&self) -> Option<f64> {
        if self.sample_count == 0 {
            None
        } else {
            Some(self.successes as f64 / self.sample_count as f64)
        }
    }
}

/// Nearest-rank percentile over an ascending slice
pub(crate) fn percentile(sorted: &[u64], quantile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

// ============================================================================
// Backend Window
// ============================================================================

#[derive(Debug)]
struct BackendWindow {
    samples: VecDeque<OutcomeSample>,
    capacity: usize,
    total_recorded: u64,
    cached: Option<LedgerStats>,
}

impl BackendWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total_recorded: 0,
            cached: None,
        }
    }

    fn push(&mut self, sample: OutcomeSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.total_recorded += 1;
        self.cached = None;
    }

    fn stats(&mut self) -> LedgerStats {
        if let Some(stats) = &self.cached {
            return stats.clone();
        }

        let mut stats = LedgerStats {
            sample_count: self.samples.len(),
            total_recorded: self.total_recorded,
            ..Default::default()
        };
        let mut success_latency_sum = 0u64;
        let mut latencies = Vec::with_capacity(self.samples.len());

        for sample in &self.samples {
            if sample.success {
                stats.successes += 1;
                success_latency_sum = success_latency_sum.saturating_add(sample.latency_ms);
            } else {
                stats.failures += 1;
                if sample.timed_out {
                    stats.timeouts += 1;
                }
            }
            if sample.is_latency_representative() {
                latencies.push(sample.latency_ms);
            }
        }

        if stats.successes > 0 {
            stats.mean_latency_ms = Some(success_latency_sum as f64 / stats.successes as f64);
        }
        if !latencies.is_empty() {
            latencies.sort_unstable();
            stats.percentiles = Some(LatencyPercentiles {
                p50: percentile(&latencies, 0.50),
                p95: percentile(&latencies, 0.95),
                p99: percentile(&latencies, 0.99),
                samples: latencies.len(),
            });
        }

        self.cached = Some(stats.clone());
        stats
    }
}

// ============================================================================
// Performance Ledger
// ============================================================================

/// Rolling per-backend outcome statistics
///
/// Windows are independent: recording for one backend never contends with
/// another backend's readers or writers once its window exists.
#[derive(Debug)]
pub struct PerformanceLedger {
    config: LedgerConfig,
    windows: RwLock<HashMap<String, Arc<Mutex<BackendWindow>>>>,
}

impl PerformanceLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-create the window for a backend
    pub fn register(&self, backend_id: &str) {
        self.window(backend_id);
    }

    /// Append a sample to its backend's window
    pub fn record(&self, sample: OutcomeSample) {
        let window = self.window(&sample.backend_id);
        let mut window = match window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        window.push(sample);
    }

    /// Current aggregates for a backend (empty stats for unknown backends)
    pub fn stats(&self, backend_id: &str) -> LedgerStats {
        let window = match self.existing(backend_id) {
            Some(window) => window,
            None => return LedgerStats::default(),
        };
        let mut window = match window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        window.stats()
    }

    /// Copy of the samples currently in a backend's window, oldest first
    pub fn samples(&self, backend_id: &str) -> Vec<OutcomeSample> {
        match self.existing(backend_id) {
            Some(window) => match window.lock() {
                Ok(guard) => guard.samples.iter().cloned().collect(),
                Err(poisoned) => poisoned.into_inner().samples.iter().cloned().collect(),
            },
            None => Vec::new(),
        }
    }

    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    fn existing(&self, backend_id: &str) -> Option<Arc<Mutex<BackendWindow>>> {
        let windows = match self.windows.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows.get(backend_id).cloned()
    }

    fn window(&self, backend_id: &str) -> Arc<Mutex<BackendWindow>> {
        if let Some(window) = self.existing(backend_id) {
            return window;
        }
        let mut windows = match self.windows.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let capacity = self.config.window_size.max(1);
        windows
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BackendWindow::new(capacity))))
            .clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
