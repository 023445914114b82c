//! Timeout calibration
//!
//! Derives a per-backend, per-request deadline from the backend's rolling p95
//! latency instead of a fixed constant. Recording an outcome only marks the
//! backend's profile stale; the profile is rebuilt on the next read, outside
//! of any lock readers wait on, and swapped in atomically.

use super::ledger::PerformanceLedger;
use crate::error::DispatchError;
use crate::models::{BackendClass, OutcomeSample, RequestFeatures};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

// ============================================================================
// Calibrator Configuration
// ============================================================================

/// Configuration for timeout calibration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CalibratorConfig {
    /// Samples needed before the ledger p95 replaces the static default
    pub min_samples: usize,
    /// Complexity scaling factor
    pub alpha: f64,
    /// Payload size scaling factor
    pub beta: f64,
    /// Payload size at which the size factor reaches `1 + beta * ln 2`
    pub reference_bytes: usize,
    pub min_bound_ms: u64,
    pub max_bound_ms: u64,
    /// Cold-start baseline for cloud backends
    pub default_ms: u64,
    /// Cold-start baseline for local backends
    pub local_default_ms: u64,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            min_samples: 20,
            alpha: 1.0,
            beta: 0.25,
            reference_bytes: 4096,
            min_bound_ms: 1_000,
            max_bound_ms: 120_000,
            default_ms: 30_000,
            local_default_ms: 60_000,
        }
    }
}

impl CalibratorConfig {
    pub fn with_bounds(mut self, min_bound_ms: u64, max_bound_ms: u64) -> Self {
        self.min_bound_ms = min_bound_ms;
        self.max_bound_ms = max_bound_ms;
        self
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    pub fn with_scaling(mut self, alpha: f64, beta: f64) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.min_bound_ms == 0 {
            return Err(DispatchError::config("calibrator.min_bound_ms must be > 0"));
        }
        if self.max_bound_ms < self.min_bound_ms {
            return Err(DispatchError::config(
                "calibrator.max_bound_ms must be >= calibrator.min_bound_ms",
            ));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(DispatchError::config("calibrator.alpha must be >= 0"));
        }
        if !self.beta.is_finite() || self.beta < 0.0 {
            return Err(DispatchError::config("calibrator.beta must be >= 0"));
        }
        if self.reference_bytes == 0 {
            return Err(DispatchError::config("calibrator.reference_bytes must be > 0"));
        }
        Ok(())
    }

    /// Static baseline used until enough samples exist
    pub fn cold_start_ms(&self, class: BackendClass) -> u64 {
        match class {
            BackendClass::Cloud => self.default_ms,
            BackendClass::Local => self.local_default_ms,
        }
    }

    fn clamp(&self, value_ms: f64) -> u64 {
        let value = if value_ms.is_nan() { 0.0 } else { value_ms };
        let min = self.min_bound_ms as f64;
        let max = self.max_bound_ms as f64;
        value.clamp(min, max) as u64
    }
}

// ============================================================================
// Timeout Profile
// ============================================================================

/// Last computed timeout profile for a backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeoutProfile {
    pub backend_id: String,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub sample_count: usize,
    /// Baseline clamped to bounds, before request features are applied
    pub calibrated_ms: u64,
    pub min_bound_ms: u64,
    pub max_bound_ms: u64,
    /// True while the static per-class default is in use
    pub cold_start: bool,
}

#[derive(Debug)]
struct ProfileSlot {
    class: BackendClass,
    /// Unclamped baseline matching `profile`
    baseline_ms: RwLock<(f64, TimeoutProfile)>,
    stale: AtomicBool,
}

// ============================================================================
// Timeout Calibrator
// ============================================================================

#[derive(Debug)]
pub struct TimeoutCalibrator {
    config: CalibratorConfig,
    ledger: Arc<PerformanceLedger>,
    slots: RwLock<HashMap<String, Arc<ProfileSlot>>>,
}

impl TimeoutCalibrator {
    pub fn new(config: CalibratorConfig, ledger: Arc<PerformanceLedger>) -> Self {
        Self {
            config,
            ledger,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CalibratorConfig {
        &self.config
    }

    /// Register a backend so cold-start timeouts use its class default
    pub fn register(&self, backend_id: &str, class: BackendClass) {
        let mut slots = match self.slots.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(self.cold_slot(backend_id, class)));
    }

    /// Note a new sample for the backend; the profile is rebuilt on next read
    pub fn record_outcome(&self, sample: &OutcomeSample) {
        self.slot(&sample.backend_id).stale.store(true, Ordering::Release);
    }

    /// Current timeout profile for a backend
    pub fn profile(&self, backend_id: &str) -> TimeoutProfile {
        self.refreshed(backend_id).1
    }

    /// Deadline for a request against a backend
    pub fn timeout_for(&self, backend_id: &str, features: RequestFeatures) -> Duration {
        let (baseline, _) = self.refreshed(backend_id);
        let complexity = if features.estimated_complexity.is_finite() {
            features.estimated_complexity.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let complexity_factor = 1.0 + self.config.alpha * complexity;
        let size_ratio = features.payload_size as f64 / self.config.reference_bytes.max(1) as f64;
        let size_factor = 1.0 + self.config.beta * size_ratio.ln_1p();

        Duration::from_millis(self.config.clamp(baseline * complexity_factor * size_factor))
    }

    fn refreshed(&self, backend_id: &str) -> (f64, TimeoutProfile) {
        let slot = self.slot(backend_id);
        if slot.stale.swap(false, Ordering::AcqRel) {
            let rebuilt = self.compute(backend_id, slot.class);
            match slot.baseline_ms.write() {
                Ok(mut guard) => *guard = rebuilt.clone(),
                Err(poisoned) => *poisoned.into_inner() = rebuilt.clone(),
            }
            return rebuilt;
        }
        let current = match slot.baseline_ms.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        current
    }

    fn compute(&self, backend_id: &str, class: BackendClass) -> (f64, TimeoutProfile) {
        let stats = self.ledger.stats(backend_id);
        match stats.percentiles {
            Some(p) if p.samples >= self.config.min_samples.max(1) => {
                let baseline = p.p95 as f64;
                let profile = TimeoutProfile {
                    backend_id: backend_id.to_string(),
                    p50: p.p50,
                    p95: p.p95,
                    p99: p.p99,
                    sample_count: p.samples,
                    calibrated_ms: self.config.clamp(baseline),
                    min_bound_ms: self.config.min_bound_ms,
                    max_bound_ms: self.config.max_bound_ms,
                    cold_start: false,
                };
                (baseline, profile)
            }
            Some(p) => {
                let (baseline, mut profile) = self.cold_profile(backend_id, class);
                profile.p50 = p.p50;
                profile.p95 = p.p95;
                profile.p99 = p.p99;
                profile.sample_count = p.samples;
                (baseline, profile)
            }
            None => self.cold_profile(backend_id, class),
        }
    }

    fn cold_profile(&self, backend_id: &str, class: BackendClass) -> (f64, TimeoutProfile) {
        let baseline = self.config.cold_start_ms(class) as f64;
        let profile = TimeoutProfile {
            backend_id: backend_id.to_string(),
            p50: 0,
            p95: 0,
            p99: 0,
            sample_count: 0,
            calibrated_ms: self.config.clamp(baseline),
            min_bound_ms: self.config.min_bound_ms,
            max_bound_ms: self.config.max_bound_ms,
            cold_start: true,
        };
        (baseline, profile)
    }

    fn cold_slot(&self, backend_id: &str, class: BackendClass) -> ProfileSlot {
        ProfileSlot {
            class,
            baseline_ms: RwLock::new(self.cold_profile(backend_id, class)),
            // samples may already exist in a shared ledger
            stale: AtomicBool::new(true),
        }
    }

    fn slot(&self, backend_id: &str) -> Arc<ProfileSlot> {
        {
            let slots = match self.slots.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(slot) = slots.get(backend_id) {
                return slot.clone();
            }
        }
        self.register(backend_id, BackendClass::default());
        let slots = match self.slots.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots
            .get(backend_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(self.cold_slot(backend_id, BackendClass::default())))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ledger::LedgerConfig;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn calibrator(config: CalibratorConfig) -> (Arc<PerformanceLedger>, TimeoutCalibrator) {
        let ledger = Arc::new(PerformanceLedger::new(LedgerConfig::default()));
        let calibrator = TimeoutCalibrator::new(config, ledger.clone());
        (ledger, calibrator)
    }

    fn record(ledger: &PerformanceLedger, calibrator: &TimeoutCalibrator, sample: OutcomeSample) {
        ledger.record(sample.clone());
        calibrator.record_outcome(&sample);
    }

    #[test]
    fn test_cold_start_uses_class_default() {
        let (_, calibrator) = calibrator(CalibratorConfig::default());
        calibrator.register("local", BackendClass::Local);

        let cloud = calibrator.timeout_for("cloud", RequestFeatures::default());
        let local = calibrator.timeout_for("local", RequestFeatures::default());
        assert_eq!(cloud, Duration::from_millis(30_000));
        assert_eq!(local, Duration::from_millis(60_000));
        assert!(calibrator.profile("cloud").cold_start);
    }

    #[test]
    fn test_warm_profile_uses_p95() {
        let config = CalibratorConfig::default()
            .with_min_samples(10)
            .with_bounds(10, 10_000);
        let (ledger, calibrator) = calibrator(config);
        for latency in 1..=100 {
            record(&ledger, &calibrator, OutcomeSample::success("a", latency * 10));
        }

        let profile = calibrator.profile("a");
        assert!(!profile.cold_start);
        assert_eq!(profile.p95, 950);
        assert_eq!(profile.calibrated_ms, 950);
        assert_eq!(profile.sample_count, 100);
    }

    #[test]
    fn test_profile_reused_until_next_outcome() {
        let config = CalibratorConfig::default().with_min_samples(1).with_bounds(10, 10_000);
        let (ledger, calibrator) = calibrator(config);
        record(&ledger, &calibrator, OutcomeSample::success("a", 300));

        let rebuilt = calibrator.profile("a");
        let cached = calibrator.profile("a");
        assert_eq!(rebuilt, cached);
        assert_eq!(cached.calibrated_ms, 300);

        // samples written straight to the ledger stay invisible until an outcome marks it stale
        ledger.record(OutcomeSample::success("a", 900));
        assert_eq!(calibrator.profile("a").calibrated_ms, 300);
        record(&ledger, &calibrator, OutcomeSample::success("a", 900));
        assert_eq!(calibrator.profile("a").calibrated_ms, 900);
    }

    #[test]
    fn test_request_features_scale_timeout() {
        let config = CalibratorConfig::default()
            .with_min_samples(1)
            .with_bounds(1, 1_000_000)
            .with_scaling(1.0, 0.5);
        let (ledger, calibrator) = calibrator(config);
        record(&ledger, &calibrator, OutcomeSample::success("a", 1000));

        let plain = calibrator.timeout_for("a", RequestFeatures::new(0.0, 0));
        let complex = calibrator.timeout_for("a", RequestFeatures::new(1.0, 0));
        let large = calibrator.timeout_for("a", RequestFeatures::new(0.0, 4096));

        assert_eq!(plain, Duration::from_millis(1000));
        assert_eq!(complex, Duration::from_millis(2000));
        // 1 + 0.5 * ln(2)
        assert_eq!(large, Duration::from_millis(1346));
    }

    #[test]
    fn test_adversarial_samples_stay_within_bounds() {
        let config = CalibratorConfig::default()
            .with_min_samples(1)
            .with_bounds(500, 5_000);
        let (ledger, calibrator) = calibrator(config);

        for _ in 0..50 {
            record(&ledger, &calibrator, OutcomeSample::success("zero", 0));
            record(&ledger, &calibrator, OutcomeSample::timeout("max", u64::MAX));
        }

        for features in [
            RequestFeatures::new(0.0, 0),
            RequestFeatures::new(1.0, usize::MAX),
        ] {
            let zero = calibrator.timeout_for("zero", features);
            let max = calibrator.timeout_for("max", features);
            assert!(zero >= Duration::from_millis(500) && zero <= Duration::from_millis(5_000));
            assert_eq!(max, Duration::from_millis(5_000));
        }
        assert_eq!(calibrator.profile("zero").calibrated_ms, 500);
        assert_eq!(calibrator.profile("max").calibrated_ms, 5_000);
    }

    #[test]
    fn test_converges_for_uniform_latencies() {
        let config = CalibratorConfig::default().with_bounds(50, 10_000);
        let (ledger, calibrator) = calibrator(config);
        let mut rng = StdRng::seed_from_u64(42);

        let mut tail = Vec::new();
        for i in 0..1000 {
            let latency = rng.gen_range(100..=200);
            record(&ledger, &calibrator, OutcomeSample::success("a", latency));
            if i >= 900 {
                tail.push(calibrator.timeout_for("a", RequestFeatures::default()).as_millis() as f64);
            }
        }

        let last = *tail.last().unwrap();
        let p95 = ledger.stats("a").p95_latency_ms().unwrap() as f64;
        assert!(last >= p95 && last <= 10_000.0);
        for value in tail {
            assert!((value - last).abs() <= last * 0.05, "{} vs {}", value, last);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(CalibratorConfig::default().validate().is_ok());
        assert!(CalibratorConfig::default().with_bounds(10, 5).validate().is_err());
        assert!(CalibratorConfig::default().with_bounds(0, 5).validate().is_err());
        assert!(CalibratorConfig::default()
            .with_scaling(-1.0, 0.0)
            .validate()
            .is_err());
    }
}
