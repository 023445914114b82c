//! Dispatch orchestrator
//!
//! The public entry point of the dispatch layer. A `Dispatcher` owns every
//! component (ledger, calibrator, health monitor, router, multiplexer,
//! analytics) and drives each request through
//!
//! ```text
//! PENDING -> SELECTING -> DISPATCHED -> SUCCEEDED
//!                ^             |
//!                +-- failure --+--> FAILED | TIMED_OUT
//! ```
//!
//! The router's ranking is walked once. Each candidate is admitted by its
//! breaker, given a pool member and a calibrated deadline, then executed. A
//! failed or timed-out candidate is skipped for the rest of this request only.

use super::analytics::{AnalyticsReport, DispatchResult, PerformanceAnalytics};
use super::backend_pool::{
    FailoverEvent, MemberConfig, MemberLease, Multiplexer, PoolConfig, PoolSpec, PoolStatus,
};
use super::calibrator::{CalibratorConfig, TimeoutCalibrator, TimeoutProfile};
use super::health::{Admission, CircuitBreakerConfig, HealthMonitor, HealthSnapshot, RoutingView};
use super::ledger::{LedgerConfig, LedgerStats, PerformanceLedger};
use super::router::{BackendRouter, RoutingWeights};
use crate::backends::{Backend, Deadline};
use crate::config::Settings;
use crate::error::{DispatchError, ExclusionReason};
use crate::models::{BackendSpec, DispatchRequest, OutcomeSample};
use crate::utils::timeout::{with_deadline, with_timeout, TimeoutError};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Dispatch Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Backend executions allowed per request
    pub max_attempts: u32,
    pub health_probe_interval_secs: u64,
    pub health_probe_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            health_probe_interval_secs: 10,
            health_probe_timeout_ms: 2_000,
        }
    }
}

impl DispatchConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_attempts == 0 {
            return Err(DispatchError::config("dispatch.max_attempts must be > 0"));
        }
        if self.health_probe_interval_secs == 0 {
            return Err(DispatchError::config(
                "dispatch.health_probe_interval_secs must be > 0",
            ));
        }
        if self.health_probe_timeout_ms == 0 {
            return Err(DispatchError::config(
                "dispatch.health_probe_timeout_ms must be > 0",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Dispatch State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchState {
    Pending,
    Selecting,
    Dispatched,
    Succeeded,
    Failed,
    TimedOut,
}

impl DispatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    fn can_advance_to(&self, next: DispatchState) -> bool {
        use DispatchState::*;
        matches!(
            (self, next),
            (Pending, Selecting)
                | (Selecting, Dispatched)
                | (Selecting, Failed)
                | (Selecting, TimedOut)
                | (Dispatched, Succeeded)
                | (Dispatched, Selecting)
        )
    }
}

/// State path of one request
#[derive(Debug)]
struct DispatchCycle<'a> {
    request_id: &'a str,
    path: Vec<DispatchState>,
}

impl<'a> DispatchCycle<'a> {
    fn new(request_id: &'a str) -> Self {
        Self {
            request_id,
            path: vec![DispatchState::Pending],
        }
    }

    fn state(&self) -> DispatchState {
        self.path
            .last()
            .copied()
            .unwrap_or(DispatchState::Pending)
    }

    fn advance(&mut self, next: DispatchState) {
        let current = self.state();
        debug_assert!(
            current.can_advance_to(next),
            "invalid dispatch transition {:?} -> {:?}",
            current,
            next
        );
        tracing::trace!(
            request_id = %self.request_id,
            from = ?current,
            to = ?next,
            "Dispatch state transition"
        );
        self.path.push(next);
    }
}

// ============================================================================
// Dispatch Outcome
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedBackend {
    pub backend_id: String,
    pub reason: ExclusionReason,
}

/// Result of a successful dispatch
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub request_id: String,
    pub backend_id: String,
    pub member_id: String,
    pub response: serde_json::Value,
    pub latency_ms: u64,
    /// Deadline the successful attempt ran under
    pub timeout_ms: u64,
    /// Backend executions, including the successful one
    pub attempts: u32,
    /// Candidates passed over before the successful one
    pub skipped: Vec<SkippedBackend>,
    pub path: Vec<DispatchState>,
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub enabled: bool,
    pub health: HealthSnapshot,
    pub pool: Option<PoolStatus>,
    pub timeout: TimeoutProfile,
    pub ledger: LedgerStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatcherStatus {
    pub total_members: usize,
    pub backends: BTreeMap<String, BackendStatus>,
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug)]
struct BackendRegistration {
    spec: BackendSpec,
    client: Arc<dyn Backend>,
    pool: PoolSpec,
}

/// Assembles a `Dispatcher` from its component configurations
#[derive(Debug, Default)]
pub struct DispatcherBuilder {
    routing: RoutingWeights,
    circuit_breaker: CircuitBreakerConfig,
    calibrator: CalibratorConfig,
    pool: PoolConfig,
    ledger: LedgerConfig,
    dispatch: DispatchConfig,
    backends: Vec<BackendRegistration>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routing(mut self, weights: RoutingWeights) -> Self {
        self.routing = weights;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn calibrator(mut self, config: CalibratorConfig) -> Self {
        self.calibrator = config;
        self
    }

    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn ledger(mut self, config: LedgerConfig) -> Self {
        self.ledger = config;
        self
    }

    pub fn dispatch(mut self, config: DispatchConfig) -> Self {
        self.dispatch = config;
        self
    }

    /// Add a backend served by `client` through the given pool members
    pub fn backend(
        self,
        spec: BackendSpec,
        client: Arc<dyn Backend>,
        members: Vec<MemberConfig>,
    ) -> Self {
        let pool = PoolSpec::new(spec.id.clone(), members);
        self.backend_with_pool(spec, client, pool)
    }

    /// Add a backend with an explicit pool layout (e.g. a strategy override)
    pub fn backend_with_pool(
        mut self,
        spec: BackendSpec,
        client: Arc<dyn Backend>,
        mut pool: PoolSpec,
    ) -> Self {
        pool.backend_id = spec.id.clone();
        self.backends.push(BackendRegistration { spec, client, pool });
        self
    }

    pub fn build(self) -> Result<Dispatcher, DispatchError> {
        if self.backends.is_empty() {
            return Err(DispatchError::config("at least one backend must be configured"));
        }
        self.circuit_breaker.validate()?;
        self.calibrator.validate()?;
        self.dispatch.validate()?;
        if self.ledger.window_size == 0 {
            return Err(DispatchError::config("ledger.window_size must be > 0"));
        }

        let health = Arc::new(HealthMonitor::new(self.circuit_breaker));
        let ledger = Arc::new(PerformanceLedger::new(self.ledger));
        let calibrator = Arc::new(TimeoutCalibrator::new(self.calibrator, ledger.clone()));

        let mut specs = Vec::with_capacity(self.backends.len());
        let mut pools = Vec::with_capacity(self.backends.len());
        let mut clients = HashMap::with_capacity(self.backends.len());
        for registration in self.backends {
            calibrator.register(&registration.spec.id, registration.spec.class);
            clients.insert(registration.spec.id.clone(), registration.client);
            pools.push(registration.pool);
            specs.push(Arc::new(registration.spec));
        }

        let router = BackendRouter::new(self.routing, specs, health.clone(), ledger.clone())?;
        let multiplexer = Multiplexer::initialize(pools, self.pool, health.clone())?;
        let analytics = PerformanceAnalytics::new(router.backends().iter().map(|b| b.id.clone()));

        tracing::info!(
            backends = router.backends().len(),
            members = multiplexer.status().total_members,
            max_attempts = self.dispatch.max_attempts,
            "Dispatcher initialized"
        );

        Ok(Dispatcher {
            config: self.dispatch,
            clients,
            ledger,
            calibrator,
            health,
            router,
            multiplexer,
            analytics,
        })
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

#[derive(Debug)]
pub struct Dispatcher {
    config: DispatchConfig,
    clients: HashMap<String, Arc<dyn Backend>>,
    ledger: Arc<PerformanceLedger>,
    calibrator: Arc<TimeoutCalibrator>,
    health: Arc<HealthMonitor>,
    router: BackendRouter,
    multiplexer: Multiplexer,
    analytics: PerformanceAnalytics,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Build a dispatcher from loaded settings, resolving each backend's client
    pub fn from_settings(settings: &Settings) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DispatchError::config(format!("failed to build HTTP client: {}", e)))?;

        let mut builder = Self::builder()
            .routing(settings.routing)
            .circuit_breaker(settings.circuit_breaker.clone())
            .calibrator(settings.calibrator.clone())
            .pool(settings.pool.clone())
            .ledger(settings.ledger.clone())
            .dispatch(settings.dispatch.clone());

        for backend in &settings.backends {
            builder =
                builder.backend_with_pool(backend.spec(), backend.kind.build(&client), backend.pool_spec());
        }
        builder.build()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn ledger(&self) -> &PerformanceLedger {
        &self.ledger
    }

    pub fn calibrator(&self) -> &TimeoutCalibrator {
        &self.calibrator
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    /// Route, execute and record a single request
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        let mut cycle = DispatchCycle::new(&request.id);
        cycle.advance(DispatchState::Selecting);

        let ranked = match self.router.select(&request.required_capabilities) {
            Ok(ranked) => ranked,
            Err(err) => {
                cycle.advance(DispatchState::Failed);
                self.analytics.record_dispatch(DispatchResult::Failed, 0);
                tracing::warn!(request_id = %request.id, error = %err, "No backend could be ranked");
                return Err(err);
            }
        };

        let features = request.features();
        let mut skipped: Vec<SkippedBackend> = Vec::new();
        let mut attempts = 0u32;
        let mut last_timeout: Option<(String, Duration)> = None;

        for candidate in &ranked {
            let backend_id = candidate.id();
            let skip = |skipped: &mut Vec<SkippedBackend>, reason: ExclusionReason| {
                tracing::debug!(
                    request_id = %request.id,
                    backend = %backend_id,
                    reason = %reason,
                    "Skipping candidate"
                );
                skipped.push(SkippedBackend {
                    backend_id: backend_id.to_string(),
                    reason,
                });
            };

            if attempts >= self.config.max_attempts {
                skip(&mut skipped, ExclusionReason::AttemptsExhausted);
                continue;
            }
            let Some(client) = self.clients.get(backend_id) else {
                skip(
                    &mut skipped,
                    ExclusionReason::Unavailable {
                        detail: "no backend client".to_string(),
                    },
                );
                continue;
            };
            let admission = match self.health.try_acquire(backend_id) {
                Ok(admission) => admission,
                Err(reason) => {
                    skip(&mut skipped, reason);
                    continue;
                }
            };
            let lease = match self.multiplexer.pick(backend_id) {
                Ok(lease) => lease,
                Err(err) => {
                    if admission == Admission::Probe {
                        self.health
                            .record_failure(backend_id, Admission::Probe, &err.to_string());
                    }
                    skip(
                        &mut skipped,
                        ExclusionReason::Unavailable {
                            detail: err.to_string(),
                        },
                    );
                    continue;
                }
            };

            let timeout = self.calibrator.timeout_for(backend_id, features);
            attempts += 1;
            cycle.advance(DispatchState::Dispatched);
            tracing::debug!(
                request_id = %request.id,
                backend = %backend_id,
                member = %lease.member_id(),
                attempt = attempts,
                timeout_ms = timeout.as_millis() as u64,
                probe = admission == Admission::Probe,
                "Dispatching request"
            );

            let deadline = Deadline::new(timeout);
            let started = Instant::now();
            let result = with_deadline(
                &deadline,
                client.execute(lease.member(), &request.payload, &deadline),
            )
            .await;
            let latency_ms = started.elapsed().as_millis() as u64;
            let member_id = lease.member_id().to_string();

            match result {
                Ok(response) => {
                    let sample = OutcomeSample::success(backend_id, latency_ms)
                        .with_member(&member_id)
                        .with_sizes(request.payload_size, response.response_bytes);
                    self.record(lease, &sample, admission, None);
                    cycle.advance(DispatchState::Succeeded);
                    self.analytics
                        .record_dispatch(DispatchResult::Succeeded, attempts);
                    tracing::info!(
                        request_id = %request.id,
                        backend = %backend_id,
                        member = %member_id,
                        latency_ms,
                        attempts,
                        "Request dispatched"
                    );
                    return Ok(DispatchOutcome {
                        request_id: request.id.clone(),
                        backend_id: backend_id.to_string(),
                        member_id,
                        response: response.body,
                        latency_ms,
                        timeout_ms: timeout.as_millis() as u64,
                        attempts,
                        skipped,
                        path: cycle.path,
                    });
                }
                Err(TimeoutError::Timeout(after)) => {
                    let sample = OutcomeSample::timeout(backend_id, latency_ms)
                        .with_member(&member_id)
                        .with_sizes(request.payload_size, 0);
                    let after_ms = after.as_millis() as u64;
                    self.record(
                        lease,
                        &sample,
                        admission,
                        Some(&format!("timed out after {}ms", after_ms)),
                    );
                    tracing::warn!(
                        request_id = %request.id,
                        backend = %backend_id,
                        member = %member_id,
                        timeout_ms = after_ms,
                        "Backend call timed out"
                    );
                    skip(&mut skipped, ExclusionReason::TimedOut { after_ms });
                    last_timeout = Some((backend_id.to_string(), after));
                }
                Err(TimeoutError::Inner(err)) => {
                    let sample = OutcomeSample::failure(backend_id, latency_ms)
                        .with_member(&member_id)
                        .with_sizes(request.payload_size, 0);
                    let detail = err.to_string();
                    self.record(lease, &sample, admission, Some(&detail));
                    tracing::warn!(
                        request_id = %request.id,
                        backend = %backend_id,
                        member = %member_id,
                        error = %detail,
                        "Backend call failed"
                    );
                    skip(&mut skipped, ExclusionReason::Failed { detail });
                    last_timeout = None;
                }
            }
            cycle.advance(DispatchState::Selecting);
        }

        match last_timeout {
            Some((backend, after)) if attempts >= self.config.max_attempts => {
                cycle.advance(DispatchState::TimedOut);
                self.analytics
                    .record_dispatch(DispatchResult::TimedOut, attempts);
                Err(DispatchError::Timeout { backend, after })
            }
            _ => {
                cycle.advance(DispatchState::Failed);
                self.analytics.record_dispatch(DispatchResult::Failed, attempts);
                tracing::warn!(
                    request_id = %request.id,
                    attempts,
                    candidates = ranked.len(),
                    "All backends exhausted"
                );
                Err(DispatchError::AllBackendsExhausted {
                    reasons: skipped
                        .into_iter()
                        .map(|s| (s.backend_id, s.reason))
                        .collect(),
                })
            }
        }
    }

    /// Feed one attempt's outcome to every component. The pool slot is
    /// released first.
    fn record(
        &self,
        lease: MemberLease,
        sample: &OutcomeSample,
        admission: Admission,
        failure: Option<&str>,
    ) {
        self.multiplexer.record_completion(lease, sample);
        self.ledger.record(sample.clone());
        self.calibrator.record_outcome(sample);
        match failure {
            None => {
                self.health.record_success(&sample.backend_id, admission);
            }
            Some(reason) => {
                self.health
                    .record_failure(&sample.backend_id, admission, reason);
            }
        }
        self.analytics.record_attempt(sample);
    }

    /// Read-only snapshot of every backend's health, pool and timeout profile
    pub fn status(&self) -> DispatcherStatus {
        let backends: BTreeMap<String, BackendStatus> = self
            .router
            .backends()
            .iter()
            .map(|spec| {
                let status = BackendStatus {
                    enabled: spec.enabled,
                    health: self.health.snapshot(&spec.id),
                    pool: self.multiplexer.pool_status(&spec.id),
                    timeout: self.calibrator.profile(&spec.id),
                    ledger: self.ledger.stats(&spec.id),
                };
                (spec.id.clone(), status)
            })
            .collect();
        DispatcherStatus {
            total_members: backends
                .values()
                .filter_map(|b| b.pool.as_ref())
                .map(|p| p.total_members)
                .sum(),
            backends,
        }
    }

    pub fn analytics(&self) -> AnalyticsReport {
        self.analytics.report(self.multiplexer.analytics())
    }

    /// Administrative failure injection; returns the members left in rotation
    pub fn force_failover(
        &self,
        backend_id: &str,
        member_id: &str,
        reason: &str,
    ) -> Result<Vec<String>, DispatchError> {
        tracing::info!(backend = %backend_id, member = %member_id, reason = %reason, "Forced failover requested");
        self.multiplexer.force_failover(backend_id, member_id, reason)
    }

    pub fn restore_member(&self, backend_id: &str, member_id: &str) -> Result<(), DispatchError> {
        self.multiplexer.restore_member(backend_id, member_id)
    }

    /// Grow a backend's pool, bounded by `pool.max_servers`
    pub fn register_member(&self, backend_id: &str, config: MemberConfig) -> Result<(), DispatchError> {
        self.multiplexer.register_member(backend_id, config)
    }

    /// Drop a member for good; dropping below `pool.min_servers` is logged
    pub fn remove_member(&self, backend_id: &str, member_id: &str) -> Result<FailoverEvent, DispatchError> {
        self.multiplexer.remove_member(backend_id, member_id)
    }

    /// Actively probe every backend whose breaker would admit a recovery
    /// probe, until `shutdown` is cancelled
    pub async fn run_health_probes(&self, shutdown: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.health_probe_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.config.health_probe_interval_secs,
            "Health probe loop started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Health probe loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.probe_recovering().await;
                }
            }
        }
    }

    /// Run one probe round; returns `(backend, healthy)` for each backend probed
    pub async fn probe_recovering(&self) -> Vec<(String, bool)> {
        let admitted: Vec<String> = self
            .router
            .backends()
            .iter()
            .filter(|spec| {
                spec.enabled && self.health.routing_view(&spec.id) == RoutingView::ProbeEligible
            })
            .filter(|spec| matches!(self.health.try_acquire(&spec.id), Ok(Admission::Probe)))
            .map(|spec| spec.id.clone())
            .collect();

        // Probes run concurrently; each one holds its backend's single probe slot.
        let outcomes = join_all(admitted.iter().map(|id| self.probe_backend(id))).await;
        admitted.into_iter().zip(outcomes).collect()
    }

    async fn probe_backend(&self, backend_id: &str) -> bool {
        let member = self.multiplexer.members(backend_id).ok().and_then(|members| {
            members
                .into_iter()
                .find(|m| !m.health().is_manually_excluded())
        });
        let (Some(member), Some(client)) = (member, self.clients.get(backend_id)) else {
            self.health
                .record_failure(backend_id, Admission::Probe, "no pool member to probe");
            return false;
        };

        let timeout = Duration::from_millis(self.config.health_probe_timeout_ms);
        let result = with_timeout(timeout, async {
            let probe = client.probe(&member).await;
            if probe.healthy {
                Ok(probe)
            } else {
                Err(probe)
            }
        })
        .await;

        match result {
            Ok(probe) => {
                if member.is_excluded() {
                    member.health().readmit();
                }
                self.health.record_success(backend_id, Admission::Probe);
                tracing::info!(
                    backend = %backend_id,
                    member = %member.id(),
                    latency_ms = probe.latency_ms,
                    "Health probe succeeded"
                );
                true
            }
            Err(err) => {
                let reason = match err {
                    TimeoutError::Timeout(after) => format!("probe timed out after {:?}", after),
                    TimeoutError::Inner(probe) => probe
                        .detail
                        .unwrap_or_else(|| "probe reported unhealthy".to_string()),
                };
                self.health
                    .record_failure(backend_id, Admission::Probe, &reason);
                tracing::warn!(
                    backend = %backend_id,
                    member = %member.id(),
                    reason = %reason,
                    "Health probe failed"
                );
                false
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendResponse, ProbeResult};
    use crate::error::BackendError;
    use crate::services::backend_pool::{LoadBalanceStrategy, PoolMember};
    use crate::services::health::HealthState;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Succeed(u64),
        Fail,
        Hang,
    }

    /// Backend that plays a script of steps, then repeats the fallback step
    #[derive(Debug)]
    struct ScriptedBackend {
        script: Mutex<VecDeque<Step>>,
        fallback: Step,
        calls: AtomicUsize,
        probe_healthy: AtomicBool,
    }

    impl ScriptedBackend {
        fn new(fallback: Step) -> Arc<Self> {
            Self::scripted(vec![], fallback)
        }

        fn scripted(script: Vec<Step>, fallback: Step) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
                probe_healthy: AtomicBool::new(true),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn execute(
            &self,
            member: &PoolMember,
            _payload: &serde_json::Value,
            _deadline: &Deadline,
        ) -> Result<BackendResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
            match step {
                Step::Succeed(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(BackendResponse::new(json!({ "served_by": member.id() })))
                }
                Step::Fail => Err(BackendError::Status {
                    status: 500,
                    message: "scripted failure".to_string(),
                }),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(BackendResponse::new(json!({})))
                }
            }
        }

        async fn probe(&self, _member: &PoolMember) -> ProbeResult {
            if self.probe_healthy.load(Ordering::SeqCst) {
                ProbeResult::healthy(1)
            } else {
                ProbeResult::unhealthy(1, "scripted probe failure")
            }
        }
    }

    fn members(backend: &str, n: usize) -> Vec<MemberConfig> {
        (1..=n)
            .map(|i| MemberConfig::new(format!("{}-{}", backend, i), format!("mem://{}/{}", backend, i)))
            .collect()
    }

    /// Short deadlines so hanging calls time out quickly
    fn fast_calibrator() -> CalibratorConfig {
        CalibratorConfig::default().with_bounds(20, 60)
    }

    fn two_backends(a: Arc<ScriptedBackend>, b: Arc<ScriptedBackend>) -> DispatcherBuilder {
        Dispatcher::builder()
            .calibrator(fast_calibrator())
            .backend(BackendSpec::new("a", 1.0), a, members("a", 2))
            .backend(BackendSpec::new("b", 2.0), b, members("b", 2))
    }

    fn request() -> DispatchRequest {
        DispatchRequest::new(json!({"prompt": "hello"}))
    }

    #[tokio::test]
    async fn test_dispatch_prefers_best_ranked_backend() {
        let a = ScriptedBackend::new(Step::Succeed(0));
        let b = ScriptedBackend::new(Step::Succeed(0));
        let dispatcher = two_backends(a.clone(), b.clone()).build().unwrap();

        let outcome = dispatcher.dispatch(request().with_id("req-1")).await.unwrap();
        assert_eq!(outcome.request_id, "req-1");
        assert_eq!(outcome.backend_id, "a");
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.response["served_by"], outcome.member_id);
        assert_eq!(
            outcome.path,
            vec![
                DispatchState::Pending,
                DispatchState::Selecting,
                DispatchState::Dispatched,
                DispatchState::Succeeded
            ]
        );
        assert_eq!(b.calls(), 0);

        let stats = dispatcher.ledger().stats("a");
        assert_eq!(stats.successes, 1);
        let status = dispatcher.status();
        assert_eq!(status.backends["a"].pool.as_ref().unwrap().active_connections, 0);
    }

    #[tokio::test]
    async fn test_failure_falls_through_to_next_candidate() {
        let a = ScriptedBackend::new(Step::Fail);
        let b = ScriptedBackend::new(Step::Succeed(0));
        let dispatcher = two_backends(a.clone(), b).build().unwrap();

        let outcome = dispatcher.dispatch(request()).await.unwrap();
        assert_eq!(outcome.backend_id, "b");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].backend_id, "a");
        assert!(matches!(outcome.skipped[0].reason, ExclusionReason::Failed { .. }));
        assert_eq!(
            outcome.path,
            vec![
                DispatchState::Pending,
                DispatchState::Selecting,
                DispatchState::Dispatched,
                DispatchState::Selecting,
                DispatchState::Dispatched,
                DispatchState::Succeeded
            ]
        );

        assert_eq!(dispatcher.health().state("a"), HealthState::Degraded);
        assert_eq!(dispatcher.ledger().stats("a").failures, 1);
        let report = dispatcher.analytics();
        assert_eq!(report.dispatches.succeeded, 1);
        assert_eq!(report.dispatches.fallthroughs, 1);
        assert_eq!(report.per_backend_utilization["a"].failures, 1);
        assert_eq!(report.per_backend_utilization["b"].traffic_share, 0.5);
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_and_falls_through() {
        let a = ScriptedBackend::new(Step::Hang);
        let b = ScriptedBackend::new(Step::Succeed(0));
        let dispatcher = two_backends(a, b).build().unwrap();

        let started = Instant::now();
        let outcome = dispatcher.dispatch(request()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.backend_id, "b");
        assert_eq!(
            outcome.skipped[0].reason,
            ExclusionReason::TimedOut { after_ms: 60 }
        );

        let stats = dispatcher.ledger().stats("a");
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.successes, 0);
        // slot released even though the call never returned
        assert_eq!(
            dispatcher.status().backends["a"].pool.as_ref().unwrap().active_connections,
            0
        );
    }

    #[tokio::test]
    async fn test_timed_out_when_attempts_run_out() {
        let a = ScriptedBackend::new(Step::Hang);
        let b = ScriptedBackend::new(Step::Succeed(0));
        let dispatcher = two_backends(a, b.clone())
            .dispatch(DispatchConfig::default().with_max_attempts(1))
            .build()
            .unwrap();

        match dispatcher.dispatch(request()).await {
            Err(DispatchError::Timeout { backend, after }) => {
                assert_eq!(backend, "a");
                assert_eq!(after, Duration::from_millis(60));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(b.calls(), 0);
        assert_eq!(dispatcher.analytics().dispatches.timed_out, 1);
    }

    #[tokio::test]
    async fn test_all_backends_exhausted_aggregates_reasons() {
        let a = ScriptedBackend::new(Step::Fail);
        let b = ScriptedBackend::new(Step::Fail);
        let dispatcher = two_backends(a, b).build().unwrap();

        match dispatcher.dispatch(request()).await {
            Err(DispatchError::AllBackendsExhausted { reasons }) => {
                let ids: Vec<&str> = reasons.iter().map(|(id, _)| id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
                assert!(reasons
                    .iter()
                    .all(|(_, r)| matches!(r, ExclusionReason::Failed { .. })));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(dispatcher.analytics().dispatches.failed, 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_skips_remaining_candidates() {
        let dispatcher = Dispatcher::builder()
            .dispatch(DispatchConfig::default().with_max_attempts(1))
            .backend(BackendSpec::new("a", 1.0), ScriptedBackend::new(Step::Fail), members("a", 1))
            .backend(BackendSpec::new("b", 2.0), ScriptedBackend::new(Step::Succeed(0)), members("b", 1))
            .build()
            .unwrap();

        match dispatcher.dispatch(request()).await {
            Err(DispatchError::AllBackendsExhausted { reasons }) => {
                assert_eq!(reasons[1], ("b".to_string(), ExclusionReason::AttemptsExhausted));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_backend_circuit_open_is_surfaced() {
        let dispatcher = Dispatcher::builder()
            .circuit_breaker(CircuitBreakerConfig::default().with_fail_threshold(2))
            .backend(BackendSpec::new("only", 1.0), ScriptedBackend::new(Step::Fail), members("only", 1))
            .build()
            .unwrap();

        for _ in 0..2 {
            assert!(matches!(
                dispatcher.dispatch(request()).await,
                Err(DispatchError::AllBackendsExhausted { .. })
            ));
        }
        assert_eq!(dispatcher.health().state("only"), HealthState::CircuitOpen);
        assert!(matches!(
            dispatcher.dispatch(request()).await,
            Err(DispatchError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_half_open_admits_a_single_probe() {
        let backend = ScriptedBackend::scripted(vec![Step::Fail], Step::Succeed(50));
        let dispatcher = Dispatcher::builder()
            .circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_fail_threshold(1)
                    .with_cooldown(Duration::from_millis(20), Duration::from_secs(1)),
            )
            .calibrator(CalibratorConfig::default().with_bounds(1_000, 5_000))
            .backend(BackendSpec::new("only", 1.0), backend.clone(), members("only", 2))
            .build()
            .unwrap();

        assert!(dispatcher.dispatch(request()).await.is_err());
        assert_eq!(dispatcher.health().state("only"), HealthState::CircuitOpen);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let (first, second) = tokio::join!(
            dispatcher.dispatch(request()),
            dispatcher.dispatch(request())
        );

        assert!(first.is_ok());
        match second {
            Err(DispatchError::AllBackendsExhausted { reasons }) => {
                assert_eq!(reasons, vec![("only".to_string(), ExclusionReason::ProbeInFlight)]);
            }
            other => panic!("expected probe refusal, got {:?}", other),
        }
        assert_eq!(backend.calls(), 2);
        assert_eq!(dispatcher.health().state("only"), HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_backpressure_falls_through_to_next_backend() {
        let a = ScriptedBackend::new(Step::Succeed(100));
        let b = ScriptedBackend::new(Step::Succeed(0));
        let dispatcher = two_backends(a, b)
            .calibrator(CalibratorConfig::default().with_bounds(1_000, 5_000))
            .pool(PoolConfig::default().with_max_connections(1))
            .build()
            .unwrap();

        let (first, second) = tokio::join!(
            dispatcher.dispatch(request()),
            dispatcher.dispatch(request())
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.backend_id, "a");
        assert_eq!(second.backend_id, "b");
        assert_eq!(second.attempts, 1);
        assert!(matches!(
            second.skipped[0].reason,
            ExclusionReason::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_force_failover_only_member_excludes_backend() {
        let dispatcher = Dispatcher::builder()
            .backend(BackendSpec::new("a", 1.0), ScriptedBackend::new(Step::Succeed(0)), members("a", 1))
            .backend(BackendSpec::new("b", 2.0), ScriptedBackend::new(Step::Succeed(0)), members("b", 1))
            .build()
            .unwrap();

        let active = dispatcher.force_failover("a", "a-1", "drill").unwrap();
        assert!(active.is_empty());
        assert!(matches!(
            dispatcher.multiplexer().pick("a"),
            Err(DispatchError::BackendUnavailable { .. })
        ));

        let outcome = dispatcher.dispatch(request()).await.unwrap();
        assert_eq!(outcome.backend_id, "b");
        assert!(outcome.skipped.is_empty());
        assert_eq!(
            dispatcher.status().backends["a"].health.state,
            HealthState::CircuitOpen
        );
        assert_eq!(dispatcher.analytics().failover_history.len(), 1);

        assert!(matches!(
            dispatcher.force_failover("a", "ghost", "drill"),
            Err(DispatchError::UnknownTarget { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_is_idempotent() {
        let dispatcher = two_backends(
            ScriptedBackend::new(Step::Succeed(0)),
            ScriptedBackend::new(Step::Succeed(0)),
        )
        .build()
        .unwrap();
        dispatcher.dispatch(request()).await.unwrap();

        let first = dispatcher.status();
        let second = dispatcher.status();
        assert_eq!(first, second);
        assert_eq!(first.total_members, 4);
        assert!(first.backends["b"].timeout.cold_start);
    }

    #[tokio::test]
    async fn test_probe_round_recovers_backend() {
        let backend = ScriptedBackend::new(Step::Fail);
        let dispatcher = Dispatcher::builder()
            .circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_fail_threshold(1)
                    .with_cooldown(Duration::from_millis(20), Duration::from_secs(1)),
            )
            .backend(BackendSpec::new("a", 1.0), backend.clone(), members("a", 1))
            .build()
            .unwrap();

        assert!(dispatcher.dispatch(request()).await.is_err());
        assert!(dispatcher.probe_recovering().await.is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        backend.probe_healthy.store(false, Ordering::SeqCst);
        assert_eq!(dispatcher.probe_recovering().await, vec![("a".to_string(), false)]);
        let snapshot = dispatcher.health().snapshot("a");
        assert_eq!(snapshot.state, HealthState::CircuitOpen);
        assert_eq!(snapshot.cooldown_ms, 40);

        tokio::time::sleep(Duration::from_millis(60)).await;
        backend.probe_healthy.store(true, Ordering::SeqCst);
        assert_eq!(dispatcher.probe_recovering().await, vec![("a".to_string(), true)]);
        assert_eq!(dispatcher.health().state("a"), HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_probe_loop_stops_on_shutdown() {
        let dispatcher = Arc::new(
            Dispatcher::builder()
                .backend(BackendSpec::new("a", 1.0), ScriptedBackend::new(Step::Succeed(0)), members("a", 1))
                .build()
                .unwrap(),
        );
        let shutdown = CancellationToken::new();
        let handle = {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run_health_probes(shutdown).await })
        };
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_builder_rejects_invalid_configuration() {
        assert!(matches!(
            Dispatcher::builder().build(),
            Err(DispatchError::Configuration(_))
        ));
        let invalid = [
            Dispatcher::builder()
                .dispatch(DispatchConfig::default().with_max_attempts(0))
                .backend(BackendSpec::new("a", 1.0), ScriptedBackend::new(Step::Fail), members("a", 1)),
            Dispatcher::builder()
                .routing(RoutingWeights::new(0.5, 0.5, 0.5))
                .backend(BackendSpec::new("a", 1.0), ScriptedBackend::new(Step::Fail), members("a", 1)),
            Dispatcher::builder()
                .pool(PoolConfig::default().with_server_bounds(2, 4))
                .backend(BackendSpec::new("a", 1.0), ScriptedBackend::new(Step::Fail), members("a", 1)),
        ];
        for builder in invalid {
            assert!(matches!(builder.build(), Err(DispatchError::Configuration(_))));
        }
    }

    #[tokio::test]
    async fn test_per_backend_strategy_override() {
        let dispatcher = Dispatcher::builder()
            .backend_with_pool(
                BackendSpec::new("a", 1.0),
                ScriptedBackend::new(Step::Succeed(0)),
                PoolSpec::new("ignored", members("a", 2))
                    .with_strategy(LoadBalanceStrategy::LeastConnections),
            )
            .build()
            .unwrap();
        let status = dispatcher.status();
        assert_eq!(
            status.backends["a"].pool.as_ref().unwrap().strategy,
            LoadBalanceStrategy::LeastConnections
        );
    }
}
