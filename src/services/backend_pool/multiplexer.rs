//! Pool Multiplexer
//!
//! Holds one `MemberPool` per backend, keeps the failover history and
//! reports pool status and strategy effectiveness. When a backend loses its
//! last available member the multiplexer trips that backend's circuit so the
//! router stops ranking it.

use super::member::{MemberConfig, MemberLease, PoolMember};
use super::pool::{FailoverEvent, FailoverReason, MemberPool, PoolConfig, PoolStatus};
use super::strategy::{LoadBalanceStrategy, StrategyEffectiveness};
use crate::error::DispatchError;
use crate::models::OutcomeSample;
use crate::services::health::HealthMonitor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Failover events kept for analytics
pub const FAILOVER_HISTORY_LIMIT: usize = 1000;

const EMPTY_POOL_REASON: &str = "no healthy pool members";

/// Pool layout for one backend
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSpec {
    pub backend_id: String,
    /// Overrides `PoolConfig::strategy` for this backend
    #[serde(default)]
    pub strategy: Option<LoadBalanceStrategy>,
    pub members: Vec<MemberConfig>,
}

impl PoolSpec {
    pub fn new(backend_id: impl Into<String>, members: Vec<MemberConfig>) -> Self {
        Self {
            backend_id: backend_id.into(),
            strategy: None,
            members,
        }
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiplexerStatus {
    pub total_members: usize,
    pub pools: BTreeMap<String, PoolStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiplexerAnalytics {
    /// Oldest first
    pub failover_history: Vec<FailoverEvent>,
    pub strategy_effectiveness: BTreeMap<String, Vec<StrategyEffectiveness>>,
}

#[derive(Debug)]
pub struct Multiplexer {
    config: PoolConfig,
    pools: HashMap<String, Arc<MemberPool>>,
    health: Arc<HealthMonitor>,
    history: Mutex<VecDeque<FailoverEvent>>,
}

impl Multiplexer {
    /// Build every pool, failing on the first invalid layout
    pub fn initialize(
        specs: Vec<PoolSpec>,
        config: PoolConfig,
        health: Arc<HealthMonitor>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;

        let mut pools = HashMap::with_capacity(specs.len());
        for spec in specs {
            if pools.contains_key(&spec.backend_id) {
                return Err(DispatchError::config(format!(
                    "duplicate pool for backend '{}'",
                    spec.backend_id
                )));
            }
            let strategy = spec.strategy.unwrap_or(config.strategy);
            let pool =
                MemberPool::from_configs(&spec.backend_id, spec.members, strategy, config.clone())?;
            tracing::info!(
                backend = %spec.backend_id,
                members = pool.len(),
                strategy = %strategy,
                "Initialized backend pool"
            );
            health.register(&spec.backend_id);
            pools.insert(spec.backend_id, Arc::new(pool));
        }

        Ok(Self {
            config,
            pools,
            health,
            history: Mutex::new(VecDeque::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn has_pool(&self, backend_id: &str) -> bool {
        self.pools.contains_key(backend_id)
    }

    pub fn members(&self, backend_id: &str) -> Result<Vec<Arc<PoolMember>>, DispatchError> {
        Ok(self.pool(backend_id)?.members())
    }

    pub fn pick(&self, backend_id: &str) -> Result<MemberLease, DispatchError> {
        self.pool(backend_id)?.pick()
    }

    /// Release the lease and fold the outcome into the member's statistics
    pub fn record_completion(&self, lease: MemberLease, sample: &OutcomeSample) {
        let Some(pool) = self.pools.get(lease.backend_id()) else {
            return;
        };
        if let Some(event) = pool.record_completion(lease, sample) {
            self.after_failover(event);
        }
    }

    /// Exclude a member and return the members still in rotation
    pub fn force_failover(
        &self,
        backend_id: &str,
        member_id: &str,
        reason: &str,
    ) -> Result<Vec<String>, DispatchError> {
        let pool = self.pool(backend_id)?;
        let (event, active) = pool.exclude(
            member_id,
            FailoverReason::Manual {
                detail: reason.to_string(),
            },
        )?;
        if let Some(event) = event {
            self.after_failover(event);
        }
        Ok(active)
    }

    pub fn restore_member(&self, backend_id: &str, member_id: &str) -> Result<(), DispatchError> {
        self.pool(backend_id)?.restore(member_id)
    }

    pub fn register_member(
        &self,
        backend_id: &str,
        config: MemberConfig,
    ) -> Result<(), DispatchError> {
        self.pool(backend_id)?.register(config)
    }

    pub fn remove_member(
        &self,
        backend_id: &str,
        member_id: &str,
    ) -> Result<FailoverEvent, DispatchError> {
        let event = self.pool(backend_id)?.remove(member_id)?;
        self.after_failover(event.clone());
        Ok(event)
    }

    pub fn pool_status(&self, backend_id: &str) -> Option<PoolStatus> {
        self.pools.get(backend_id).map(|pool| pool.status())
    }

    pub fn status(&self) -> MultiplexerStatus {
        let pools: BTreeMap<String, PoolStatus> = self
            .pools
            .iter()
            .map(|(id, pool)| (id.clone(), pool.status()))
            .collect();
        MultiplexerStatus {
            total_members: pools.values().map(|p| p.total_members).sum(),
            pools,
        }
    }

    pub fn analytics(&self) -> MultiplexerAnalytics {
        MultiplexerAnalytics {
            failover_history: self.history().iter().cloned().collect(),
            strategy_effectiveness: self
                .pools
                .iter()
                .map(|(id, pool)| (id.clone(), pool.effectiveness()))
                .collect(),
        }
    }

    fn after_failover(&self, event: FailoverEvent) {
        if event.remaining_members == 0 {
            self.health.trip(&event.backend_id, EMPTY_POOL_REASON);
        }
        let mut history = self.history();
        if history.len() == FAILOVER_HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(event);
    }

    fn pool(&self, backend_id: &str) -> Result<&Arc<MemberPool>, DispatchError> {
        self.pools
            .get(backend_id)
            .ok_or_else(|| DispatchError::UnknownTarget {
                backend: backend_id.to_string(),
                member: None,
            })
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<FailoverEvent>> {
        match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExclusionReason;
    use crate::models::BackendSpec;
    use crate::services::health::{CircuitBreakerConfig, HealthState, RoutingView};
    use crate::services::ledger::{LedgerConfig, PerformanceLedger};
    use crate::services::router::{BackendRouter, RoutingWeights};
    use std::collections::BTreeSet;

    fn spec(backend: &str, n: usize) -> PoolSpec {
        PoolSpec::new(
            backend,
            (1..=n)
                .map(|i| {
                    MemberConfig::new(
                        format!("{}-{}", backend, i),
                        format!("http://{}:{}", backend, 9000 + i),
                    )
                })
                .collect(),
        )
    }

    fn multiplexer(specs: Vec<PoolSpec>) -> (Multiplexer, Arc<HealthMonitor>) {
        let health = Arc::new(HealthMonitor::new(CircuitBreakerConfig::default()));
        let mux = Multiplexer::initialize(specs, PoolConfig::default(), health.clone()).unwrap();
        (mux, health)
    }

    #[test]
    fn test_initialize_rejects_bad_layout() {
        let health = Arc::new(HealthMonitor::new(CircuitBreakerConfig::default()));
        let config = PoolConfig::default().with_server_bounds(2, 4);
        assert!(matches!(
            Multiplexer::initialize(vec![spec("a", 1)], config.clone(), health.clone()),
            Err(DispatchError::Configuration(_))
        ));
        assert!(matches!(
            Multiplexer::initialize(vec![spec("a", 2), spec("a", 2)], config, health),
            Err(DispatchError::Configuration(_))
        ));
    }

    #[test]
    fn test_per_backend_strategy_override() {
        let (mux, _) = multiplexer(vec![
            spec("a", 2),
            spec("b", 2).with_strategy(LoadBalanceStrategy::LeastConnections),
        ]);
        let status = mux.status();
        assert_eq!(status.total_members, 4);
        assert_eq!(status.pools["a"].strategy, LoadBalanceStrategy::RoundRobin);
        assert_eq!(status.pools["b"].strategy, LoadBalanceStrategy::LeastConnections);
    }

    #[test]
    fn test_scenario_c_least_connections_skips_loaded_member() {
        let (mux, _) = multiplexer(vec![
            spec("a", 3).with_strategy(LoadBalanceStrategy::LeastConnections)
        ]);
        let loaded = mux.members("a").unwrap()[0].clone();
        let held: Vec<MemberLease> = (0..2)
            .map(|_| {
                MemberLease::claim(loaded.clone(), 64, LoadBalanceStrategy::LeastConnections)
                    .unwrap()
            })
            .collect();
        assert_eq!(mux.pool_status("a").unwrap().per_member_load[0].active_connections, 2);

        for _ in 0..20 {
            let lease = mux.pick("a").unwrap();
            assert_ne!(lease.member_id(), "a-1");
        }
        drop(held);
    }

    #[test]
    fn test_force_failover_only_member_round_trip() {
        let health = Arc::new(HealthMonitor::new(CircuitBreakerConfig::default()));
        let ledger = Arc::new(PerformanceLedger::new(LedgerConfig::default()));
        let mux = Multiplexer::initialize(
            vec![spec("a", 1), spec("b", 1)],
            PoolConfig::default(),
            health.clone(),
        )
        .unwrap();
        let router = BackendRouter::new(
            RoutingWeights::default(),
            vec![Arc::new(BackendSpec::new("a", 1.0)), Arc::new(BackendSpec::new("b", 2.0))],
            health.clone(),
            ledger,
        )
        .unwrap();

        let active = mux.force_failover("a", "a-1", "maintenance").unwrap();
        assert!(active.is_empty());
        assert!(matches!(
            mux.pick("a"),
            Err(DispatchError::BackendUnavailable { .. })
        ));
        assert_eq!(health.state("a"), HealthState::CircuitOpen);

        let ranked = router.select(&BTreeSet::new()).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id(), "b");

        let history = mux.analytics().failover_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_member_id, "a-1");
        assert_eq!(history[0].to_member_id, None);
    }

    #[test]
    fn test_force_failover_unknown_targets() {
        let (mux, _) = multiplexer(vec![spec("a", 2)]);
        assert!(matches!(
            mux.force_failover("zzz", "a-1", "x"),
            Err(DispatchError::UnknownTarget { member: None, .. })
        ));
        assert!(matches!(
            mux.force_failover("a", "nope", "x"),
            Err(DispatchError::UnknownTarget { member: Some(_), .. })
        ));
    }

    #[test]
    fn test_failover_and_restore_keep_backend_routable() {
        let (mux, health) = multiplexer(vec![spec("a", 2)]);
        let active = mux.force_failover("a", "a-2", "drain").unwrap();
        assert_eq!(active, vec!["a-1"]);
        assert_eq!(health.state("a"), HealthState::Healthy);

        mux.restore_member("a", "a-2").unwrap();
        assert_eq!(mux.pool_status("a").unwrap().available_members, 2);
    }

    #[test]
    fn test_remove_last_member_trips_circuit() {
        let (mux, health) = multiplexer(vec![spec("a", 1)]);
        let event = mux.remove_member("a", "a-1").unwrap();
        assert_eq!(event.reason, FailoverReason::Removed);
        assert_eq!(health.state("a"), HealthState::CircuitOpen);
        assert_eq!(mux.status().total_members, 0);
        assert!(matches!(
            health.routing_view("a"),
            RoutingView::Excluded(ExclusionReason::CircuitOpen { .. })
        ));

        mux.register_member("a", MemberConfig::new("a-9", "http://a:9999")).unwrap();
        assert_eq!(mux.status().total_members, 1);
    }

    #[test]
    fn test_failover_history_is_bounded() {
        let (mux, _) = multiplexer(vec![spec("a", 2)]);
        for _ in 0..(FAILOVER_HISTORY_LIMIT + 5) {
            mux.force_failover("a", "a-2", "flap").unwrap();
            mux.restore_member("a", "a-2").unwrap();
        }
        assert_eq!(mux.analytics().failover_history.len(), FAILOVER_HISTORY_LIMIT);
    }

    #[test]
    fn test_status_is_idempotent() {
        let (mux, _) = multiplexer(vec![spec("a", 2), spec("b", 3)]);
        let lease = mux.pick("b").unwrap();
        mux.record_completion(lease, &OutcomeSample::success("b", 80));
        assert_eq!(mux.status(), mux.status());
        let analytics = mux.analytics();
        assert_eq!(analytics.strategy_effectiveness["b"][0].completions, 1);
        assert!(analytics.strategy_effectiveness["a"].is_empty());
    }
}
