//! Member Pool Implementation
//!
//! This module provides `MemberPool`, the set of interchangeable worker
//! servers behind one backend, with strategy-driven selection, per-member
//! slot budgets and failover.

use super::member::{MemberConfig, MemberLease, PoolMember};
use super::strategy::{
    weighted_index, AdaptiveState, LoadBalanceStrategy, RoundRobinState, StrategyCounters,
    StrategyEffectiveness,
};
use crate::error::DispatchError;
use crate::models::OutcomeSample;
use chrono::{DateTime, Utc};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Configuration for pool behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Default load balancing strategy (backends may override)
    pub strategy: LoadBalanceStrategy,
    pub min_servers: usize,
    pub max_servers: usize,
    /// Aggregate active connection ceiling per backend
    pub max_connections_per_backend: u32,
    /// Exploration probability for the adaptive strategy
    pub epsilon: f64,
    /// Completions per arm the adaptive strategy remembers
    pub adaptive_window: usize,
    /// Latency charged to an adaptive arm for a failed completion
    pub adaptive_failure_penalty_ms: u64,
    /// Weight of a new observation in a member's smoothed latency
    pub latency_smoothing: f64,
    /// Consecutive failures before a member is excluded automatically
    pub member_failure_threshold: u32,
    /// Seconds before an automatically excluded member is retried
    pub member_retry_after_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalanceStrategy::RoundRobin,
            min_servers: 1,
            max_servers: 32,
            max_connections_per_backend: 64,
            epsilon: 0.1,
            adaptive_window: 50,
            adaptive_failure_penalty_ms: 30_000,
            latency_smoothing: 0.3,
            member_failure_threshold: 3,
            member_retry_after_secs: 300, // 5 minutes
        }
    }
}

impl PoolConfig {
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_server_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_servers = min;
        self.max_servers = max;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections_per_backend = max;
        self
    }

    pub fn with_max_failures(mut self, max: u32) -> Self {
        self.member_failure_threshold = max;
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.member_retry_after_secs = secs;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.min_servers > self.max_servers {
            return Err(DispatchError::config("pool.min_servers must be <= pool.max_servers"));
        }
        if self.max_servers == 0 {
            return Err(DispatchError::config("pool.max_servers must be > 0"));
        }
        if self.max_connections_per_backend == 0 {
            return Err(DispatchError::config(
                "pool.max_connections_per_backend must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(DispatchError::config("pool.epsilon must be within [0, 1]"));
        }
        if self.adaptive_window == 0 {
            return Err(DispatchError::config("pool.adaptive_window must be > 0"));
        }
        if !(self.latency_smoothing > 0.0 && self.latency_smoothing <= 1.0) {
            return Err(DispatchError::config(
                "pool.latency_smoothing must be within (0, 1]",
            ));
        }
        if self.member_failure_threshold == 0 {
            return Err(DispatchError::config(
                "pool.member_failure_threshold must be > 0",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Failover Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailoverReason {
    /// Operator or test-triggered failover
    Manual { detail: String },
    /// Member hit the consecutive failure threshold
    ConsecutiveFailures { count: u32 },
    /// Member deregistered by the server lifecycle manager
    Removed,
}

impl std::fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual { detail } => write!(f, "manual: {}", detail),
            Self::ConsecutiveFailures { count } => write!(f, "{} consecutive failures", count),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Record of a member being taken out of rotation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverEvent {
    pub backend_id: String,
    pub from_member_id: String,
    /// Least-loaded remaining member, if any remain
    pub to_member_id: Option<String>,
    pub reason: FailoverReason,
    /// Slot budget handed back to the remaining members
    pub redistributed_slots: u32,
    pub remaining_members: usize,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Pool Status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberLoad {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub active_connections: u32,
    pub last_latency_ms: Option<u64>,
    pub smoothed_latency_ms: Option<f64>,
    pub completed: u64,
    pub failed: u64,
    pub excluded: bool,
}

/// Snapshot of a pool's membership and load
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub backend_id: String,
    pub strategy: LoadBalanceStrategy,
    pub total_members: usize,
    pub available_members: usize,
    pub active_connections: u32,
    pub connection_ceiling: u32,
    pub per_member_load: Vec<MemberLoad>,
}

impl PoolStatus {
    /// Check if the pool can take traffic (at least one member available)
    pub fn is_healthy(&self) -> bool {
        self.available_members > 0
    }
}

// ============================================================================
// Member Pool
// ============================================================================

/// The worker servers behind one backend
#[derive(Debug)]
pub struct MemberPool {
    backend_id: String,
    strategy: LoadBalanceStrategy,
    config: PoolConfig,
    /// Write-locked only while membership changes
    members: RwLock<Vec<Arc<PoolMember>>>,
    /// Slots held by live leases, bounded by `max_connections_per_backend`
    in_flight: Arc<AtomicU32>,
    rr_state: RoundRobinState,
    tie_state: RoundRobinState,
    adaptive: Mutex<AdaptiveState>,
    effectiveness: HashMap<LoadBalanceStrategy, StrategyCounters>,
}

impl MemberPool {
    /// Create a pool, enforcing the configured server bounds
    pub fn new(
        backend_id: impl Into<String>,
        members: Vec<PoolMember>,
        strategy: LoadBalanceStrategy,
        config: PoolConfig,
    ) -> Result<Self, DispatchError> {
        let backend_id = backend_id.into();
        if members.len() < config.min_servers || members.len() > config.max_servers {
            return Err(DispatchError::config(format!(
                "backend '{}' has {} pool members, expected {}..={}",
                backend_id,
                members.len(),
                config.min_servers,
                config.max_servers
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for member in &members {
            if !seen.insert(member.id().to_string()) {
                return Err(DispatchError::config(format!(
                    "backend '{}' has duplicate pool member '{}'",
                    backend_id,
                    member.id()
                )));
            }
        }

        let effectiveness = [
            LoadBalanceStrategy::RoundRobin,
            LoadBalanceStrategy::LeastConnections,
            LoadBalanceStrategy::WeightedResponseTime,
        ]
        .into_iter()
        .map(|s| (s, StrategyCounters::default()))
        .collect();

        Ok(Self {
            adaptive: Mutex::new(AdaptiveState::new(config.adaptive_window, config.epsilon)),
            backend_id,
            strategy,
            members: RwLock::new(members.into_iter().map(Arc::new).collect()),
            in_flight: Arc::new(AtomicU32::new(0)),
            rr_state: RoundRobinState::new(),
            tie_state: RoundRobinState::new(),
            effectiveness,
            config,
        })
    }

    /// Create a pool from member configuration
    pub fn from_configs(
        backend_id: &str,
        members: Vec<MemberConfig>,
        strategy: LoadBalanceStrategy,
        config: PoolConfig,
    ) -> Result<Self, DispatchError> {
        let members = members
            .into_iter()
            .map(|m| PoolMember::from_config(backend_id, m))
            .collect();
        Self::new(backend_id, members, strategy, config)
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Current members, including excluded ones
    pub fn members(&self) -> Vec<Arc<PoolMember>> {
        self.read().clone()
    }

    pub fn available_count(&self) -> usize {
        self.read().iter().filter(|m| !m.is_excluded()).count()
    }

    /// Claim a connection slot on the member the strategy selects
    pub fn pick(&self) -> Result<MemberLease, DispatchError> {
        let members = self.read();
        self.readmit_recovered(&members);

        let available: Vec<&Arc<PoolMember>> =
            members.iter().filter(|m| !m.is_excluded()).collect();
        if available.is_empty() {
            return Err(self.unavailable("no healthy pool members"));
        }

        let ceiling = self.config.max_connections_per_backend;
        let budget = ceiling.div_ceil(available.len() as u32);
        let eligible: Vec<&Arc<PoolMember>> = available
            .into_iter()
            .filter(|m| m.active_connections() < budget)
            .collect();
        if eligible.is_empty() {
            return Err(self.unavailable("every member is at its slot budget"));
        }

        // Reserve against the pool-wide ceiling before touching a member slot
        if let Err(held) = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                (held < ceiling).then_some(held + 1)
            })
        {
            return Err(self.unavailable(&format!(
                "connection ceiling reached ({}/{})",
                held, ceiling
            )));
        }

        let strategy = match self.strategy {
            LoadBalanceStrategy::Adaptive => {
                let mut adaptive = match self.adaptive.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                adaptive.choose(&mut thread_rng())
            }
            other => other,
        };

        let idx = self.select(strategy, &eligible);
        let lease = MemberLease::claim(eligible[idx].clone(), budget, strategy).or_else(|| {
            // lost a race for the chosen member's last slot
            eligible
                .iter()
                .find_map(|m| MemberLease::claim((*m).clone(), budget, strategy))
        });

        match lease {
            Some(lease) => {
                let lease = lease.holding_pool_slot(self.in_flight.clone());
                if let Some(counters) = self.effectiveness.get(&strategy) {
                    counters.record_selection();
                }
                tracing::trace!(
                    backend = %self.backend_id,
                    member = %lease.member_id(),
                    strategy = %strategy,
                    "Picked pool member"
                );
                Ok(lease)
            }
            None => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(self.unavailable("every member is at its slot budget"))
            }
        }
    }

    fn select(&self, strategy: LoadBalanceStrategy, eligible: &[&Arc<PoolMember>]) -> usize {
        match strategy {
            LoadBalanceStrategy::RoundRobin => self.rr_state.next(eligible.len()),
            LoadBalanceStrategy::LeastConnections | LoadBalanceStrategy::Adaptive => {
                let least = eligible
                    .iter()
                    .map(|m| m.active_connections())
                    .min()
                    .unwrap_or(0);
                let tied: Vec<usize> = eligible
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.active_connections() == least)
                    .map(|(i, _)| i)
                    .collect();
                if tied.is_empty() {
                    0
                } else {
                    tied[self.tie_state.next(tied.len())]
                }
            }
            LoadBalanceStrategy::WeightedResponseTime => {
                let known: Vec<f64> = eligible
                    .iter()
                    .filter_map(|m| m.smoothed_latency_ms())
                    .collect();
                // members without history are assumed average
                let fallback = if known.is_empty() {
                    1.0
                } else {
                    known.iter().sum::<f64>() / known.len() as f64
                };
                let weights: Vec<f64> = eligible
                    .iter()
                    .map(|m| {
                        let latency = m.smoothed_latency_ms().unwrap_or(fallback).max(1.0);
                        m.weight().max(1) as f64 / latency
                    })
                    .collect();
                weighted_index(&weights, &mut thread_rng())
            }
        }
    }

    /// Record a finished call and release its slot.
    ///
    /// Returns a failover event when the member crossed the consecutive
    /// failure threshold and was excluded.
    pub fn record_completion(
        &self,
        lease: MemberLease,
        sample: &OutcomeSample,
    ) -> Option<FailoverEvent> {
        let member = lease.member().clone();
        let strategy = lease.strategy();
        drop(lease);

        if sample.is_latency_representative() {
            member.record_latency(sample.latency_ms, self.config.latency_smoothing);
        }
        if self.strategy == LoadBalanceStrategy::Adaptive {
            let observed = if sample.success {
                sample.latency_ms
            } else {
                sample.latency_ms.max(self.config.adaptive_failure_penalty_ms)
            };
            let mut adaptive = match self.adaptive.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            adaptive.record(strategy, observed);
        }
        if let Some(counters) = self.effectiveness.get(&strategy) {
            counters.record_completion(sample.success, sample.latency_ms);
        }

        let failures = member.record_outcome(sample.success);
        if !sample.success
            && failures >= self.config.member_failure_threshold
            && !member.is_excluded()
        {
            tracing::warn!(
                backend = %self.backend_id,
                member = %member.id(),
                failures,
                "Pool member excluded due to consecutive failures"
            );
            return self
                .exclude(
                    member.id(),
                    FailoverReason::ConsecutiveFailures { count: failures },
                )
                .ok()
                .and_then(|(event, _)| event);
        }
        None
    }

    /// Take a member out of rotation.
    ///
    /// Returns the failover event (None if the member was already excluded)
    /// and the ids of the members still in rotation.
    pub fn exclude(
        &self,
        member_id: &str,
        reason: FailoverReason,
    ) -> Result<(Option<FailoverEvent>, Vec<String>), DispatchError> {
        let members = self.write();
        let member = members
            .iter()
            .find(|m| m.id() == member_id)
            .ok_or_else(|| self.unknown_member(member_id))?;

        let manual = matches!(reason, FailoverReason::Manual { .. });
        let newly = member.health().exclude(manual);
        let remaining: Vec<&Arc<PoolMember>> =
            members.iter().filter(|m| !m.is_excluded()).collect();
        let active_ids = remaining.iter().map(|m| m.id().to_string()).collect();

        if !newly {
            return Ok((None, active_ids));
        }

        let redistributed_slots = if remaining.is_empty() {
            0
        } else {
            self.config
                .max_connections_per_backend
                .div_ceil(remaining.len() as u32 + 1)
        };
        let to_member_id = remaining
            .iter()
            .min_by_key(|m| m.active_connections())
            .map(|m| m.id().to_string());

        let event = FailoverEvent {
            backend_id: self.backend_id.clone(),
            from_member_id: member_id.to_string(),
            to_member_id,
            reason,
            redistributed_slots,
            remaining_members: remaining.len(),
            timestamp: Utc::now(),
        };

        tracing::info!(
            backend = %self.backend_id,
            member = %member_id,
            to = ?event.to_member_id,
            reason = %event.reason,
            remaining = event.remaining_members,
            "Pool member failed over"
        );

        if remaining.len() < self.config.min_servers {
            tracing::warn!(
                backend = %self.backend_id,
                remaining = remaining.len(),
                min_servers = self.config.min_servers,
                "Pool below minimum server count"
            );
        }

        Ok((Some(event), active_ids))
    }

    /// Put an excluded member back into rotation
    pub fn restore(&self, member_id: &str) -> Result<(), DispatchError> {
        let members = self.read();
        let member = members
            .iter()
            .find(|m| m.id() == member_id)
            .ok_or_else(|| self.unknown_member(member_id))?;
        member.health().readmit();
        tracing::info!(backend = %self.backend_id, member = %member_id, "Pool member restored");
        Ok(())
    }

    /// Add a member registered by the server lifecycle manager
    pub fn register(&self, config: MemberConfig) -> Result<(), DispatchError> {
        let mut members = self.write();
        if members.len() >= self.config.max_servers {
            return Err(DispatchError::config(format!(
                "backend '{}' already has the maximum of {} pool members",
                self.backend_id, self.config.max_servers
            )));
        }
        if members.iter().any(|m| m.id() == config.id) {
            return Err(DispatchError::config(format!(
                "backend '{}' already has pool member '{}'",
                self.backend_id, config.id
            )));
        }
        tracing::info!(backend = %self.backend_id, member = %config.id, "Pool member registered");
        members.push(Arc::new(PoolMember::from_config(&self.backend_id, config)));
        Ok(())
    }

    /// Drop a permanently failed member. In-flight leases keep the member
    /// alive until they complete.
    pub fn remove(&self, member_id: &str) -> Result<FailoverEvent, DispatchError> {
        let event = self.exclude(member_id, FailoverReason::Removed)?.0;
        let mut members = self.write();
        members.retain(|m| m.id() != member_id);
        let remaining = members.iter().filter(|m| !m.is_excluded()).count();
        Ok(event.unwrap_or_else(|| FailoverEvent {
            backend_id: self.backend_id.clone(),
            from_member_id: member_id.to_string(),
            to_member_id: None,
            reason: FailoverReason::Removed,
            redistributed_slots: 0,
            remaining_members: remaining,
            timestamp: Utc::now(),
        }))
    }

    pub fn status(&self) -> PoolStatus {
        let members = self.read();
        let per_member_load: Vec<MemberLoad> = members
            .iter()
            .map(|m| MemberLoad {
                id: m.id().to_string(),
                address: m.address().to_string(),
                weight: m.weight(),
                active_connections: m.active_connections(),
                last_latency_ms: m.last_latency_ms(),
                smoothed_latency_ms: m.smoothed_latency_ms(),
                completed: m.completed(),
                failed: m.failed(),
                excluded: m.is_excluded(),
            })
            .collect();
        PoolStatus {
            backend_id: self.backend_id.clone(),
            strategy: self.strategy,
            total_members: per_member_load.len(),
            available_members: per_member_load.iter().filter(|m| !m.excluded).count(),
            active_connections: per_member_load.iter().map(|m| m.active_connections).sum(),
            connection_ceiling: self.config.max_connections_per_backend,
            per_member_load,
        }
    }

    /// Effectiveness of every strategy that has placed requests in this pool
    pub fn effectiveness(&self) -> Vec<StrategyEffectiveness> {
        let mut stats: Vec<StrategyEffectiveness> = self
            .effectiveness
            .iter()
            .map(|(strategy, counters)| counters.snapshot(*strategy))
            .filter(|s| s.selections > 0 || s.completions > 0)
            .collect();
        stats.sort_by_key(|s| s.strategy);
        stats
    }

    fn readmit_recovered(&self, members: &[Arc<PoolMember>]) {
        let retry_after = Duration::from_secs(self.config.member_retry_after_secs);
        for member in members {
            if member.health().retry_due(retry_after) {
                member.health().readmit();
                tracing::info!(
                    backend = %self.backend_id,
                    member = %member.id(),
                    "Attempting to recover excluded pool member"
                );
            }
        }
    }

    fn unavailable(&self, reason: &str) -> DispatchError {
        DispatchError::BackendUnavailable {
            backend: self.backend_id.clone(),
            reason: reason.to_string(),
        }
    }

    fn unknown_member(&self, member_id: &str) -> DispatchError {
        DispatchError::UnknownTarget {
            backend: self.backend_id.clone(),
            member: Some(member_id.to_string()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<PoolMember>>> {
        match self.members.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<PoolMember>>> {
        match self.members.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
