//! Pool members and connection leases
//!
//! A `PoolMember` is one interchangeable worker server behind a backend.
//! Picking a member hands out a `MemberLease`, which holds one of the
//! member's connection slots until it is dropped.

use super::strategy::LoadBalanceStrategy;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ============================================================================
// Member Health
// ============================================================================

/// Exclusion and failure tracking for a member
#[derive(Debug)]
pub struct MemberHealth {
    excluded: AtomicBool,
    /// Set when an operator excluded the member; such members never auto-recover
    manual: AtomicBool,
    consecutive_failures: AtomicU32,
    excluded_at: Mutex<Option<Instant>>,
}

impl Default for MemberHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl MemberHealth {
    pub fn new() -> Self {
        Self {
            excluded: AtomicBool::new(false),
            manual: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            excluded_at: Mutex::new(None),
        }
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded.load(Ordering::SeqCst)
    }

    pub fn is_manually_excluded(&self) -> bool {
        self.is_excluded() && self.manual.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Returns the new consecutive failure count
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Returns false if the member was already excluded
    pub fn exclude(&self, manual: bool) -> bool {
        if manual {
            self.manual.store(true, Ordering::SeqCst);
        }
        let newly = !self.excluded.swap(true, Ordering::SeqCst);
        if newly {
            if let Ok(mut at) = self.excluded_at.lock() {
                *at = Some(Instant::now());
            }
        }
        newly
    }

    pub fn readmit(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.manual.store(false, Ordering::SeqCst);
        self.excluded.store(false, Ordering::SeqCst);
        if let Ok(mut at) = self.excluded_at.lock() {
            *at = None;
        }
    }

    /// Whether an automatically excluded member has sat out long enough
    pub fn retry_due(&self, retry_after: Duration) -> bool {
        if !self.is_excluded() || self.manual.load(Ordering::SeqCst) {
            return false;
        }
        match self.excluded_at.lock() {
            Ok(at) => at.map(|t| t.elapsed() >= retry_after).unwrap_or(true),
            Err(_) => false,
        }
    }
}

// ============================================================================
// Pool Member
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct LatencyTrack {
    last_ms: Option<u64>,
    smoothed_ms: Option<f64>,
}

/// One worker server behind a backend
#[derive(Debug)]
pub struct PoolMember {
    id: String,
    backend_id: String,
    address: String,
    weight: u32,
    active_connections: AtomicU32,
    latency: Mutex<LatencyTrack>,
    completed: AtomicU64,
    failed: AtomicU64,
    health: MemberHealth,
}

impl PoolMember {
    pub fn new(
        id: impl Into<String>,
        backend_id: impl Into<String>,
        address: impl Into<String>,
        weight: u32,
    ) -> Self {
        Self {
            id: id.into(),
            backend_id: backend_id.into(),
            address: address.into(),
            weight,
            active_connections: AtomicU32::new(0),
            latency: Mutex::new(LatencyTrack::default()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            health: MemberHealth::new(),
        }
    }

    pub fn from_config(backend_id: &str, config: MemberConfig) -> Self {
        let member = Self::new(config.id, backend_id, config.address, config.weight);
        if config.enabled == Some(false) {
            member.health.exclude(true);
        }
        member
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn health(&self) -> &MemberHealth {
        &self.health
    }

    pub fn is_excluded(&self) -> bool {
        self.health.is_excluded()
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn last_latency_ms(&self) -> Option<u64> {
        self.latency.lock().ok().and_then(|l| l.last_ms)
    }

    pub fn smoothed_latency_ms(&self) -> Option<f64> {
        self.latency.lock().ok().and_then(|l| l.smoothed_ms)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Fold a latency observation into the exponentially smoothed average
    pub fn record_latency(&self, latency_ms: u64, smoothing: f64) {
        if let Ok(mut track) = self.latency.lock() {
            track.last_ms = Some(latency_ms);
            let observed = latency_ms as f64;
            track.smoothed_ms = Some(match track.smoothed_ms {
                Some(prev) => prev + smoothing * (observed - prev),
                None => observed,
            });
        }
    }

    pub(crate) fn record_outcome(&self, success: bool) -> u32 {
        self.completed.fetch_add(1, Ordering::SeqCst);
        if success {
            self.health.record_success();
            0
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
            self.health.record_failure()
        }
    }

    /// Claim a connection slot if fewer than `budget` are in use
    fn try_claim(&self, budget: u32) -> bool {
        self.active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < budget).then_some(active + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                Some(active.saturating_sub(1))
            });
    }
}

// ============================================================================
// Member Lease
// ============================================================================

/// A claimed connection slot on a pool member; released on drop
#[derive(Debug)]
pub struct MemberLease {
    member: Arc<PoolMember>,
    strategy: LoadBalanceStrategy,
    pool_slot: Option<Arc<AtomicU32>>,
}

impl MemberLease {
    pub(crate) fn claim(
        member: Arc<PoolMember>,
        budget: u32,
        strategy: LoadBalanceStrategy,
    ) -> Option<Self> {
        if member.try_claim(budget) {
            Some(Self {
                member,
                strategy,
                pool_slot: None,
            })
        } else {
            None
        }
    }

    /// Tie an already reserved pool-wide slot to this lease
    pub(crate) fn holding_pool_slot(mut self, slots: Arc<AtomicU32>) -> Self {
        self.pool_slot = Some(slots);
        self
    }

    pub fn member(&self) -> &Arc<PoolMember> {
        &self.member
    }

    pub fn member_id(&self) -> &str {
        self.member.id()
    }

    pub fn backend_id(&self) -> &str {
        self.member.backend_id()
    }

    /// The strategy that selected this member
    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }
}

impl Drop for MemberLease {
    fn drop(&mut self) {
        self.member.release();
        if let Some(slots) = self.pool_slot.take() {
            let _ = slots.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                Some(held.saturating_sub(1))
            });
        }
    }
}

// ============================================================================
// Configuration Structures (for deserialization)
// ============================================================================

/// Configuration for a pool member
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemberConfig {
    pub id: String,
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl MemberConfig {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight: default_weight(),
            enabled: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

fn default_weight() -> u32 {
    1
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_claims_and_releases_slot() {
        let member = Arc::new(PoolMember::new("m1", "a", "http://localhost:9000", 1));
        let first = MemberLease::claim(member.clone(), 2, LoadBalanceStrategy::RoundRobin);
        let second = MemberLease::claim(member.clone(), 2, LoadBalanceStrategy::RoundRobin);
        assert!(first.is_some() && second.is_some());
        assert_eq!(member.active_connections(), 2);

        assert!(MemberLease::claim(member.clone(), 2, LoadBalanceStrategy::RoundRobin).is_none());

        drop(first);
        assert_eq!(member.active_connections(), 1);
        drop(second);
        assert_eq!(member.active_connections(), 0);
    }

    #[test]
    fn test_latency_smoothing() {
        let member = PoolMember::new("m1", "a", "addr", 1);
        assert_eq!(member.smoothed_latency_ms(), None);
        member.record_latency(100, 0.5);
        member.record_latency(200, 0.5);
        assert_eq!(member.last_latency_ms(), Some(200));
        assert_eq!(member.smoothed_latency_ms(), Some(150.0));
    }

    #[test]
    fn test_member_health_exclusion() {
        let health = MemberHealth::new();
        assert_eq!(health.record_failure(), 1);
        assert_eq!(health.record_failure(), 2);
        health.record_success();
        assert_eq!(health.consecutive_failures(), 0);

        assert!(health.exclude(false));
        assert!(!health.exclude(false));
        assert!(health.retry_due(Duration::ZERO));

        health.exclude(true);
        assert!(health.is_manually_excluded());
        assert!(!health.retry_due(Duration::ZERO));

        health.readmit();
        assert!(!health.is_excluded());
    }

    #[test]
    fn test_disabled_member_config() {
        let config: MemberConfig =
            serde_json::from_str(r#"{"id": "m1", "address": "http://a", "enabled": false}"#)
                .unwrap();
        assert_eq!(config.weight, 1);
        let member = PoolMember::from_config("a", config);
        assert!(member.health().is_manually_excluded());
    }
}
