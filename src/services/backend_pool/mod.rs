//! Backend Pool Module
//!
//! Multiplexes requests across the interchangeable worker servers behind
//! each backend.
//!
//! # Features
//! - Per-backend pools bounded by `min_servers`/`max_servers`
//! - Round robin, least connections, weighted response time and adaptive selection
//! - Per-member slot budgets with an aggregate connection ceiling
//! - Forced and automatic failover with a bounded event history
//!
//! # Example
//! ```ignore
//! use backend_pool::{MemberConfig, Multiplexer, PoolConfig, PoolSpec};
//!
//! let specs = vec![PoolSpec::new(
//!     "primary",
//!     vec![
//!         MemberConfig::new("p1", "http://10.0.0.1:8080"),
//!         MemberConfig::new("p2", "http://10.0.0.2:8080").with_weight(2),
//!     ],
//! )];
//! let mux = Multiplexer::initialize(specs, PoolConfig::default(), health)?;
//!
//! let lease = mux.pick("primary")?;
//! println!("Using member: {}", lease.member_id());
//! ```

mod member;
mod multiplexer;
mod pool;
mod strategy;

pub use member::{MemberConfig, MemberHealth, MemberLease, PoolMember};
pub use multiplexer::{
    Multiplexer, MultiplexerAnalytics, MultiplexerStatus, PoolSpec, FAILOVER_HISTORY_LIMIT,
};
pub use pool::{FailoverEvent, FailoverReason, MemberLoad, MemberPool, PoolConfig, PoolStatus};
pub use strategy::{LoadBalanceStrategy, StrategyEffectiveness};
