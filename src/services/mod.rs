//! Services module
//!
//! The dispatch pipeline: performance ledger, timeout calibration, circuit
//! breaking, routing, pool multiplexing and the orchestrator tying them
//! together.

pub mod analytics;
pub mod backend_pool;
pub mod calibrator;
pub mod dispatcher;
pub mod health;
pub mod ledger;
pub mod router;

pub use analytics::{AnalyticsReport, BackendUtilization, DispatchTotals, PerformanceAnalytics};
pub use backend_pool::{
    FailoverEvent, LoadBalanceStrategy, MemberConfig, Multiplexer, PoolConfig, PoolSpec,
    PoolStatus,
};
pub use calibrator::{CalibratorConfig, TimeoutCalibrator, TimeoutProfile};
pub use dispatcher::{
    DispatchConfig, DispatchOutcome, DispatchState, Dispatcher, DispatcherBuilder,
    DispatcherStatus,
};
pub use health::{CircuitBreakerConfig, HealthMonitor, HealthSnapshot, HealthState};
pub use ledger::{LedgerConfig, LedgerStats, PerformanceLedger};
pub use router::{BackendRouter, Candidate, RoutingWeights};
