//! Health check endpoints
//!
//! Liveness and readiness for container orchestration, plus a summary
//! health endpoint.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::server::state::AppState;
use crate::services::HealthState;

/// Response for the main health check endpoint
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub uptime_seconds: u64,
}

/// Response for readiness probe
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub backends: BTreeMap<String, BackendReadiness>,
}

#[derive(Debug, Serialize)]
pub struct BackendReadiness {
    pub state: HealthState,
    pub available_members: usize,
    pub routable: bool,
}

/// Response for liveness probe
#[derive(Serialize)]
pub struct LivenessResponse {
    pub alive: bool,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.settings.app_version.clone(),
        environment: state.settings.environment.to_string(),
        uptime_seconds: state.uptime_seconds(),
    })
}

/// Ready while at least one enabled backend has a closed (or degraded)
/// circuit and a pool member in rotation.
///
/// GET /ready
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let backends: BTreeMap<String, BackendReadiness> = state
        .dispatcher
        .status()
        .backends
        .into_iter()
        .map(|(id, backend)| {
            let available_members = backend
                .pool
                .as_ref()
                .map(|p| p.available_members)
                .unwrap_or(0);
            let routable = backend.enabled
                && matches!(backend.health.state, HealthState::Healthy | HealthState::Degraded)
                && available_members > 0;
            let readiness = BackendReadiness {
                state: backend.health.state,
                available_members,
                routable,
            };
            (id, readiness)
        })
        .collect();

    let ready = backends.values().any(|b| b.routable);
    if !ready {
        tracing::warn!(backends = ?backends, "Service not ready");
    }

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, backends }))
}

/// GET /liveness
pub async fn liveness() -> Json<LivenessResponse> {
    // Simple liveness check - if we can respond, we're alive
    Json(LivenessResponse { alive: true })
}
