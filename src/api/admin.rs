//! Status, analytics and administrative endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, DispatchError};
use crate::server::state::AppState;
use crate::services::{AnalyticsReport, DispatcherStatus, FailoverEvent, MemberConfig};

const DEFAULT_FAILOVER_REASON: &str = "manual failover";

#[derive(Debug, Default, Deserialize)]
pub struct FailoverBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FailoverResponse {
    pub backend_id: String,
    pub member_id: String,
    pub reason: String,
    /// Members of the backend still in rotation
    pub active_members: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RestoreResponse {
    pub backend_id: String,
    pub member_id: String,
    pub restored: bool,
}

/// GET /v1/status
pub async fn status(State(state): State<AppState>) -> Json<DispatcherStatus> {
    Json(state.dispatcher.status())
}

/// GET /v1/analytics
pub async fn analytics(State(state): State<AppState>) -> Json<AnalyticsReport> {
    Json(state.dispatcher.analytics())
}

/// POST /admin/backends/:backend/members/:member/failover
pub async fn force_failover(
    State(state): State<AppState>,
    Path((backend_id, member_id)): Path<(String, String)>,
    body: Option<Json<FailoverBody>>,
) -> Result<Json<FailoverResponse>, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FAILOVER_REASON.to_string());

    let active_members = state
        .dispatcher
        .force_failover(&backend_id, &member_id, &reason)?;

    Ok(Json(FailoverResponse {
        backend_id,
        member_id,
        reason,
        active_members,
    }))
}

/// POST /admin/backends/:backend/members/:member/restore
pub async fn restore_member(
    State(state): State<AppState>,
    Path((backend_id, member_id)): Path<(String, String)>,
) -> Result<Json<RestoreResponse>, ApiError> {
    state.dispatcher.restore_member(&backend_id, &member_id)?;
    tracing::info!(backend = %backend_id, member = %member_id, "Member restored via admin API");
    Ok(Json(RestoreResponse {
        backend_id,
        member_id,
        restored: true,
    }))
}

/// POST /admin/backends/:backend/members
pub async fn register_member(
    State(state): State<AppState>,
    Path(backend_id): Path<String>,
    Json(member): Json<MemberConfig>,
) -> Result<(StatusCode, Json<MemberConfig>), ApiError> {
    if member.id.trim().is_empty() || member.address.trim().is_empty() {
        return Err(ApiError::InvalidRequest(
            "member id and address are required".to_string(),
        ));
    }
    state
        .dispatcher
        .register_member(&backend_id, member.clone())
        .map_err(rejected_change)?;
    Ok((StatusCode::CREATED, Json(member)))
}

/// DELETE /admin/backends/:backend/members/:member
pub async fn remove_member(
    State(state): State<AppState>,
    Path((backend_id, member_id)): Path<(String, String)>,
) -> Result<Json<FailoverEvent>, ApiError> {
    let event = state
        .dispatcher
        .remove_member(&backend_id, &member_id)
        .map_err(rejected_change)?;
    Ok(Json(event))
}

/// Map a refused membership change to a 400 response
fn rejected_change(err: DispatchError) -> ApiError {
    match err {
        DispatchError::Configuration(msg) => ApiError::InvalidRequest(msg),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_change_mapping() {
        let refused = rejected_change(DispatchError::config("pool is full"));
        assert!(matches!(refused, ApiError::InvalidRequest(ref msg) if msg == "pool is full"));

        let missing = rejected_change(DispatchError::UnknownTarget {
            backend: "a".to_string(),
            member: Some("ghost".to_string()),
        });
        assert!(!matches!(missing, ApiError::InvalidRequest(_)));
    }
}
