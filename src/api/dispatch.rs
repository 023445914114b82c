//! Dispatch endpoint
//!
//! POST /v1/dispatch routes one text-generation payload through the
//! dispatcher and returns the outcome.

use axum::{extract::State, Extension, Json};
use serde::Deserialize;

use crate::error::ApiError;
use crate::middleware::TraceId;
use crate::models::{Capability, DispatchRequest};
use crate::server::state::AppState;
use crate::services::DispatchOutcome;

/// Request body for POST /v1/dispatch
#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    /// Forwarded to the backend as is
    pub payload: serde_json::Value,
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
    /// Expected relative cost of the request, within [0, 1]
    #[serde(default)]
    pub estimated_complexity: Option<f64>,
    /// Defaults to the request's trace id
    #[serde(default)]
    pub request_id: Option<String>,
}

impl DispatchBody {
    fn into_request(self, trace_id: Option<&TraceId>) -> Result<DispatchRequest, ApiError> {
        let mut request =
            DispatchRequest::new(self.payload).with_capabilities(self.required_capabilities);

        if let Some(complexity) = self.estimated_complexity {
            if !complexity.is_finite() || !(0.0..=1.0).contains(&complexity) {
                return Err(ApiError::InvalidRequest(format!(
                    "estimated_complexity must be within [0, 1], got {}",
                    complexity
                )));
            }
            request = request.with_complexity(complexity);
        }

        match (self.request_id, trace_id) {
            (Some(id), _) if !id.trim().is_empty() => Ok(request.with_id(id)),
            (Some(_), _) => Err(ApiError::InvalidRequest(
                "request_id must not be empty".to_string(),
            )),
            (None, Some(trace)) => Ok(request.with_id(trace.as_str())),
            (None, None) => Ok(request),
        }
    }
}

/// POST /v1/dispatch
pub async fn dispatch(
    State(state): State<AppState>,
    trace_id: Option<Extension<TraceId>>,
    Json(body): Json<DispatchBody>,
) -> Result<Json<DispatchOutcome>, ApiError> {
    let request = body.into_request(trace_id.as_ref().map(|Extension(t)| t))?;
    tracing::debug!(
        request_id = %request.id,
        capabilities = ?request.required_capabilities,
        payload_size = request.payload_size,
        "Dispatch requested"
    );

    let outcome = state.dispatcher.dispatch(request).await?;
    Ok(Json(outcome))
}
