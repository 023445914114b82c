//! Dispatch, backend and API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Exclusion Reasons
// ============================================================================

/// Why a backend was left out of a ranking or skipped during a dispatch cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExclusionReason {
    /// Backend is disabled in configuration
    Disabled,
    /// Backend lacks one or more required capabilities
    MissingCapabilities { missing: Vec<String> },
    /// Circuit breaker is open
    CircuitOpen { retry_in_ms: u64 },
    /// Another request already holds the half-open probe slot
    ProbeInFlight,
    /// No pool member could take the request
    Unavailable { detail: String },
    /// The backend call exceeded its calibrated deadline
    TimedOut { after_ms: u64 },
    /// The backend reported a failure
    Failed { detail: String },
    /// Candidate was never tried because the attempt budget ran out
    AttemptsExhausted,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::MissingCapabilities { missing } => {
                write!(f, "missing capabilities [{}]", missing.join(", "))
            }
            Self::CircuitOpen { retry_in_ms } => {
                write!(f, "circuit open (retry in {}ms)", retry_in_ms)
            }
            Self::ProbeInFlight => write!(f, "half-open probe already in flight"),
            Self::Unavailable { detail } => write!(f, "unavailable: {}", detail),
            Self::TimedOut { after_ms } => write!(f, "timed out after {}ms", after_ms),
            Self::Failed { detail } => write!(f, "failed: {}", detail),
            Self::AttemptsExhausted => write!(f, "attempt budget exhausted"),
        }
    }
}

fn format_reasons(reasons: &[(String, ExclusionReason)]) -> String {
    if reasons.is_empty() {
        return "no backends configured".to_string();
    }
    reasons
        .iter()
        .map(|(backend, reason)| format!("{}: {}", backend, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_target(backend: &str, member: &Option<String>) -> String {
    match member {
        Some(member) => format!("backend '{}', member '{}'", backend, member),
        None => format!("backend '{}'", backend),
    }
}

// ============================================================================
// Dispatch Error
// ============================================================================

/// Errors surfaced by the dispatch layer
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// No healthy pool member can take the request
    #[error("Backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// Backend excluded by its circuit breaker
    #[error("Circuit open for backend '{backend}' (retry in {retry_in:?})")]
    CircuitOpen { backend: String, retry_in: Duration },

    /// Deadline exceeded
    #[error("Backend '{backend}' timed out after {after:?}")]
    Timeout { backend: String, after: Duration },

    /// Every ranked candidate was excluded or failed
    #[error("All backends exhausted: {}", format_reasons(.reasons))]
    AllBackendsExhausted {
        reasons: Vec<(String, ExclusionReason)>,
    },

    /// Admin operation named a backend or member that does not exist
    #[error("Unknown target: {}", format_target(.backend, .member))]
    UnknownTarget {
        backend: String,
        member: Option<String>,
    },

    /// Invalid weights, thresholds or pool layout
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DispatchError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Short machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout { .. } => "timeout",
            Self::AllBackendsExhausted { .. } => "all_backends_exhausted",
            Self::UnknownTarget { .. } => "not_found_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

// ============================================================================
// Backend Error
// ============================================================================

/// Failure reported by a backend collaborator
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Call cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            BackendError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            BackendError::InvalidResponse(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

// ============================================================================
// API Error
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found_error", msg),
            ApiError::Dispatch(err) => {
                let status = match &err {
                    DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    DispatchError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    DispatchError::UnknownTarget { .. } => StatusCode::NOT_FOUND,
                    _ => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, err.kind(), err.to_string())
            }
            ApiError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                err.to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            type_: "error".to_string(),
            error: ErrorDetail {
                type_: error_type.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    #[serde(rename = "type")]
    type_: String,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    type_: String,
    message: String,
}
