//! Backend collaborators
//!
//! Every backend is reached through the same `Backend` capability: an
//! `execute` call bounded by a `Deadline` and a lightweight `probe`. The
//! concrete variant is chosen from configuration (`BackendKind`) when the
//! dispatcher is built.

mod http;
mod loopback;

pub use http::HttpBackend;
pub use loopback::LoopbackBackend;

use crate::error::BackendError;
use crate::services::backend_pool::PoolMember;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Deadline
// ============================================================================

/// Cancellation-bearing deadline owned by one dispatched call
#[derive(Debug, Clone)]
pub struct Deadline {
    timeout: Duration,
    started: Instant,
    token: CancellationToken,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            started: Instant::now(),
            token: CancellationToken::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before the call is cancelled
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the dispatcher cancels the call
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

// ============================================================================
// Backend Capability
// ============================================================================

#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub body: serde_json::Value,
    pub response_bytes: usize,
}

impl BackendResponse {
    pub fn new(body: serde_json::Value) -> Self {
        let response_bytes = serde_json::to_vec(&body).map(|b| b.len()).unwrap_or(0);
        Self {
            body,
            response_bytes,
        }
    }
}

/// Result of a health probe against one pool member
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

impl ProbeResult {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            detail: None,
        }
    }

    pub fn unhealthy(latency_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms,
            detail: Some(detail.into()),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Short name of the variant, for logs
    fn kind(&self) -> &'static str;

    /// Run a request on `member`. Implementations should stop work once
    /// `deadline` is cancelled; the dispatcher does not wait for them.
    async fn execute(
        &self,
        member: &PoolMember,
        payload: &serde_json::Value,
        deadline: &Deadline,
    ) -> Result<BackendResponse, BackendError>;

    async fn probe(&self, member: &PoolMember) -> ProbeResult;
}

// ============================================================================
// Configuration
// ============================================================================

/// How a configured backend is reached
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendKind {
    /// JSON over HTTP; the member address is the base URL
    Http {
        #[serde(default = "default_execute_path")]
        path: String,
        #[serde(default = "default_health_path")]
        health_path: String,
    },
    /// In-process echo backend with a fixed latency
    Loopback {
        #[serde(default)]
        latency_ms: u64,
    },
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Http {
            path: default_execute_path(),
            health_path: default_health_path(),
        }
    }
}

impl BackendKind {
    /// Resolve the configured variant into a backend implementation
    pub fn build(&self, client: &reqwest::Client) -> Arc<dyn Backend> {
        match self {
            Self::Http { path, health_path } => Arc::new(HttpBackend::new(
                client.clone(),
                path.clone(),
                health_path.clone(),
            )),
            Self::Loopback { latency_ms } => {
                Arc::new(LoopbackBackend::new(Duration::from_millis(*latency_ms)))
            }
        }
    }
}

fn default_execute_path() -> String {
    "/v1/generate".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}
