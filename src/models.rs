//! Core data model shared by the dispatch components
//!
//! Backends, outcome samples and dispatch requests. Pool-specific types
//! (members, failover events) live with the pool in `services::backend_pool`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Capabilities & Classes
// ============================================================================

/// A feature a backend can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextGeneration,
    Chat,
    Streaming,
    ToolUse,
    Vision,
    Embeddings,
    LongContext,
    CodeGeneration,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TextGeneration => "text_generation",
            Self::Chat => "chat",
            Self::Streaming => "streaming",
            Self::ToolUse => "tool_use",
            Self::Vision => "vision",
            Self::Embeddings => "embeddings",
            Self::LongContext => "long_context",
            Self::CodeGeneration => "code_generation",
        };
        f.write_str(name)
    }
}

/// Deployment class of a backend, used for cold-start timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendClass {
    /// Hosted API endpoint
    #[default]
    Cloud,
    /// Self-hosted model server (typically slower per token, no per-call cost)
    Local,
}

// ============================================================================
// Backend
// ============================================================================

/// Static description of a backend, derived from configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendSpec {
    pub id: String,
    pub enabled: bool,
    /// Lower wins ties in routing
    pub priority_hint: u32,
    pub cost_per_unit: f64,
    pub capabilities: BTreeSet<Capability>,
    pub class: BackendClass,
}

impl BackendSpec {
    pub fn new(id: impl Into<String>, cost_per_unit: f64) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            priority_hint: 0,
            cost_per_unit,
            capabilities: BTreeSet::new(),
            class: BackendClass::Cloud,
        }
    }

    pub fn with_priority(mut self, priority_hint: u32) -> Self {
        self.priority_hint = priority_hint;
        self
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = caps.into_iter().collect();
        self
    }

    pub fn with_class(mut self, class: BackendClass) -> Self {
        self.class = class;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Capabilities from `required` this backend does not offer
    pub fn missing_capabilities(&self, required: &BTreeSet<Capability>) -> Vec<Capability> {
        required.difference(&self.capabilities).copied().collect()
    }
}

// ============================================================================
// Outcome Sample
// ============================================================================

/// One recorded dispatch attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeSample {
    pub backend_id: String,
    pub member_id: Option<String>,
    pub latency_ms: u64,
    pub success: bool,
    pub timed_out: bool,
    pub request_bytes: usize,
    pub response_bytes: usize,
    pub timestamp: DateTime<Utc>,
}

impl OutcomeSample {
    pub fn success(backend_id: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            backend_id: backend_id.into(),
            member_id: None,
            latency_ms,
            success: true,
            timed_out: false,
            request_bytes: 0,
            response_bytes: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(backend_id: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            success: false,
            ..Self::success(backend_id, latency_ms)
        }
    }

    pub fn timeout(backend_id: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            success: false,
            timed_out: true,
            ..Self::success(backend_id, latency_ms)
        }
    }

    pub fn with_member(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = Some(member_id.into());
        self
    }

    pub fn with_sizes(mut self, request_bytes: usize, response_bytes: usize) -> Self {
        self.request_bytes = request_bytes;
        self.response_bytes = response_bytes;
        self
    }

    /// Whether this sample carries a latency that reflects backend speed.
    ///
    /// Fast failures (connection refused, 4xx) say nothing about how long a
    /// real generation takes.
    pub fn is_latency_representative(&self) -> bool {
        self.success || self.timed_out
    }
}

// ============================================================================
// Dispatch Request
// ============================================================================

/// Request features that drive timeout calibration
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RequestFeatures {
    /// Estimated complexity in [0, 1]
    pub estimated_complexity: f64,
    /// Payload size in bytes
    pub payload_size: usize,
}

impl RequestFeatures {
    pub fn new(estimated_complexity: f64, payload_size: usize) -> Self {
        Self {
            estimated_complexity: clamp_complexity(estimated_complexity),
            payload_size,
        }
    }
}

fn clamp_complexity(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// An incoming text-generation request
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRequest {
    pub id: String,
    pub required_capabilities: BTreeSet<Capability>,
    pub estimated_complexity: f64,
    pub payload_size: usize,
    #[serde(skip)]
    pub payload: serde_json::Value,
}

impl DispatchRequest {
    pub fn new(payload: serde_json::Value) -> Self {
        let payload_size = serde_json::to_vec(&payload).map(|b| b.len()).unwrap_or(0);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            required_capabilities: BTreeSet::new(),
            estimated_complexity: 0.0,
            payload_size,
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.required_capabilities = caps.into_iter().collect();
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.estimated_complexity = clamp_complexity(complexity);
        self
    }

    pub fn features(&self) -> RequestFeatures {
        RequestFeatures::new(self.estimated_complexity, self.payload_size)
    }
}
