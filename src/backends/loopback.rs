//! In-process loopback backend
//!
//! Echoes the payload back after a fixed delay. Used for local smoke runs
//! and as the reference implementation of the cancellation contract.

use super::{Backend, BackendResponse, Deadline, ProbeResult};
use crate::error::BackendError;
use crate::services::backend_pool::PoolMember;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LoopbackBackend {
    latency: Duration,
}

impl LoopbackBackend {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Backend for LoopbackBackend {
    fn kind(&self) -> &'static str {
        "loopback"
    }

    async fn execute(
        &self,
        member: &PoolMember,
        payload: &serde_json::Value,
        deadline: &Deadline,
    ) -> Result<BackendResponse, BackendError> {
        tokio::select! {
            _ = deadline.cancelled() => Err(BackendError::Cancelled),
            _ = tokio::time::sleep(self.latency) => Ok(BackendResponse::new(json!({
                "backend": member.backend_id(),
                "member": member.id(),
                "echo": payload,
            }))),
        }
    }

    async fn probe(&self, _member: &PoolMember) -> ProbeResult {
        ProbeResult::healthy(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_echoes_payload() {
        let backend = LoopbackBackend::new(Duration::ZERO);
        let member = PoolMember::new("m1", "local", "loopback://", 1);
        let deadline = Deadline::new(Duration::from_secs(1));

        let response = backend
            .execute(&member, &json!({"prompt": "hi"}), &deadline)
            .await
            .unwrap();
        assert_eq!(response.body["echo"]["prompt"], "hi");
        assert_eq!(response.body["member"], "m1");
        assert!(response.response_bytes > 0);
    }

    #[tokio::test]
    async fn test_loopback_honors_cancellation() {
        let backend = LoopbackBackend::new(Duration::from_secs(30));
        let member = PoolMember::new("m1", "local", "loopback://", 1);
        let deadline = Deadline::new(Duration::from_millis(10));
        deadline.cancel();

        let result = backend.execute(&member, &json!({}), &deadline).await;
        assert!(matches!(result, Err(BackendError::Cancelled)));
        assert!(backend.probe(&member).await.healthy);
    }
}
