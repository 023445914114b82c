//! JSON-over-HTTP backend
//!
//! POSTs the payload to `{member.address}{path}` and probes
//! `{member.address}{health_path}` with a GET.

use super::{Backend, BackendResponse, Deadline, ProbeResult};
use crate::error::BackendError;
use crate::services::backend_pool::PoolMember;
use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};

/// Upper bound for a single probe request
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    path: String,
    health_path: String,
}

impl HttpBackend {
    pub fn new(client: Client, path: impl Into<String>, health_path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            health_path: health_path.into(),
        }
    }

    fn url(address: &str, path: &str) -> String {
        format!("{}{}", address.trim_end_matches('/'), path)
    }

    async fn call(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<BackendResponse, BackendError> {
        // no per-request timeout: the dispatcher's deadline is the only timer
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let text = response.text().await?;
        let body = serde_json::from_str(&text).map_err(|e| {
            tracing::error!(error = %e, url = %url, "Failed to parse backend response");
            BackendError::InvalidResponse(e.to_string())
        })?;
        Ok(BackendResponse {
            body,
            response_bytes: text.len(),
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn execute(
        &self,
        member: &PoolMember,
        payload: &serde_json::Value,
        deadline: &Deadline,
    ) -> Result<BackendResponse, BackendError> {
        let url = Self::url(member.address(), &self.path);
        tracing::debug!(
            backend = %member.backend_id(),
            member = %member.id(),
            url = %url,
            timeout_ms = deadline.remaining().as_millis() as u64,
            "Calling backend"
        );

        tokio::select! {
            _ = deadline.cancelled() => Err(BackendError::Cancelled),
            result = self.call(&url, payload) => result,
        }
    }

    async fn probe(&self, member: &PoolMember) -> ProbeResult {
        let url = Self::url(member.address(), &self.health_path);
        let started = Instant::now();
        let result = self.client.get(&url).timeout(PROBE_TIMEOUT).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(resp) if resp.status().is_success() => ProbeResult::healthy(latency_ms),
            Ok(resp) => ProbeResult::unhealthy(latency_ms, format!("status {}", resp.status())),
            Err(e) => ProbeResult::unhealthy(latency_ms, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use crate::utils::timeout::{with_deadline, TimeoutError};
    use serde_json::{json, Value};

    async fn spawn_server() -> String {
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/v1/generate",
                post(|Json(body): Json<Value>| async move { Json(json!({ "received": body })) }),
            )
            .route(
                "/slow",
                post(|| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Json(json!({}))
                }),
            )
            .route(
                "/broken",
                post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_http_execute_and_probe() {
        let address = spawn_server().await;
        let member = PoolMember::new("m1", "remote", format!("{}/", address), 1);
        let backend = HttpBackend::new(Client::new(), "/v1/generate", "/health");

        let deadline = Deadline::new(Duration::from_secs(5));
        let response = backend
            .execute(&member, &json!({"prompt": "hi"}), &deadline)
            .await
            .unwrap();
        assert_eq!(response.body["received"]["prompt"], "hi");
        assert!(response.response_bytes > 0);

        assert!(backend.probe(&member).await.healthy);
    }

    #[tokio::test]
    async fn test_slow_call_ends_as_deadline_timeout() {
        let address = spawn_server().await;
        let member = PoolMember::new("m1", "remote", address, 1);
        let backend = HttpBackend::new(Client::new(), "/slow", "/health");

        for _ in 0..5 {
            let deadline = Deadline::new(Duration::from_millis(50));
            let result = with_deadline(&deadline, backend.execute(&member, &json!({}), &deadline)).await;
            assert!(matches!(result, Err(TimeoutError::Timeout(_))), "{:?}", result);
            assert!(deadline.is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_http_error_status_and_unreachable_probe() {
        let address = spawn_server().await;
        let member = PoolMember::new("m1", "remote", address, 1);
        let backend = HttpBackend::new(Client::new(), "/broken", "/missing");

        let deadline = Deadline::new(Duration::from_secs(5));
        let err = backend
            .execute(&member, &json!({}), &deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 502, .. }));

        let probe = backend.probe(&member).await;
        assert!(!probe.healthy);
        assert_eq!(probe.detail.as_deref(), Some("status 404 Not Found"));
    }
}
