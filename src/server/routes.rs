//! Application routing
//!
//! This module defines all HTTP routes for the application.

use axum::{
    http::{HeaderName, Uri},
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{admin, dispatch, health};
use crate::error::ApiError;
use crate::middleware::{log_request, REQUEST_ID_HEADER, TRACE_ID_HEADER};
use crate::server::state::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness))
        .route("/liveness", get(health::liveness));

    let api_routes = Router::new()
        .route("/dispatch", post(dispatch::dispatch))
        .route("/status", get(admin::status))
        .route("/analytics", get(admin::analytics));

    let admin_routes = Router::new()
        .route("/backends/:backend/members", post(admin::register_member))
        .route("/backends/:backend/members/:member", delete(admin::remove_member))
        .route(
            "/backends/:backend/members/:member/failover",
            post(admin::force_failover),
        )
        .route(
            "/backends/:backend/members/:member/restore",
            post(admin::restore_member),
        );

    Router::new()
        .nest("/v1", api_routes)
        .nest("/admin", admin_routes)
        .merge(health_routes)
        .fallback(not_found)
        // Apply middleware layers (last added = outermost = runs first)
        .layer(create_cors_layer())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("no route for {}", uri.path()))
}

/// Create CORS layer with permissive settings for development
fn create_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(TRACE_ID_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::LoopbackBackend;
    use crate::config::Settings;
    use crate::models::{BackendSpec, Capability};
    use crate::services::{Dispatcher, MemberConfig};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let dispatcher = Dispatcher::builder()
            .backend(
                BackendSpec::new("cheap", 1.0).with_capabilities([Capability::Chat]),
                Arc::new(LoopbackBackend::new(Duration::ZERO)),
                vec![
                    MemberConfig::new("cheap-1", "loopback://1"),
                    MemberConfig::new("cheap-2", "loopback://2"),
                ],
            )
            .backend(
                BackendSpec::new("pricey", 3.0).with_capabilities([Capability::Chat]),
                Arc::new(LoopbackBackend::new(Duration::ZERO)),
                vec![MemberConfig::new("pricey-1", "loopback://3")],
            )
            .build()
            .unwrap();
        create_router(AppState::with_dispatcher(
            Settings::default(),
            Arc::new(dispatcher),
        ))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_dispatch_endpoint() {
        let app = app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/dispatch",
            Some(json!({"payload": {"prompt": "hi"}, "request_id": "r-1"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["request_id"], "r-1");
        assert_eq!(body["backend_id"], "cheap");
        assert_eq!(body["response"]["echo"]["prompt"], "hi");
        assert_eq!(body["path"][3], "SUCCEEDED");
    }

    #[tokio::test]
    async fn test_dispatch_uses_trace_id_and_echoes_header() {
        let app = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/dispatch")
                    .header("content-type", "application/json")
                    .header(TRACE_ID_HEADER, "trace-42")
                    .body(Body::from(json!({"payload": {}}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "trace-42");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["request_id"], "trace-42");
    }

    #[tokio::test]
    async fn test_unsatisfiable_capabilities_is_unavailable() {
        let app = app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/dispatch",
            Some(json!({"payload": {}, "required_capabilities": ["vision"]})),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "all_backends_exhausted");
    }

    #[tokio::test]
    async fn test_invalid_dispatch_body() {
        let app = app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/dispatch",
            Some(json!({"payload": {}, "estimated_complexity": -1.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_request_error");

        let (status, _) = send(
            &app,
            Method::POST,
            "/v1/dispatch",
            Some(json!({"payload": {}, "required_capabilities": ["teleport"]})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_failover_and_restore_round_trip() {
        let app = app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/admin/backends/cheap/members/cheap-1/failover",
            Some(json!({"reason": "maintenance"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_members"], json!(["cheap-2"]));
        assert_eq!(body["reason"], "maintenance");

        // dispatch lands on the remaining member
        let (_, body) = send(&app, Method::POST, "/v1/dispatch", Some(json!({"payload": {}}))).await;
        assert_eq!(body["member_id"], "cheap-2");

        let (_, analytics) = send(&app, Method::GET, "/v1/analytics", None).await;
        assert_eq!(analytics["failover_history"][0]["from_member_id"], "cheap-1");
        assert_eq!(analytics["dispatches"]["succeeded"], 1);

        let (status, _) = send(
            &app,
            Method::POST,
            "/admin/backends/cheap/members/cheap-1/restore",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, status_body) = send(&app, Method::GET, "/v1/status", None).await;
        assert_eq!(status_body["backends"]["cheap"]["pool"]["available_members"], 2);
    }

    #[tokio::test]
    async fn test_failover_without_body_uses_default_reason() {
        let app = app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/admin/backends/pricey/members/pricey-1/failover",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reason"], "manual failover");
        assert_eq!(body["active_members"], json!([]));

        let (_, status_body) = send(&app, Method::GET, "/v1/status", None).await;
        assert_eq!(status_body["backends"]["pricey"]["health"]["state"], "CIRCUIT_OPEN");
    }

    #[tokio::test]
    async fn test_unknown_targets_are_not_found() {
        let app = app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/admin/backends/cheap/members/ghost/failover",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["type"], "not_found_error");

        let (status, _) = send(&app, Method::POST, "/admin/backends/nope/members/x/restore", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, Method::GET, "/v2/whatever", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_register_and_remove_member() {
        let app = app();
        let (status, _) = send(
            &app,
            Method::POST,
            "/admin/backends/pricey/members",
            Some(json!({"id": "pricey-2", "address": "loopback://4", "weight": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            &app,
            Method::POST,
            "/admin/backends/pricey/members",
            Some(json!({"id": "pricey-2", "address": "loopback://4"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].as_str().unwrap().contains("pricey-2"));

        let (status, body) = send(
            &app,
            Method::DELETE,
            "/admin/backends/pricey/members/pricey-1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reason"]["kind"], "removed");
        assert_eq!(body["remaining_members"], 1);
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let app = app();
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = send(&app, Method::GET, "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backends"]["cheap"]["routable"], true);

        let (status, body) = send(&app, Method::GET, "/liveness", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["alive"], true);
    }

    #[tokio::test]
    async fn test_not_ready_when_every_backend_is_out() {
        let app = app();
        send(&app, Method::POST, "/admin/backends/pricey/members/pricey-1/failover", None).await;
        send(&app, Method::POST, "/admin/backends/cheap/members/cheap-1/failover", None).await;
        send(&app, Method::POST, "/admin/backends/cheap/members/cheap-2/failover", None).await;

        let (status, body) = send(&app, Method::GET, "/ready", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
    }
}
