//! Health check endpoints
//!
//! Kubernetes-style probes:
//! - /health, /healthz - liveness (is the service running?)
//! - /ready, /readyz - readiness (is the datastore reachable?)
//!
//! Liveness always returns 200. Readiness returns 200 only when the real
//! datastore connected at startup, unless dev mode runs on the in-memory
//! store by design.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use crate::server::AppState;

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    version: &'static str,
    uptime: u64,
    mode: &'static str,
    region: String,
    datastore_connected: bool,
}

pub fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let body = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.uptime_secs(),
        mode: if state.args.dev_mode {
            "development"
        } else {
            "production"
        },
        region: state.args.region.clone(),
        datastore_connected: state.datastore_connected,
    };
    json_response(StatusCode::OK, &body)
}

pub fn readiness_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let ready = state.datastore_connected || state.args.dev_mode;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &serde_json::json!({ "ready": ready }))
}

pub fn version_info() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}
