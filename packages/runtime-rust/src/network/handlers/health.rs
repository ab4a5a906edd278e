//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose engine health for orchestrators (Kubernetes, load
//! balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::engine::EngineState;

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` field in the response body indicates
/// whether the engine is actually serving. This lets monitoring tools
/// distinguish between "process is up but stopping" vs "engine is down".
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let engine = &state.engine;
    let identity = engine.identity();
    let discovery = engine.discovery();

    Json(json!({
        "state": engine.state(),
        "serviceId": identity.service_id(),
        "instanceId": identity.instance_id(),
        "inFlight": engine.tracker().in_flight(),
        "rejected": engine.admission().rejected(),
        "microservices": discovery.microservices().len(),
        "instances": discovery.instance_count(),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    }))
}

/// Kubernetes liveness probe -- always returns 200 OK.
///
/// Only checks that the process is responsive; a failed liveness probe
/// triggers a restart, so engine state is deliberately ignored.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- 200 while the engine is UP, 503 otherwise.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.engine.state() == EngineState::Up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
