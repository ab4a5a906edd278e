//! Read-only view of the local registry.

use axum::extract::State;
use axum::Json;

use super::AppState;
use crate::registry::ServiceView;

/// Every known microservice with its instances, sorted by service id.
pub async fn instances_handler(State(state): State<AppState>) -> Json<Vec<ServiceView>> {
    Json(state.engine.discovery().snapshot())
}
