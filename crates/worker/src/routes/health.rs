//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga_store::SagaStore;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    pub active_keys: usize,
}

/// GET /health: liveness plus the number of business keys being handled.
pub async fn check<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store: state.store_kind,
        active_keys: state.engine.active_keys(),
    })
}
