//! Saga instance inspection endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::BusinessKey;
use domain::{FulfillmentData, OrderFulfillment, SagaState, Workflow};
use saga_store::{OutboxMessage, SagaStore, TransitionLogEntry, Version};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_type: &'static str,
    pub correlation_id: BusinessKey,
    pub state: &'static str,
    pub version: Version,
    pub is_completed: bool,
    pub data: FulfillmentData,
}

/// GET /sagas/{key}: current state and data of the instance.
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(key): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let key = parse_key(key)?;
    let instance = state
        .engine
        .load(&key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No saga instance for {key}")))?;

    Ok(Json(SagaResponse {
        saga_type: OrderFulfillment::SAGA_TYPE,
        state: instance.state.as_str(),
        correlation_id: instance.correlation_id,
        version: instance.version,
        is_completed: instance.is_completed,
        data: instance.data,
    }))
}

/// GET /sagas/{key}/transitions: accepted transitions, oldest first.
#[tracing::instrument(skip(state))]
pub async fn transitions<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(key): Path<String>,
) -> Result<Json<Vec<TransitionLogEntry>>, ApiError> {
    let key = parse_key(key)?;
    let log = state.engine.transition_log(&key).await?;
    if log.is_empty() {
        return Err(ApiError::NotFound(format!("No saga instance for {key}")));
    }
    Ok(Json(log))
}

/// GET /sagas/{key}/outbox: commands emitted by the instance with their delivery status.
#[tracing::instrument(skip(state))]
pub async fn outbox<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(key): Path<String>,
) -> Result<Json<Vec<OutboxMessage>>, ApiError> {
    let key = parse_key(key)?;
    let messages = state
        .engine
        .store()
        .outbox_for(OrderFulfillment::SAGA_TYPE, &key)
        .await?;
    Ok(Json(messages))
}

fn parse_key(raw: String) -> Result<BusinessKey, ApiError> {
    let key = BusinessKey::new(raw.trim());
    if key.is_empty() {
        return Err(ApiError::BadRequest("Business key must not be empty".into()));
    }
    Ok(key)
}
