//! Inbound event ingestion.
//!
//! Publishes an event onto the saga's event topic, exactly like any other
//! producer would. External timeout sweeps inject `StepTimedOut` this way.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use common::{BusinessKey, MessageId};
use domain::fulfillment::EVENTS_TOPIC;
use domain::{FulfillmentEvent, WorkflowEvent};
use saga::{BusMessage, EventBus, SagaError};
use saga_store::SagaStore;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct EventAcceptedResponse {
    pub message_id: MessageId,
    pub event_type: &'static str,
    pub correlation_id: BusinessKey,
}

/// POST /events: accepts a fulfillment event for asynchronous handling.
#[tracing::instrument(skip(state, event), fields(event_type = event.event_type()))]
pub async fn publish<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(event): Json<FulfillmentEvent>,
) -> Result<(StatusCode, Json<EventAcceptedResponse>), ApiError> {
    let correlation_id = event.business_key();
    if correlation_id.is_empty() {
        return Err(ApiError::BadRequest("order_id must not be empty".into()));
    }

    let message = BusMessage::event(EVENTS_TOPIC, &event).map_err(SagaError::from)?;
    let response = EventAcceptedResponse {
        message_id: message.id,
        event_type: event.event_type(),
        correlation_id,
    };
    state.bus.publish(message).await.map_err(SagaError::from)?;
    metrics::counter!("http_events_accepted_total", "event_type" => response.event_type)
        .increment(1);

    Ok((StatusCode::ACCEPTED, Json(response)))
}
