//! Dead-letter and operator queue endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use common::BusinessKey;
use saga_store::{DeadLetter, DeadLetterKind, DeadLetterQuery, SagaStore};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterParams {
    pub kind: Option<String>,
    pub saga_type: Option<String>,
    pub correlation_id: Option<String>,
    /// Only entries an operator has to act on.
    #[serde(default)]
    pub operator: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl DeadLetterParams {
    fn into_query(self) -> Result<DeadLetterQuery, ApiError> {
        let mut query = if self.operator {
            DeadLetterQuery::operator_queue()
        } else {
            DeadLetterQuery::new()
        };

        if let Some(kind) = self.kind {
            let kind = DeadLetterKind::parse(&kind)
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown dead-letter kind: {kind}")))?;
            query = query.kind(kind);
        }
        if let Some(saga_type) = self.saga_type {
            query = query.saga_type(saga_type);
        }
        if let Some(key) = self.correlation_id {
            query = query.correlation_id(BusinessKey::new(key));
        }

        Ok(query
            .limit(self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT))
            .offset(self.offset.unwrap_or(0)))
    }
}

/// GET /dead-letters?kind=&saga_type=&correlation_id=&operator=&limit=&offset=
#[tracing::instrument(skip(state))]
pub async fn list<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(params): Query<DeadLetterParams>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let query = params.into_query()?;
    let letters = state.engine.store().dead_letters(query).await?;
    Ok(Json(letters))
}
