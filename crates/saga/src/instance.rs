//! Typed view of a stored saga instance.

use common::BusinessKey;
use domain::{SagaState, Workflow};
use saga_store::{SagaRecord, Version};

use crate::error::{Result, SagaError};

/// A saga instance with its workflow's state and data types.
pub struct SagaInstance<W: Workflow> {
    pub correlation_id: BusinessKey,
    pub state: W::State,
    pub version: Version,
    pub data: W::Data,
    pub is_completed: bool,
}

impl<W: Workflow> SagaInstance<W> {
    /// A never-persisted instance in the workflow's initial state.
    pub fn fresh(workflow: &W, correlation_id: BusinessKey) -> Self {
        Self {
            correlation_id,
            state: workflow.initial_state(),
            version: Version::initial(),
            data: W::Data::default(),
            is_completed: false,
        }
    }

    /// Decodes a stored record.
    pub fn from_record(record: SagaRecord) -> Result<Self> {
        let state = W::State::parse(&record.state).ok_or_else(|| SagaError::CorruptState {
            correlation_id: record.correlation_id.clone(),
            state: record.state.clone(),
        })?;
        let data: W::Data = serde_json::from_value(record.data)?;

        Ok(Self {
            correlation_id: record.correlation_id,
            state,
            version: record.version,
            data,
            is_completed: record.is_completed,
        })
    }

    /// Returns true if the instance has been written at least once.
    pub fn is_persisted(&self) -> bool {
        !self.version.is_initial()
    }
}

impl<W: Workflow> Clone for SagaInstance<W> {
    fn clone(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            state: self.state,
            version: self.version,
            data: self.data.clone(),
            is_completed: self.is_completed,
        }
    }
}

impl<W: Workflow> std::fmt::Debug for SagaInstance<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaInstance")
            .field("correlation_id", &self.correlation_id)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("data", &self.data)
            .field("is_completed", &self.is_completed)
            .finish()
    }
}
