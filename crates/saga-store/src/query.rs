use chrono::{DateTime, Utc};

use crate::{BusinessKey, DeadLetter, DeadLetterKind};

/// Builder for constructing dead-letter queries.
///
/// Results are returned oldest first.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterQuery {
    /// Filter by kind.
    pub kind: Option<DeadLetterKind>,

    /// Filter by saga type.
    pub saga_type: Option<String>,

    /// Filter by business key.
    pub correlation_id: Option<BusinessKey>,

    /// Only return kinds that require an operator.
    pub operator_only: bool,

    /// Filter by entries recorded at or after this timestamp.
    pub from_timestamp: Option<DateTime<Utc>>,

    /// Maximum number of entries to return.
    pub limit: Option<usize>,

    /// Number of entries to skip.
    pub offset: Option<usize>,
}

impl DeadLetterQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query over the operator queue (kinds that need a human).
    pub fn operator_queue() -> Self {
        Self {
            operator_only: true,
            ..Default::default()
        }
    }

    /// Filters by kind.
    pub fn kind(mut self, kind: DeadLetterKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Filters by saga type.
    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    /// Filters by business key.
    pub fn correlation_id(mut self, correlation_id: BusinessKey) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Filters to entries recorded at or after this timestamp.
    pub fn from_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    /// Limits the number of entries returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many entries before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the entry passes every filter except limit/offset.
    pub fn matches(&self, letter: &DeadLetter) -> bool {
        if let Some(kind) = self.kind
            && letter.kind != kind
        {
            return false;
        }
        if let Some(ref saga_type) = self.saga_type
            && &letter.saga_type != saga_type
        {
            return false;
        }
        if let Some(ref key) = self.correlation_id
            && letter.correlation_id.as_ref() != Some(key)
        {
            return false;
        }
        if self.operator_only && !letter.kind.requires_operator() {
            return false;
        }
        if let Some(from) = self.from_timestamp
            && letter.recorded_at < from
        {
            return false;
        }
        true
    }
}
