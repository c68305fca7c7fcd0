//! Durable storage for saga instances.
//!
//! A single [`SagaStore::try_apply_transition`] call commits the new saga
//! state, its transition log entry and the outbound commands (outbox) as one
//! atomic unit, guarded by an optimistic version check.

pub mod dead_letter;
pub mod error;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod query;
pub mod record;
pub mod store;
pub mod version;

pub use common::{BusinessKey, MessageId};
pub use dead_letter::{DeadLetter, DeadLetterKind};
pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use outbox::{OutboxMessage, OutboxStatus};
pub use postgres::PostgresSagaStore;
pub use query::DeadLetterQuery;
pub use record::{ApplyOutcome, SagaRecord, TransitionLogEntry, TransitionWrite};
pub use store::{SagaStore, SagaStoreExt};
pub use version::Version;
