//! Saga engine for long-running workflows.
//!
//! This crate correlates inbound events to saga instances, applies the
//! workflow's transition table and persists the result together with the
//! outgoing commands in a single conditional write. The pieces:
//! - [`SagaEngine`]: load, decide, write, with bounded retries on version conflicts
//! - [`OutboxRelay`]: publishes committed commands in write order
//! - [`SagaConsumer`]: feeds bus messages to the engine, partitioned by business key
//! - [`services`]: downstream stand-ins that turn commands into result events

pub mod bus;
pub mod consumer;
pub mod dispatch;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod instance;
pub mod outbox;
pub mod outcome;
pub mod services;

pub use bus::{BusError, BusMessage, BusSubscription, EventBus, InMemoryEventBus};
pub use consumer::{ConsumerConfig, SagaConsumer};
pub use dispatch::{KeyedLocks, partition_for};
pub use engine::{EngineConfig, SagaEngine};
pub use envelope::InboundEvent;
pub use error::{Result, SagaError};
pub use instance::SagaInstance;
pub use outbox::{OutboxRelay, RelayConfig, RelayReport};
pub use outcome::HandleOutcome;
pub use services::{Downstream, InMemoryDownstream};
