//! Domain layer for the saga engine.
//!
//! This crate provides the pure workflow abstractions including:
//! - Workflow, SagaState, WorkflowEvent and WorkflowCommand traits
//! - Table-driven transitions with write-once guards
//! - The order fulfillment saga with its compensation table

pub mod error;
pub mod fulfillment;
pub mod transition;
pub mod workflow;

pub use error::GuardViolation;
pub use fulfillment::{
    FulfillmentCommand, FulfillmentData, FulfillmentEvent, FulfillmentState, Money, OrderFulfillment,
    OrderLine, OrderStatus, ProductId,
};
pub use transition::{Decision, Rejection, Step, TransitionFn, TransitionTable, set_once};
pub use workflow::{CompensationFailureReport, SagaState, Workflow, WorkflowCommand, WorkflowEvent};
