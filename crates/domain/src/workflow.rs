//! Core workflow traits.
//!
//! A workflow describes one saga type: its closed set of states, the events
//! that drive it, the commands it emits, the business data it accumulates and
//! the transition table tying them together. Workflows are pure: they never
//! perform I/O, the engine does that around them.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use common::BusinessKey;
use serde::{Serialize, de::DeserializeOwned};

use crate::transition::TransitionTable;

/// A state of a saga instance.
pub trait SagaState: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static {
    /// Returns the state name as persisted.
    fn as_str(&self) -> &'static str;

    /// Parses a state name produced by [`SagaState::as_str`].
    fn parse(s: &str) -> Option<Self>;

    /// Returns true if no further transitions are possible.
    fn is_terminal(&self) -> bool;
}

/// An inbound event a saga reacts to.
pub trait WorkflowEvent: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Returns the event type name.
    ///
    /// Used as the second half of the transition table key.
    fn event_type(&self) -> &'static str;

    /// Returns the business key correlating the event to a saga instance.
    fn business_key(&self) -> BusinessKey;
}

/// An outbound command emitted by a transition.
pub trait WorkflowCommand: Serialize + Clone + Debug + Send + Sync + 'static {
    /// Returns the command type name.
    fn command_type(&self) -> &'static str;

    /// Returns the bus topic the command is published to.
    fn topic(&self) -> &'static str;

    /// Returns the business key of the saga instance that emitted it.
    fn business_key(&self) -> BusinessKey;

    /// Returns true if the command undoes a previously completed step.
    fn is_compensation(&self) -> bool;
}

/// A downstream report that a compensating command could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationFailureReport {
    pub command_type: String,
    pub reason: String,
}

/// Definition of a saga type.
pub trait Workflow: Send + Sync + Sized + 'static {
    /// Saga type name, used as the store partition.
    const SAGA_TYPE: &'static str;

    type State: SagaState;
    type Event: WorkflowEvent;
    type Command: WorkflowCommand;
    type Data: Serialize + DeserializeOwned + Clone + Debug + Default + Send + Sync + 'static;

    /// State a fresh instance starts in, before the start event is applied.
    fn initial_state(&self) -> Self::State;

    /// Returns true if the event may create a new instance.
    fn is_start_event(&self, event: &Self::Event) -> bool;

    /// Returns the transition table.
    fn transitions(&self) -> &TransitionTable<Self>;

    /// Compares a redelivered start event with the stored instance data.
    ///
    /// Returns a description of the disagreement, or None for a benign duplicate.
    fn start_conflict(&self, data: &Self::Data, event: &Self::Event) -> Option<String>;

    /// Returns the report carried by a compensation-failure event, if the
    /// event is one.
    fn compensation_failure(&self, event: &Self::Event) -> Option<CompensationFailureReport>;
}
