//! Table-driven transitions.
//!
//! A [`TransitionTable`] maps `(state, event type)` to a plain function. The
//! function sees the current state, the accumulated data and the event, and
//! returns the next [`Step`]: target state, updated data and the commands to
//! emit. Anything not in the table is rejected without touching the instance.

use std::collections::HashMap;
use std::fmt;

use crate::error::GuardViolation;
use crate::workflow::{SagaState, Workflow, WorkflowEvent};

/// Signature of a transition function.
pub type TransitionFn<W> = fn(
    <W as Workflow>::State,
    &<W as Workflow>::Data,
    &<W as Workflow>::Event,
) -> Result<Step<W>, GuardViolation>;

/// The result of an accepted transition.
pub struct Step<W: Workflow> {
    /// State the instance moves to.
    pub to: W::State,

    /// Data after the transition.
    pub data: W::Data,

    /// Commands to emit, in order.
    pub commands: Vec<W::Command>,
}

impl<W: Workflow> Step<W> {
    pub fn new(to: W::State, data: W::Data, commands: Vec<W::Command>) -> Self {
        Self { to, data, commands }
    }
}

impl<W: Workflow> fmt::Debug for Step<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("to", &self.to)
            .field("data", &self.data)
            .field("commands", &self.commands)
            .finish()
    }
}

/// Why an event was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The instance is in a terminal state.
    Terminal,

    /// The table has no entry for this event in the current state.
    NotValidInState,

    /// The transition function refused the event.
    Guard(GuardViolation),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Terminal => write!(f, "instance is terminal"),
            Rejection::NotValidInState => write!(f, "event not valid in current state"),
            Rejection::Guard(violation) => write!(f, "guard violation: {violation}"),
        }
    }
}

/// Outcome of evaluating an event against the table.
pub enum Decision<W: Workflow> {
    Apply(Step<W>),
    Ignore(Rejection),
}

impl<W: Workflow> fmt::Debug for Decision<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Apply(step) => f.debug_tuple("Apply").field(step).finish(),
            Decision::Ignore(rejection) => f.debug_tuple("Ignore").field(rejection).finish(),
        }
    }
}

/// Map from `(state, event type)` to a transition function.
pub struct TransitionTable<W: Workflow> {
    routes: HashMap<(W::State, &'static str), TransitionFn<W>>,
}

impl<W: Workflow> Default for TransitionTable<W> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<W: Workflow> TransitionTable<W> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transition, replacing any previous entry for the same key.
    pub fn on(mut self, state: W::State, event_type: &'static str, f: TransitionFn<W>) -> Self {
        self.routes.insert((state, event_type), f);
        self
    }

    /// Registers the same transition for several states.
    pub fn on_each(
        mut self,
        states: &[W::State],
        event_type: &'static str,
        f: TransitionFn<W>,
    ) -> Self {
        for state in states {
            self.routes.insert((*state, event_type), f);
        }
        self
    }

    /// Returns true if the table has an entry for the key.
    pub fn contains(&self, state: W::State, event_type: &str) -> bool {
        self.routes.contains_key(&(state, event_type))
    }

    /// Returns the number of registered transitions.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if no transition is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Returns the event types accepted in a state.
    pub fn accepted_in(&self, state: W::State) -> Vec<&'static str> {
        let mut events: Vec<_> = self
            .routes
            .keys()
            .filter(|(s, _)| *s == state)
            .map(|(_, e)| *e)
            .collect();
        events.sort_unstable();
        events
    }

    /// Evaluates an event against the current state and data.
    pub fn decide(&self, state: W::State, data: &W::Data, event: &W::Event) -> Decision<W> {
        if state.is_terminal() {
            return Decision::Ignore(Rejection::Terminal);
        }

        match self.routes.get(&(state, event.event_type())) {
            None => Decision::Ignore(Rejection::NotValidInState),
            Some(f) => match f(state, data, event) {
                Ok(step) => Decision::Apply(step),
                Err(violation) => Decision::Ignore(Rejection::Guard(violation)),
            },
        }
    }
}

/// Writes a write-once field.
///
/// Setting an empty slot stores the value; setting it again to the same
/// value is a no-op; any other value is a [`GuardViolation::FieldFrozen`].
pub fn set_once<T: PartialEq>(
    slot: &mut Option<T>,
    value: T,
    field: &'static str,
) -> Result<(), GuardViolation> {
    match slot {
        Some(existing) if *existing != value => Err(GuardViolation::FieldFrozen { field }),
        Some(_) => Ok(()),
        None => {
            *slot = Some(value);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_once_fills_empty_slot() {
        let mut slot = None;
        set_once(&mut slot, "r-1".to_string(), "reservation_id").unwrap();
        assert_eq!(slot.as_deref(), Some("r-1"));
    }

    #[test]
    fn set_once_accepts_same_value() {
        let mut slot = Some("r-1".to_string());
        assert!(set_once(&mut slot, "r-1".to_string(), "reservation_id").is_ok());
    }

    #[test]
    fn set_once_rejects_different_value() {
        let mut slot = Some("r-1".to_string());
        let err = set_once(&mut slot, "r-2".to_string(), "reservation_id").unwrap_err();
        assert_eq!(
            err,
            GuardViolation::FieldFrozen {
                field: "reservation_id"
            }
        );
        assert_eq!(slot.as_deref(), Some("r-1"));
    }

    #[test]
    fn rejection_display() {
        assert_eq!(Rejection::Terminal.to_string(), "instance is terminal");
        let guard = Rejection::Guard(GuardViolation::MissingField { field: "amount" });
        assert_eq!(guard.to_string(), "guard violation: Missing field: amount");
    }
}
