//! HTTP route handlers.

pub mod dead_letters;
pub mod events;
pub mod health;
pub mod metrics;
pub mod sagas;
