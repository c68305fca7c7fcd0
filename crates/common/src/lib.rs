//! Shared identifier types used across the saga workspace.

pub mod types;

pub use types::{BusinessKey, MessageId};
