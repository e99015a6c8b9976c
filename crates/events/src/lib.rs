//! Event system for cluster operations
//!
//! This crate provides the event bus and the plan, phase and agent events
//! published while an operation runs.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
