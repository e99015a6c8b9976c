//! Core abstractions for phase execution.
//!
//! - [`PhaseExecutor`] - Contract every phase implementation satisfies
//! - [`ExecContext`] - Cancellable scope handed to each executor call
//! - [`ExecutorParams`] - Read-only view of the phase and its plan

mod executor;

pub use executor::{ExecContext, ExecutorParams, PhaseExecutor};
