//! # pfsmon-orchestrator
//!
//! Install run engine for pfsmon.
//!
//! This crate provides:
//! - The pure step state machine
//! - The run state store and its reports
//! - The control loop that executes an install plan across hosts
//!   with bounded parallelism, retries and cancellation

mod orchestrator;
mod report;
mod state_machine;
mod store;

pub use orchestrator::{CancelHandle, Orchestrator, OrchestratorConfig};
pub use report::{HostRecord, RunOutcome, RunReport, StepRecord};
pub use state_machine::{retry_delay, transition, Action, Event};
pub use store::StateStore;
