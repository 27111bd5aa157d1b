//! # pfsmon-agent
//!
//! Collector agent lifecycle for pfsmon.
//!
//! Once a host has installed cleanly, its collector agent is started and
//! verified through the remote executor, then supervised until teardown.
//! An agent that will not come up degrades monitoring for that host; it
//! never fails the install.

mod manager;
mod types;

pub use manager::AgentManager;
pub use types::*;
