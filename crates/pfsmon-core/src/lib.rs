//! # pfsmon-core
//!
//! Core types for the pfsmon cluster installer and monitoring agent manager.
//!
//! pfsmon provisions a parallel-filesystem cluster (management, metadata and
//! object-storage nodes plus clients) and keeps a collector agent running on
//! every node that installed cleanly.
//!
//! ## Core Paradigm
//!
//! - Hosts carry roles; roles select install steps from the catalog
//! - Ordering comes from an explicit dependency graph, never from names
//! - One failed host never aborts its siblings
//! - Every run ends in a full per-host report

pub mod catalog;
mod config;
mod error;
pub mod fail_open;
pub mod registry;
pub mod retry;
mod types;

pub use catalog::{Catalog, DependencyRule, StepKind, StepTemplate};
pub use config::{AgentConfig, OrchestratorSettings, PfsmonConfig, PipelineConfig, TransportConfig};
pub use error::{PfsError, Result};
pub use registry::HostRegistry;
pub use retry::{ExponentialBackoff, RetryPolicies, RetryPolicy};
pub use types::*;
