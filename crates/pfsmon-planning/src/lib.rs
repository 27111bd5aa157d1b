//! pfsmon Planning - install plan construction
//!
//! This crate expands the host registry and the role catalog into an
//! explicit DAG of per-host install steps. Cross-host ordering comes only
//! from the catalog's dependency rules.

pub mod builder;
pub mod plan;
pub mod step;

pub use builder::PlanBuilder;
pub use plan::InstallPlan;
pub use step::{InstallStep, StepAction, StepId};
