//! Install step definitions

use pfsmon_core::{HostId, Role, StepKind, StepTemplate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Index of a step within its plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub usize);

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a step does on its host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Run { command: String },
    Push { local: PathBuf, remote: String },
}

/// One unit of install work bound to a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallStep {
    pub id: StepId,
    pub host: HostId,
    pub role: Role,
    pub name: String,
    pub kind: StepKind,
    pub action: StepAction,
    /// Exits 0 when the step is already satisfied
    pub check: Option<String>,
    pub retryable: bool,
    pub timeout: Option<Duration>,
    /// Steps that must succeed before this one runs
    pub predecessors: BTreeSet<StepId>,
}

impl InstallStep {
    pub(crate) fn from_template(
        id: StepId,
        host: &str,
        role: Role,
        template: &StepTemplate,
        predecessors: BTreeSet<StepId>,
    ) -> Self {
        let action = match (&template.local, &template.remote) {
            (Some(local), Some(remote)) if template.kind == StepKind::Push => StepAction::Push {
                local: local.clone(),
                remote: remote.clone(),
            },
            _ => StepAction::Run {
                command: template.command.clone().unwrap_or_default(),
            },
        };

        Self {
            id,
            host: host.to_string(),
            role,
            name: template.name.clone(),
            kind: template.kind,
            action,
            check: template.check.clone(),
            retryable: template.is_retryable(),
            timeout: template.timeout(),
            predecessors,
        }
    }

    /// `host/role/name`, used in logs and reports
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.host, self.role, self.name)
    }
}
