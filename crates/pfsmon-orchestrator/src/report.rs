//! Run reports and status snapshots

use chrono::{DateTime, Utc};
use pfsmon_agent::AgentHealth;
use pfsmon_core::{HostId, HostState, Role, StepKind, StepState};
use pfsmon_planning::StepId;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Result of one install step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: StepId,
    pub host: HostId,
    pub role: Role,
    pub name: String,
    pub kind: StepKind,
    pub state: StepState,
    pub attempts: u32,
    /// The check command showed the step was already done
    #[serde(default)]
    pub already_satisfied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_because: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.host, self.role, self.name)
    }
}

/// Result of one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub address: HostId,
    pub roles: Vec<Role>,
    pub state: HostState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_because: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_health: Option<AgentHealth>,
    #[serde(default)]
    pub monitoring_degraded: bool,
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every host succeeded and every agent is healthy
    Success,
    /// Some hosts failed or were skipped, or monitoring is degraded
    Partial,
    Cancelled,
    /// Still running (status snapshots only)
    Running,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Success => write!(f, "success"),
            RunOutcome::Partial => write!(f, "partial failure"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
            RunOutcome::Running => write!(f, "running"),
        }
    }
}

/// Full per-host and per-step account of a run
///
/// Written as the live status snapshot while the run is going and
/// returned as the final report when it ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled: bool,
    pub hosts: Vec<HostRecord>,
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    pub fn outcome(&self) -> RunOutcome {
        if self.finished_at.is_none() {
            RunOutcome::Running
        } else if self.cancelled {
            RunOutcome::Cancelled
        } else if self
            .hosts
            .iter()
            .all(|h| h.state == HostState::Succeeded && !h.monitoring_degraded)
        {
            RunOutcome::Success
        } else {
            RunOutcome::Partial
        }
    }

    /// Process exit code: 0 on full success, 2 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.outcome() {
            RunOutcome::Success => 0,
            _ => 2,
        }
    }

    pub fn host(&self, address: &str) -> Option<&HostRecord> {
        self.hosts.iter().find(|h| h.address == address)
    }

    pub fn step(&self, host: &str, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.host == host && s.name == name)
    }

    pub fn count_steps(&self, state: StepState) -> usize {
        self.steps.iter().filter(|s| s.state == state).count()
    }

    /// Human-readable summary
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Run {} ({})", self.run_id, self.outcome());
        let _ = writeln!(
            out,
            "Steps: {} succeeded, {} failed, {} skipped, {} pending, {} in progress",
            self.count_steps(StepState::Succeeded),
            self.count_steps(StepState::Failed),
            self.count_steps(StepState::Skipped),
            self.count_steps(StepState::Pending),
            self.count_steps(StepState::InProgress),
        );
        let _ = writeln!(out);

        for host in &self.hosts {
            let roles: Vec<&str> = host.roles.iter().map(Role::as_str).collect();
            let _ = write!(out, "  {:<20} {:<12} [{}]", host.address, host.state, roles.join(","));
            if let Some(health) = host.agent_health {
                let _ = write!(out, " agent: {}", health);
            }
            if host.monitoring_degraded {
                let _ = write!(out, " (monitoring degraded)");
            }
            out.push('\n');

            if let Some(step) = &host.failed_step {
                let _ = writeln!(
                    out,
                    "      failed at '{}': {}",
                    step,
                    host.last_error.as_deref().unwrap_or("unknown error")
                );
            } else if let Some(reason) = &host.skipped_because {
                let _ = writeln!(out, "      {}", reason);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(state: HostState, degraded: bool) -> HostRecord {
        HostRecord {
            address: "oss01".to_string(),
            roles: vec![Role::ObjectStorage],
            state,
            failed_step: None,
            last_error: None,
            skipped_because: None,
            agent_health: None,
            monitoring_degraded: degraded,
        }
    }

    fn report(hosts: Vec<HostRecord>, finished: bool, cancelled: bool) -> RunReport {
        RunReport {
            run_id: "test".to_string(),
            started_at: Utc::now(),
            finished_at: finished.then(Utc::now),
            cancelled,
            hosts,
            steps: Vec::new(),
        }
    }

    #[test]
    fn test_outcomes_and_exit_codes() {
        let ok = report(vec![host(HostState::Succeeded, false)], true, false);
        assert_eq!(ok.outcome(), RunOutcome::Success);
        assert_eq!(ok.exit_code(), 0);

        let failed = report(vec![host(HostState::Failed, false)], true, false);
        assert_eq!(failed.outcome(), RunOutcome::Partial);
        assert_eq!(failed.exit_code(), 2);

        let degraded = report(vec![host(HostState::Succeeded, true)], true, false);
        assert_eq!(degraded.exit_code(), 2);

        let cancelled = report(vec![host(HostState::Succeeded, false)], true, true);
        assert_eq!(cancelled.outcome(), RunOutcome::Cancelled);
        assert_eq!(cancelled.exit_code(), 2);

        let running = report(vec![host(HostState::InProgress, false)], false, false);
        assert_eq!(running.outcome(), RunOutcome::Running);
    }

    #[test]
    fn test_render_shows_failures() {
        let mut failed = host(HostState::Failed, false);
        failed.failed_step = Some("push config".to_string());
        failed.last_error = Some("disk full".to_string());

        let text = report(vec![failed], true, false).render();
        assert!(text.contains("partial failure"));
        assert!(text.contains("failed at 'push config': disk full"));
    }

    #[test]
    fn test_report_json_round_trip() {
        let original = report(vec![host(HostState::Succeeded, false)], true, false);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }
}
