//! Authoritative step and host state for a run
//!
//! Only the orchestrator control loop writes. Readers get consistent
//! snapshots through `status()`.

use chrono::{DateTime, Utc};
use pfsmon_agent::AgentHealth;
use pfsmon_core::{HostRegistry, HostState, StepState};
use pfsmon_planning::{InstallPlan, StepId};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::report::{HostRecord, RunReport, StepRecord};
use crate::state_machine::{transition, Action, Event};

/// Outcome of applying one event
#[derive(Debug, Clone)]
pub(crate) struct Applied {
    pub state: StepState,
    pub actions: Vec<Action>,
    /// New host rollup, when it changed
    pub host_change: Option<HostState>,
}

struct StoreInner {
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    cancelled: bool,
    steps: Vec<StepRecord>,
    hosts: Vec<HostRecord>,
    host_index: HashMap<String, usize>,
    host_steps: Vec<Vec<StepId>>,
}

pub struct StateStore {
    inner: RwLock<StoreInner>,
}

impl StateStore {
    /// Fresh store: every step Pending
    ///
    /// Registry hosts without any step start out Succeeded.
    pub fn new(run_id: impl Into<String>, plan: &InstallPlan, registry: &HostRegistry) -> Self {
        let steps: Vec<StepRecord> = plan
            .steps()
            .iter()
            .map(|s| StepRecord {
                id: s.id,
                host: s.host.clone(),
                role: s.role,
                name: s.name.clone(),
                kind: s.kind,
                state: StepState::Pending,
                attempts: 0,
                already_satisfied: false,
                error: None,
                skipped_because: None,
                started_at: None,
                finished_at: None,
            })
            .collect();

        let mut hosts = Vec::with_capacity(registry.len());
        let mut host_index = HashMap::new();
        let mut host_steps = Vec::with_capacity(registry.len());
        for host in registry.hosts() {
            let ids: Vec<StepId> = plan.steps_for_host(&host.address).map(|s| s.id).collect();
            host_index.insert(host.address.clone(), hosts.len());
            hosts.push(HostRecord {
                address: host.address.clone(),
                roles: host.roles.iter().copied().collect(),
                state: if ids.is_empty() {
                    HostState::Succeeded
                } else {
                    HostState::Pending
                },
                failed_step: None,
                last_error: None,
                skipped_because: None,
                agent_health: None,
                monitoring_degraded: false,
            });
            host_steps.push(ids);
        }

        Self {
            inner: RwLock::new(StoreInner {
                run_id: run_id.into(),
                started_at: Utc::now(),
                finished_at: None,
                cancelled: false,
                steps,
                hosts,
                host_index,
                host_steps,
            }),
        }
    }

    /// Consistent snapshot of the whole run
    pub async fn status(&self) -> RunReport {
        let inner = self.inner.read().await;
        RunReport {
            run_id: inner.run_id.clone(),
            started_at: inner.started_at,
            finished_at: inner.finished_at,
            cancelled: inner.cancelled,
            hosts: inner.hosts.clone(),
            steps: inner.steps.clone(),
        }
    }

    pub async fn step_state(&self, id: StepId) -> Option<StepState> {
        self.inner.read().await.steps.get(id.0).map(|s| s.state)
    }

    pub async fn attempts(&self, id: StepId) -> u32 {
        self.inner
            .read()
            .await
            .steps
            .get(id.0)
            .map(|s| s.attempts)
            .unwrap_or(0)
    }

    pub async fn host_state(&self, address: &str) -> Option<HostState> {
        let inner = self.inner.read().await;
        inner
            .host_index
            .get(address)
            .map(|i| inner.hosts[*i].state)
    }

    /// Hosts whose rollup is currently Succeeded
    pub async fn succeeded_hosts(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .hosts
            .iter()
            .filter(|h| h.state == HostState::Succeeded)
            .map(|h| h.address.clone())
            .collect()
    }

    /// Run the state machine for one step and record the result
    pub(crate) async fn apply(&self, id: StepId, event: Event) -> Applied {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.steps.get_mut(id.0) else {
            return Applied {
                state: StepState::Failed,
                actions: Vec::new(),
                host_change: None,
            };
        };

        let now = Utc::now();
        let (state, actions) = transition(record.state, event);
        record.state = state;

        for action in &actions {
            match action {
                Action::Execute => {
                    record.attempts += 1;
                    record.started_at.get_or_insert(now);
                }
                Action::ReleaseDependents => {
                    // Errors from retried attempts don't outlive a success
                    record.error = None;
                    record.already_satisfied = actions
                        .iter()
                        .any(|a| matches!(a, Action::LogActivity { .. }));
                }
                Action::RecordError { error } => record.error = Some(error.clone()),
                Action::RecordSkip { reason } => record.skipped_because = Some(reason.clone()),
                _ => {}
            }
        }
        if state.is_terminal() {
            record.finished_at = Some(now);
        }

        let host = record.host.clone();
        let host_change = inner.rollup(&host);

        Applied {
            state,
            actions,
            host_change,
        }
    }

    pub(crate) async fn set_agent(&self, address: &str, health: AgentHealth, degraded: bool) {
        let mut inner = self.inner.write().await;
        if let Some(index) = inner.host_index.get(address).copied() {
            let host = &mut inner.hosts[index];
            host.agent_health = Some(health);
            host.monitoring_degraded = degraded;
        }
    }

    pub(crate) async fn mark_cancelled(&self) {
        self.inner.write().await.cancelled = true;
    }

    pub(crate) async fn mark_finished(&self) {
        self.inner.write().await.finished_at = Some(Utc::now());
    }
}

impl StoreInner {
    /// Recompute one host's state from its steps; returns it if it changed
    fn rollup(&mut self, address: &str) -> Option<HostState> {
        let index = *self.host_index.get(address)?;
        let states: Vec<&StepRecord> = self.host_steps[index]
            .iter()
            .map(|id| &self.steps[id.0])
            .collect();

        let failed = states.iter().find(|s| s.state == StepState::Failed);
        let all = |state: StepState| states.iter().all(|s| s.state == state);

        let new_state = if failed.is_some() {
            HostState::Failed
        } else if all(StepState::Succeeded) {
            HostState::Succeeded
        } else if all(StepState::Pending) {
            HostState::Pending
        } else if states.iter().all(|s| s.state.is_terminal()) {
            HostState::Skipped
        } else {
            HostState::InProgress
        };

        let failed_step = failed.map(|s| (s.name.clone(), s.error.clone()));
        let skip_reason = states
            .iter()
            .find(|s| s.state == StepState::Skipped)
            .and_then(|s| s.skipped_because.clone());

        let host = &mut self.hosts[index];
        if let Some((name, error)) = failed_step {
            host.failed_step = Some(name);
            host.last_error = error;
        }
        if new_state == HostState::Skipped {
            host.skipped_because = skip_reason;
        }

        if host.state == new_state {
            None
        } else {
            host.state = new_state;
            Some(new_state)
        }
    }
}
