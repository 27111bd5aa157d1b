//! Install run control loop
//!
//! A single task owns scheduling: it feeds ready steps to at most
//! `workers` concurrent workers, applies their results through the state
//! machine and the store, and starts collector agents on hosts as they
//! finish installing.

use pfsmon_agent::{AgentHealth, AgentManager, CollectorAgent};
use pfsmon_core::{
    Host, HostId, HostRegistry, HostState, OrchestratorSettings, PfsError, Result, RetryPolicies,
    StepState,
};
use pfsmon_planning::{InstallPlan, InstallStep, StepAction, StepId};
use pfsmon_remote::RemoteExecutor;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::report::RunReport;
use crate::state_machine::{retry_delay, Action, Event};
use crate::store::StateStore;

/// Configuration for an install run
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum steps executing at once
    pub workers: usize,
    /// Timeout for steps that don't set their own
    pub command_timeout: Duration,
    pub retry: RetryPolicies,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &OrchestratorSettings, retry: RetryPolicies) -> Self {
        Self {
            workers: settings.workers.max(1),
            command_timeout: settings.command_timeout(),
            retry,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&OrchestratorSettings::default(), RetryPolicies::default())
    }
}

/// Requests cancellation of a running install
///
/// Steps not yet started are skipped; steps already running finish but
/// are not retried.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

enum Msg {
    Finished { id: StepId, outcome: Result<bool> },
    RetryDue { id: StepId },
    AgentDone { host: HostId, result: Result<CollectorAgent> },
}

/// Drives one install plan to completion
pub struct Orchestrator {
    plan: Arc<InstallPlan>,
    hosts: HashMap<HostId, Host>,
    executor: Arc<dyn RemoteExecutor>,
    config: OrchestratorConfig,
    agents: Option<Arc<AgentManager>>,
    store: Arc<StateStore>,
    cancel: Arc<watch::Sender<bool>>,
}

/// Mutable bookkeeping of the control loop
struct LoopState {
    remaining_preds: Vec<usize>,
    ready: BTreeSet<StepId>,
    in_flight: usize,
    waiting_retry: usize,
    /// Agent starts still running, by host
    agent_tasks: HashMap<HostId, AbortHandle>,
    cancelled: bool,
}

impl Orchestrator {
    pub fn new(
        plan: InstallPlan,
        registry: &HostRegistry,
        executor: Arc<dyn RemoteExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        let store = Arc::new(StateStore::new(run_id, &plan, registry));
        let hosts = registry
            .hosts()
            .iter()
            .map(|h| (h.address.clone(), h.clone()))
            .collect();
        let (cancel, _) = watch::channel(false);

        Self {
            plan: Arc::new(plan),
            hosts,
            executor,
            config,
            agents: None,
            store,
            cancel: Arc::new(cancel),
        }
    }

    /// Start a collector agent on every host that installs cleanly
    pub fn with_agent_manager(mut self, agents: Arc<AgentManager>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel),
        }
    }

    /// Shared state, for status snapshots while the run is going
    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    pub fn plan(&self) -> &InstallPlan {
        &self.plan
    }

    /// Execute the plan and return the final report
    ///
    /// Failures never abort the run: a failed step only skips what
    /// depends on it, and everything else keeps going.
    pub async fn run(self) -> RunReport {
        let report = self.store.status().await;
        info!(
            "Starting install run {}: {} steps on {} hosts, {} workers",
            report.run_id,
            self.plan.len(),
            self.hosts.len(),
            self.config.workers
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        let mut cancel_rx = self.cancel.subscribe();

        let remaining_preds: Vec<usize> = self
            .plan
            .steps()
            .iter()
            .map(|s| s.predecessors.len())
            .collect();
        let ready = self
            .plan
            .steps()
            .iter()
            .filter(|s| s.predecessors.is_empty())
            .map(|s| s.id)
            .collect();
        let mut st = LoopState {
            remaining_preds,
            ready,
            in_flight: 0,
            waiting_retry: 0,
            agent_tasks: HashMap::new(),
            cancelled: false,
        };

        if *cancel_rx.borrow_and_update() {
            self.cancel_pending(&mut st).await;
        }

        // Hosts with nothing to install are done already
        for address in self.store.succeeded_hosts().await {
            self.spawn_agent(address, &tx, &mut st);
        }

        loop {
            while !st.cancelled && st.in_flight < self.config.workers {
                let Some(id) = st.ready.pop_first() else {
                    break;
                };
                self.dispatch(id, &tx, &mut st).await;
            }

            let idle = st.in_flight == 0 && st.waiting_retry == 0 && st.agent_tasks.is_empty();
            if idle && (st.ready.is_empty() || st.cancelled) {
                break;
            }

            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg, &tx, &mut st).await,
                    None => break,
                },
                changed = cancel_rx.changed(), if !st.cancelled => {
                    if changed.is_ok() && *cancel_rx.borrow_and_update() {
                        self.cancel_pending(&mut st).await;
                    }
                }
            }
        }

        self.finish(&st).await
    }

    async fn dispatch(&self, id: StepId, tx: &mpsc::UnboundedSender<Msg>, st: &mut LoopState) {
        let Some(step) = self.plan.step(id).cloned() else {
            return;
        };

        let applied = self.store.apply(id, Event::Dispatched).await;
        if applied.state != StepState::InProgress {
            error!("Could not dispatch {}: state is {}", step.label(), applied.state);
            return;
        }
        if let Some(state) = applied.host_change {
            debug!("Host {} is now {}", step.host, state);
        }
        debug!("Dispatching {}", step.label());

        st.in_flight += 1;
        let executor = Arc::clone(&self.executor);
        let timeout = step.timeout.unwrap_or(self.config.command_timeout);
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = execute_step(executor.as_ref(), &step, timeout).await;
            let _ = tx.send(Msg::Finished { id, outcome });
        });
    }

    async fn handle(&self, msg: Msg, tx: &mpsc::UnboundedSender<Msg>, st: &mut LoopState) {
        match msg {
            Msg::Finished { id, outcome } => {
                st.in_flight = st.in_flight.saturating_sub(1);
                self.step_finished(id, outcome, tx, st).await;
            }
            Msg::RetryDue { id } => {
                st.waiting_retry = st.waiting_retry.saturating_sub(1);
                if !st.cancelled && self.store.step_state(id).await == Some(StepState::Pending) {
                    st.ready.insert(id);
                }
            }
            Msg::AgentDone { host, result } => {
                if st.agent_tasks.remove(&host).is_none() {
                    // Abandoned at cancellation
                    return;
                }
                match result {
                    Ok(agent) => {
                        info!("Collector agent on {} is {}", host, agent.health);
                        self.store.set_agent(&host, agent.health, false).await;
                    }
                    Err(e) => {
                        warn!("Monitoring degraded on {}: {}", host, e);
                        self.store
                            .set_agent(&host, AgentHealth::Unhealthy, true)
                            .await;
                    }
                }
            }
        }
    }

    async fn step_finished(
        &self,
        id: StepId,
        outcome: Result<bool>,
        tx: &mpsc::UnboundedSender<Msg>,
        st: &mut LoopState,
    ) {
        let Some(step) = self.plan.step(id) else {
            return;
        };
        let label = step.label();

        let event = match outcome {
            Ok(already_satisfied) => Event::Completed { already_satisfied },
            Err(e) => {
                let attempts = self.store.attempts(id).await;
                let policy = self.config.retry.for_kind(step.kind);
                let retry_after = if st.cancelled {
                    None
                } else {
                    retry_delay(step.kind, step.retryable, &e, attempts, &policy)
                };
                Event::Failed {
                    error: e.to_string(),
                    retry_after,
                }
            }
        };

        let applied = self.store.apply(id, event).await;
        for action in applied.actions {
            match action {
                Action::ScheduleRetry { delay } => {
                    st.waiting_retry += 1;
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(Msg::RetryDue { id });
                    });
                }
                Action::ReleaseDependents => {
                    info!("{} succeeded", label);
                    for &next in self.plan.successors(id) {
                        let count = &mut st.remaining_preds[next.0];
                        *count = count.saturating_sub(1);
                        if *count == 0
                            && !st.cancelled
                            && self.store.step_state(next).await == Some(StepState::Pending)
                        {
                            st.ready.insert(next);
                        }
                    }
                }
                Action::SkipDependents => self.skip_dependents(id, &label, tx, st).await,
                Action::RecordError { error } if applied.state == StepState::Failed => {
                    error!("{} failed: {}", label, error);
                }
                Action::LogActivity { message } => {
                    if applied.state == StepState::Pending {
                        warn!("{} {}", label, message);
                    } else {
                        info!("{} {}", label, message);
                    }
                }
                _ => {}
            }
        }

        self.host_changed(&step.host, applied.host_change, tx, st);
    }

    async fn skip_dependents(
        &self,
        id: StepId,
        cause: &str,
        tx: &mpsc::UnboundedSender<Msg>,
        st: &mut LoopState,
    ) {
        for dependent in self.plan.dependents(id) {
            if self.store.step_state(dependent).await != Some(StepState::Pending) {
                continue;
            }
            st.ready.remove(&dependent);
            let applied = self
                .store
                .apply(
                    dependent,
                    Event::DependencyFailed {
                        cause: cause.to_string(),
                    },
                )
                .await;
            if let Some(step) = self.plan.step(dependent) {
                debug!("Skipping {}: {} failed", step.label(), cause);
                self.host_changed(&step.host, applied.host_change, tx, st);
            }
        }
    }

    fn host_changed(
        &self,
        address: &str,
        change: Option<HostState>,
        tx: &mpsc::UnboundedSender<Msg>,
        st: &mut LoopState,
    ) {
        match change {
            Some(HostState::Succeeded) => {
                info!("Host {} installed", address);
                self.spawn_agent(address.to_string(), tx, st);
            }
            Some(HostState::Failed) => error!("Host {} failed", address),
            Some(HostState::Skipped) => warn!("Host {} skipped", address),
            Some(state) => debug!("Host {} is now {}", address, state),
            None => {}
        }
    }

    fn spawn_agent(&self, address: HostId, tx: &mpsc::UnboundedSender<Msg>, st: &mut LoopState) {
        if st.cancelled {
            return;
        }
        let Some(manager) = self.agents.as_ref().map(Arc::clone) else {
            return;
        };
        let Some(host) = self.hosts.get(&address).cloned() else {
            return;
        };

        let tx = tx.clone();
        let key = address.clone();
        let task = tokio::spawn(async move {
            let host = host.with_state(HostState::Succeeded);
            let result = manager.ensure_running(&host).await;
            let _ = tx.send(Msg::AgentDone {
                host: address,
                result,
            });
        });
        st.agent_tasks.insert(key, task.abort_handle());
    }

    /// Skip everything that has not started
    async fn cancel_pending(&self, st: &mut LoopState) {
        warn!("Install run cancelled, skipping steps that have not started");
        st.cancelled = true;
        st.ready.clear();
        // Pending retries are abandoned
        st.waiting_retry = 0;
        self.store.mark_cancelled().await;

        // So are agent starts still waiting for a healthy agent
        for (address, task) in st.agent_tasks.drain() {
            task.abort();
            debug!("Abandoned agent start on {}", address);
            self.store
                .set_agent(&address, AgentHealth::Unknown, false)
                .await;
        }

        for step in self.plan.steps() {
            if self.store.step_state(step.id).await == Some(StepState::Pending) {
                self.store.apply(step.id, Event::Cancelled).await;
            }
        }
    }

    async fn finish(&self, st: &LoopState) -> RunReport {
        // Nothing should be left, but never report a step as pending
        for step in self.plan.steps() {
            if self.store.step_state(step.id).await != Some(StepState::Pending) {
                continue;
            }
            let event = if st.cancelled {
                Event::Cancelled
            } else {
                Event::DependencyFailed {
                    cause: "prerequisites never completed".to_string(),
                }
            };
            self.store.apply(step.id, event).await;
        }

        self.store.mark_finished().await;
        let report = self.store.status().await;
        info!(
            "Install run {} finished: {} ({} succeeded, {} failed, {} skipped)",
            report.run_id,
            report.outcome(),
            report.count_steps(StepState::Succeeded),
            report.count_steps(StepState::Failed),
            report.count_steps(StepState::Skipped),
        );
        report
    }
}

/// Run one attempt of a step
///
/// Returns `Ok(true)` when the check command showed the step was already
/// satisfied and the action was skipped.
async fn execute_step(
    executor: &dyn RemoteExecutor,
    step: &InstallStep,
    timeout: Duration,
) -> Result<bool> {
    if let Some(check) = &step.check {
        match executor.run(&step.host, check, timeout).await {
            Ok(_) => return Ok(true),
            Err(PfsError::Exec { exit_code, .. }) => {
                debug!("{} check exited {}, running action", step.label(), exit_code);
            }
            Err(e) => return Err(e),
        }
    }

    match &step.action {
        StepAction::Run { command } => {
            executor.run(&step.host, command, timeout).await?;
        }
        StepAction::Push { local, remote } => {
            tokio::time::timeout(timeout, executor.push_file(&step.host, local, remote))
                .await
                .map_err(|_| PfsError::Timeout {
                    host: step.host.clone(),
                    after: timeout,
                })??;
        }
    }
    Ok(false)
}
