//! The install plan: an acyclic graph of install steps

use pfsmon_core::{HostId, PfsError, Result};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt::Write;

use crate::step::{InstallStep, StepAction, StepId};

/// Validated, acyclic set of install steps
///
/// Built once per run and never mutated; execution state lives in the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    steps: Vec<InstallStep>,
    successors: Vec<Vec<StepId>>,
    order: Vec<StepId>,
}

impl InstallPlan {
    /// Build a plan from steps whose ids equal their positions
    ///
    /// Fails with `PfsError::Plan` on a dangling predecessor or a cycle.
    pub fn new(steps: Vec<InstallStep>) -> Result<Self> {
        let mut successors = vec![Vec::new(); steps.len()];

        for (index, step) in steps.iter().enumerate() {
            if step.id.0 != index {
                return Err(PfsError::Plan(format!(
                    "step {} is stored at position {}",
                    step.id, index
                )));
            }
            for pred in &step.predecessors {
                let slot = successors.get_mut(pred.0).ok_or_else(|| {
                    PfsError::Plan(format!(
                        "step {} depends on unknown step {}",
                        step.label(),
                        pred
                    ))
                })?;
                slot.push(step.id);
            }
        }

        let order = topological_sort(&steps, &successors)?;
        Ok(Self {
            steps,
            successors,
            order,
        })
    }

    pub fn steps(&self) -> &[InstallStep] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> Option<&InstallStep> {
        self.steps.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in an order where every step follows its predecessors
    pub fn topological_order(&self) -> &[StepId] {
        &self.order
    }

    /// Direct successors of a step
    pub fn successors(&self, id: StepId) -> &[StepId] {
        self.successors.get(id.0).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every step that transitively depends on `id`, in id order
    pub fn dependents(&self, id: StepId) -> Vec<StepId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<StepId> = self.successors(id).iter().copied().collect();

        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.successors(next).iter().copied());
            }
        }
        seen.into_iter().collect()
    }

    pub fn steps_for_host<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a InstallStep> {
        self.steps.iter().filter(move |s| s.host == host)
    }

    /// Hosts with at least one step, in plan order
    pub fn hosts(&self) -> Vec<HostId> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .filter(|s| seen.insert(s.host.as_str()))
            .map(|s| s.host.clone())
            .collect()
    }

    /// Look a step up by host and name
    pub fn find(&self, host: &str, name: &str) -> Option<&InstallStep> {
        self.steps.iter().find(|s| s.host == host && s.name == name)
    }

    /// Human-readable plan for dry runs
    pub fn render(&self) -> String {
        let hosts = self.hosts();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Install plan: {} steps on {} hosts",
            self.steps.len(),
            hosts.len()
        );

        for host in &hosts {
            let _ = writeln!(out, "\n{}", host);
            for step in self.steps_for_host(host) {
                let what = match &step.action {
                    StepAction::Run { command } => command.clone(),
                    StepAction::Push { local, remote } => {
                        format!("{} -> {}", local.display(), remote)
                    }
                };
                let _ = write!(
                    out,
                    "  {:>5}  {}/{} [{}] {}",
                    step.id.to_string(),
                    step.role,
                    step.name,
                    step.kind,
                    what
                );

                let foreign: Vec<String> = step
                    .predecessors
                    .iter()
                    .filter_map(|p| self.step(*p))
                    .filter(|p| p.host != step.host)
                    .map(|p| format!("{} ({})", p.id, p.label()))
                    .collect();
                if !foreign.is_empty() {
                    let _ = write!(out, "\n         after {}", foreign.join(", "));
                }
                if let Some(check) = &step.check {
                    let _ = write!(out, "\n         skip if: {}", check);
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Kahn's algorithm; ready steps are taken lowest id first
fn topological_sort(steps: &[InstallStep], successors: &[Vec<StepId>]) -> Result<Vec<StepId>> {
    let mut in_degree: Vec<usize> = steps.iter().map(|s| s.predecessors.len()).collect();
    let mut ready: BTreeSet<StepId> = steps
        .iter()
        .filter(|s| s.predecessors.is_empty())
        .map(|s| s.id)
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(id) = ready.pop_first() {
        order.push(id);
        for succ in &successors[id.0] {
            in_degree[succ.0] -= 1;
            if in_degree[succ.0] == 0 {
                ready.insert(*succ);
            }
        }
    }

    if order.len() < steps.len() {
        let stuck: Vec<String> = steps
            .iter()
            .filter(|s| in_degree[s.id.0] > 0)
            .take(5)
            .map(InstallStep::label)
            .collect();
        return Err(PfsError::Plan(format!(
            "dependency cycle among install steps: {}",
            stuck.join(", ")
        )));
    }

    Ok(order)
}
