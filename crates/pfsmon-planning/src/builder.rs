//! Expansion of registry + catalog into an install plan

use pfsmon_core::{Catalog, DependencyRule, HostId, HostRegistry, PfsError, Result, Role};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::plan::InstallPlan;
use crate::step::{InstallStep, StepId};

/// Builds install plans
pub struct PlanBuilder;

impl PlanBuilder {
    /// Build the plan for every host in `registry`
    ///
    /// Steps of one role on one host are chained in catalog order. Catalog
    /// dependency rules add cross-host edges. A rule whose prerequisite
    /// role no host holds (while some host holds the dependent role) is a
    /// `PfsError::Plan`, as is any cycle.
    pub fn build(registry: &HostRegistry, catalog: &Catalog) -> Result<InstallPlan> {
        Self::build_selection(registry, registry, catalog)
    }

    /// Build the plan for a subset of the cluster
    ///
    /// Prerequisites held only by hosts outside `selected` (but present in
    /// `full`) are taken as already installed.
    pub fn build_selection(
        selected: &HostRegistry,
        full: &HostRegistry,
        catalog: &Catalog,
    ) -> Result<InstallPlan> {
        let mut steps: Vec<InstallStep> = Vec::new();
        let mut index: HashMap<(HostId, Role, String), StepId> = HashMap::new();
        let mut first: HashMap<(HostId, Role), StepId> = HashMap::new();

        for host in selected.hosts() {
            for role in &host.roles {
                let mut prev: Option<StepId> = None;
                for template in catalog.steps_for(*role) {
                    let id = StepId(steps.len());
                    let predecessors: BTreeSet<StepId> = prev.into_iter().collect();

                    steps.push(InstallStep::from_template(
                        id,
                        &host.address,
                        *role,
                        template,
                        predecessors,
                    ));
                    index.insert((host.address.clone(), *role, template.name.clone()), id);
                    first.entry((host.address.clone(), *role)).or_insert(id);
                    prev = Some(id);
                }
            }
        }

        for rule in catalog.dependencies() {
            Self::apply_rule(rule, selected, full, &index, &first, &mut steps)?;
        }

        let plan = InstallPlan::new(steps)?;
        debug!(
            "Built install plan: {} steps on {} hosts",
            plan.len(),
            plan.hosts().len()
        );
        Ok(plan)
    }

    fn apply_rule(
        rule: &DependencyRule,
        selected: &HostRegistry,
        full: &HostRegistry,
        index: &HashMap<(HostId, Role, String), StepId>,
        first: &HashMap<(HostId, Role), StepId>,
        steps: &mut [InstallStep],
    ) -> Result<()> {
        let dependents: Vec<&HostId> = selected.with_role(rule.role).map(|h| &h.address).collect();
        if dependents.is_empty() {
            return Ok(());
        }

        let prerequisites: Vec<&HostId> = selected
            .with_role(rule.requires_role)
            .map(|h| &h.address)
            .collect();

        if prerequisites.is_empty() {
            if full.with_role(rule.requires_role).next().is_some() {
                debug!(
                    "'{}' of role '{}' is outside the selection, assuming it is installed",
                    rule.requires_step, rule.requires_role
                );
                return Ok(());
            }
            return Err(PfsError::Plan(format!(
                "role '{}' requires '{}' of role '{}', but no host has role '{}'",
                rule.role, rule.requires_step, rule.requires_role, rule.requires_role
            )));
        }

        for host in dependents {
            let target = match &rule.step {
                Some(name) => index.get(&(host.clone(), rule.role, name.clone())),
                None => first.get(&(host.clone(), rule.role)),
            }
            .copied()
            .ok_or_else(|| {
                PfsError::Plan(format!(
                    "no step of role '{}' on host '{}' matches a dependency rule",
                    rule.role, host
                ))
            })?;

            for prereq in &prerequisites {
                let pred = index
                    .get(&((*prereq).clone(), rule.requires_role, rule.requires_step.clone()))
                    .copied()
                    .ok_or_else(|| {
                        PfsError::Plan(format!(
                            "host '{}' has no step '{}'",
                            prereq, rule.requires_step
                        ))
                    })?;
                steps[target.0].predecessors.insert(pred);
            }
        }
        Ok(())
    }
}
