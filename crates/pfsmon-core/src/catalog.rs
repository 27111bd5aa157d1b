//! Role-to-step catalog
//!
//! The catalog is the read-only description of what to install: for every
//! role, an ordered list of step templates, plus the inter-role dependency
//! rules. It is loaded once, before any plan is built.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicies;
use crate::{PfsError, Result, Role};

/// Kind of an install step; selects the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Copy a file to the host
    Push,
    /// Run an arbitrary command
    Command,
    /// Start (or restart) a service
    ServiceStart,
    /// Check that the host is in the expected state
    Verify,
}

impl StepKind {
    /// Whether exec failures of this kind are retried when the catalog
    /// does not say otherwise
    pub fn default_retryable(&self) -> bool {
        matches!(self, Self::Push | Self::ServiceStart)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Command => write!(f, "command"),
            Self::ServiceStart => write!(f, "service_start"),
            Self::Verify => write!(f, "verify"),
        }
    }
}

/// One step a role needs, before it is bound to a host
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepTemplate {
    pub name: String,
    pub kind: StepKind,

    /// Command to run (all kinds except push)
    #[serde(default)]
    pub command: Option<String>,

    /// Local file to push (push only)
    #[serde(default)]
    pub local: Option<PathBuf>,

    /// Remote destination path (push only)
    #[serde(default)]
    pub remote: Option<String>,

    /// Command that exits 0 when the step is already satisfied
    #[serde(default)]
    pub check: Option<String>,

    /// Override the kind's default retryability
    #[serde(default)]
    pub retryable: Option<bool>,

    /// Per-step timeout override
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StepTemplate {
    pub fn is_retryable(&self) -> bool {
        if self.kind == StepKind::Verify {
            return false;
        }
        self.retryable.unwrap_or_else(|| self.kind.default_retryable())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self, role: Role) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PfsError::Config(format!(
                "role '{}' has a step with an empty name",
                role
            )));
        }

        match self.kind {
            StepKind::Push => {
                if self.local.is_none() || self.remote.is_none() {
                    return Err(PfsError::Config(format!(
                        "push step '{}' of role '{}' needs both 'local' and 'remote'",
                        self.name, role
                    )));
                }
            }
            _ => {
                let empty = self
                    .command
                    .as_deref()
                    .map(|c| c.trim().is_empty())
                    .unwrap_or(true);
                if empty {
                    return Err(PfsError::Config(format!(
                        "{} step '{}' of role '{}' needs a 'command'",
                        self.kind, self.name, role
                    )));
                }
            }
        }

        if self.kind == StepKind::Verify && self.retryable == Some(true) {
            return Err(PfsError::Config(format!(
                "verify step '{}' of role '{}' cannot be retryable",
                self.name, role
            )));
        }

        Ok(())
    }
}

/// "Steps of `role` depend on `requires_step` of every `requires_role` host"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRule {
    pub role: Role,
    /// Dependent step; the role's first step when absent
    pub step: Option<String>,
    pub requires_role: Role,
    pub requires_step: String,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    retry: RetryPolicies,
    #[serde(default)]
    roles: BTreeMap<String, RoleFile>,
    #[serde(default)]
    dependencies: Vec<RuleFile>,
}

#[derive(Debug, Deserialize)]
struct RoleFile {
    #[serde(default)]
    steps: Vec<StepTemplate>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    role: String,
    #[serde(default)]
    step: Option<String>,
    requires_role: String,
    requires_step: String,
}

/// Validated role-to-step catalog
#[derive(Debug, Clone)]
pub struct Catalog {
    retry: RetryPolicies,
    roles: BTreeMap<Role, Vec<StepTemplate>>,
    dependencies: Vec<DependencyRule>,
}

impl Catalog {
    /// Build a catalog programmatically (validated the same way as a file)
    pub fn new(
        roles: BTreeMap<Role, Vec<StepTemplate>>,
        dependencies: Vec<DependencyRule>,
        retry: RetryPolicies,
    ) -> Result<Self> {
        let catalog = Self {
            retry,
            roles,
            dependencies,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PfsError::Config(format!("Failed to read catalog {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)
            .map_err(|e| PfsError::Config(format!("Failed to parse catalog: {}", e)))?;

        let mut roles = BTreeMap::new();
        for (name, role_file) in file.roles {
            let role: Role = name.parse().map_err(PfsError::Config)?;
            if roles.insert(role, role_file.steps).is_some() {
                return Err(PfsError::Config(format!(
                    "role '{}' is declared more than once",
                    role
                )));
            }
        }

        let mut dependencies = Vec::with_capacity(file.dependencies.len());
        for rule in file.dependencies {
            dependencies.push(DependencyRule {
                role: rule.role.parse().map_err(PfsError::Config)?,
                step: rule.step,
                requires_role: rule.requires_role.parse().map_err(PfsError::Config)?,
                requires_step: rule.requires_step,
            });
        }

        Self::new(roles, dependencies, file.retry)
    }

    /// The catalog written by `pfsmon init`
    pub fn example() -> Result<Self> {
        Self::from_toml_str(DEFAULT_CATALOG_TOML)
    }

    fn validate(&self) -> Result<()> {
        for (role, steps) in &self.roles {
            let mut seen = HashSet::new();
            for step in steps {
                step.validate(*role)?;
                if !seen.insert(step.name.as_str()) {
                    return Err(PfsError::Config(format!(
                        "role '{}' declares step '{}' twice",
                        role, step.name
                    )));
                }
            }
        }

        for rule in &self.dependencies {
            let dependent = self.roles.get(&rule.role).ok_or_else(|| {
                PfsError::Config(format!(
                    "dependency rule references undefined role '{}'",
                    rule.role
                ))
            })?;
            let prerequisite = self.roles.get(&rule.requires_role).ok_or_else(|| {
                PfsError::Config(format!(
                    "dependency rule references undefined role '{}'",
                    rule.requires_role
                ))
            })?;

            if !prerequisite.iter().any(|s| s.name == rule.requires_step) {
                return Err(PfsError::Config(format!(
                    "role '{}' has no step '{}'",
                    rule.requires_role, rule.requires_step
                )));
            }

            match &rule.step {
                Some(step) if !dependent.iter().any(|s| &s.name == step) => {
                    return Err(PfsError::Config(format!(
                        "role '{}' has no step '{}'",
                        rule.role, step
                    )));
                }
                None if dependent.is_empty() => {
                    return Err(PfsError::Config(format!(
                        "dependency rule targets role '{}' which has no steps",
                        rule.role
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains_key(&role)
    }

    /// Ordered step templates for a role (empty if undefined)
    pub fn steps_for(&self, role: Role) -> &[StepTemplate] {
        self.roles.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.roles.keys().copied()
    }

    pub fn dependencies(&self) -> &[DependencyRule] {
        &self.dependencies
    }

    pub fn retry_policies(&self) -> &RetryPolicies {
        &self.retry
    }
}

/// Default catalog for a Lustre-style cluster
pub const DEFAULT_CATALOG_TOML: &str = r#"# pfsmon install catalog
#
# Steps run in the order listed for each role. Cross-role ordering comes
# only from the [[dependencies]] rules below.

[retry.push]
max_attempts = 3
initial_backoff_ms = 1000

[retry.service_start]
max_attempts = 3
initial_backoff_ms = 2000

[[roles.management.steps]]
name = "install packages"
kind = "command"
command = "yum install -y lustre lustre-osd-ldiskfs-mount"
check = "rpm -q lustre"

[[roles.management.steps]]
name = "push config"
kind = "push"
local = "conf/mgs.conf"
remote = "/etc/lustre/mgs.conf"

[[roles.management.steps]]
name = "service started"
kind = "service_start"
command = "systemctl start lustre-mgs"
check = "systemctl is-active lustre-mgs"

[[roles.management.steps]]
name = "verify service"
kind = "verify"
command = "lctl get_param -n mgs.MGS.uuid"

[[roles.metadata.steps]]
name = "install packages"
kind = "command"
command = "yum install -y lustre lustre-osd-ldiskfs-mount"
check = "rpm -q lustre"

[[roles.metadata.steps]]
name = "push config"
kind = "push"
local = "conf/mdt.conf"
remote = "/etc/lustre/mdt.conf"

[[roles.metadata.steps]]
name = "service started"
kind = "service_start"
command = "systemctl start lustre-mdt"

[[roles.metadata.steps]]
name = "verify service"
kind = "verify"
command = "lctl dl | grep -q mdt"

[[roles.object_storage.steps]]
name = "install packages"
kind = "command"
command = "yum install -y lustre lustre-osd-ldiskfs-mount"
check = "rpm -q lustre"

[[roles.object_storage.steps]]
name = "push config"
kind = "push"
local = "conf/ost.conf"
remote = "/etc/lustre/ost.conf"

[[roles.object_storage.steps]]
name = "service started"
kind = "service_start"
command = "systemctl start lustre-ost"

[[roles.object_storage.steps]]
name = "verify service"
kind = "verify"
command = "lctl dl | grep -q obdfilter"

[[roles.client.steps]]
name = "install packages"
kind = "command"
command = "yum install -y lustre-client"
check = "rpm -q lustre-client"

[[roles.client.steps]]
name = "mount filesystem"
kind = "service_start"
command = "mount -t lustre mgs01@tcp:/pfs /mnt/pfs"
check = "mountpoint -q /mnt/pfs"

[[roles.monitor.steps]]
name = "push agent config"
kind = "push"
local = "conf/pfsmon-agent.toml"
remote = "/etc/pfsmon/pfsmon-agent.toml"

[[dependencies]]
role = "metadata"
requires_role = "management"
requires_step = "service started"

[[dependencies]]
role = "object_storage"
requires_role = "management"
requires_step = "service started"

[[dependencies]]
role = "client"
step = "mount filesystem"
requires_role = "metadata"
requires_step = "verify service"

[[dependencies]]
role = "client"
step = "mount filesystem"
requires_role = "object_storage"
requires_step = "verify service"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_parses() {
        let catalog = Catalog::example().unwrap();
        assert!(catalog.has_role(Role::Management));
        assert_eq!(catalog.steps_for(Role::Management).len(), 4);
        assert_eq!(catalog.steps_for(Role::Management)[0].name, "install packages");
        assert_eq!(catalog.dependencies().len(), 4);
        assert_eq!(catalog.retry_policies().service_start.initial_backoff_ms, 2000);
    }

    #[test]
    fn test_retryable_defaults() {
        let catalog = Catalog::example().unwrap();
        let steps = catalog.steps_for(Role::Management);
        assert!(!steps[0].is_retryable()); // command
        assert!(steps[1].is_retryable()); // push
        assert!(steps[2].is_retryable()); // service_start
        assert!(!steps[3].is_retryable()); // verify
    }

    #[test]
    fn test_rule_with_unknown_step_is_config_error() {
        let toml = r#"
[[roles.management.steps]]
name = "start"
kind = "service_start"
command = "systemctl start mgs"

[[roles.object_storage.steps]]
name = "start"
kind = "service_start"
command = "systemctl start ost"

[[dependencies]]
role = "object_storage"
requires_role = "management"
requires_step = "service started"
"#;
        let err = Catalog::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, PfsError::Config(_)));
        assert!(err.to_string().contains("service started"));
    }

    #[test]
    fn test_rule_with_undefined_role_is_config_error() {
        let toml = r#"
[[roles.object_storage.steps]]
name = "start"
kind = "service_start"
command = "systemctl start ost"

[[dependencies]]
role = "object_storage"
requires_role = "management"
requires_step = "start"
"#;
        assert!(matches!(
            Catalog::from_toml_str(toml),
            Err(PfsError::Config(_))
        ));
    }

    #[test]
    fn test_push_step_requires_paths() {
        let toml = r#"
[[roles.client.steps]]
name = "push config"
kind = "push"
local = "client.conf"
"#;
        assert!(matches!(
            Catalog::from_toml_str(toml),
            Err(PfsError::Config(_))
        ));
    }

    #[test]
    fn test_retryable_verify_rejected() {
        let toml = r#"
[[roles.client.steps]]
name = "check"
kind = "verify"
command = "true"
retryable = true
"#;
        assert!(matches!(
            Catalog::from_toml_str(toml),
            Err(PfsError::Config(_))
        ));
    }

    #[test]
    fn test_verify_retry_section_rejected() {
        let toml = r#"
[retry.verify]
max_attempts = 5

[[roles.client.steps]]
name = "check"
kind = "verify"
command = "true"
"#;
        let err = Catalog::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, PfsError::Config(_)));
        assert!(err.to_string().contains("verify"));
    }

    #[test]
    fn test_duplicate_step_name_rejected() {
        let toml = r#"
[[roles.client.steps]]
name = "mount"
kind = "command"
command = "mount /a"

[[roles.client.steps]]
name = "mount"
kind = "command"
command = "mount /b"
"#;
        assert!(matches!(
            Catalog::from_toml_str(toml),
            Err(PfsError::Config(_))
        ));
    }

    #[test]
    fn test_role_aliases_accepted() {
        let toml = r#"
[[roles.mgs.steps]]
name = "start"
kind = "service_start"
command = "systemctl start mgs"
"#;
        let catalog = Catalog::from_toml_str(toml).unwrap();
        assert!(catalog.has_role(Role::Management));
    }
}
