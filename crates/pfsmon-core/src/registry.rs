//! Host registry: the canonical list of cluster hosts and their roles
//!
//! Loaded once per run and read-only afterwards. Hosts keep the order in
//! which they appear in the source file.

use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use crate::{Catalog, Host, HostId, PfsError, Result, Role, SshLogin};

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    hosts: Vec<HostEntry>,
}

#[derive(Debug, Deserialize)]
struct HostEntry {
    address: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    identity_file: Option<PathBuf>,
}

/// Validated set of cluster hosts
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<Host>,
}

impl HostRegistry {
    /// Build a registry from hosts, validating them against the catalog
    pub fn new(hosts: Vec<Host>, catalog: &Catalog) -> Result<Self> {
        let registry = Self { hosts };
        registry.validate(catalog)?;
        Ok(registry)
    }

    /// Load the registry from a TOML file
    pub fn load(path: &Path, catalog: &Catalog) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PfsError::Config(format!("Failed to read host list {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content, catalog)
    }

    pub fn from_toml_str(content: &str, catalog: &Catalog) -> Result<Self> {
        let file: RegistryFile = toml::from_str(content)
            .map_err(|e| PfsError::Config(format!("Failed to parse host list: {}", e)))?;

        let mut hosts = Vec::with_capacity(file.hosts.len());
        for entry in file.hosts {
            let mut roles = BTreeSet::new();
            for name in &entry.roles {
                let role: Role = name.parse().map_err(|e: String| {
                    PfsError::Config(format!("host '{}': {}", entry.address, e))
                })?;
                roles.insert(role);
            }
            let login = SshLogin {
                hostname: entry.hostname,
                user: entry.user,
                identity_file: entry.identity_file,
            };
            hosts.push(Host::new(entry.address.trim(), roles).with_login(login));
        }

        Self::new(hosts, catalog)
    }

    fn validate(&self, catalog: &Catalog) -> Result<()> {
        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.address.is_empty() {
                return Err(PfsError::Config("host with an empty address".to_string()));
            }
            if !seen.insert(host.address.as_str()) {
                return Err(PfsError::Config(format!(
                    "host '{}' is listed more than once",
                    host.address
                )));
            }
            if host.roles.is_empty() {
                return Err(PfsError::Config(format!(
                    "host '{}' has no roles",
                    host.address
                )));
            }
            for role in &host.roles {
                if !catalog.has_role(*role) {
                    return Err(PfsError::Config(format!(
                        "host '{}' has role '{}' which the catalog does not define",
                        host.address, role
                    )));
                }
            }
        }
        Ok(())
    }

    /// Roles of one host
    pub fn roles_of(&self, address: &str) -> Result<&BTreeSet<Role>> {
        self.get(address)
            .map(|h| &h.roles)
            .ok_or_else(|| PfsError::Config(format!("unknown host '{}'", address)))
    }

    pub fn get(&self, address: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.address == address)
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn addresses(&self) -> impl Iterator<Item = &HostId> {
        self.hosts.iter().map(|h| &h.address)
    }

    /// Hosts holding a role
    pub fn with_role(&self, role: Role) -> impl Iterator<Item = &Host> {
        self.hosts.iter().filter(move |h| h.has_role(role))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Restrict the registry to named hosts and/or roles
    ///
    /// Empty filters select everything. When roles are given, each kept host
    /// only keeps the selected roles, and hosts left with none are dropped.
    pub fn select(&self, hosts: &[String], roles: &[Role]) -> Result<Self> {
        for name in hosts {
            if self.get(name).is_none() {
                return Err(PfsError::Config(format!("unknown host '{}'", name)));
            }
        }

        let selected = self
            .hosts
            .iter()
            .filter(|h| hosts.is_empty() || hosts.contains(&h.address))
            .filter_map(|h| {
                let mut host = h.clone();
                if !roles.is_empty() {
                    host.roles.retain(|r| roles.contains(r));
                }
                (!host.roles.is_empty()).then_some(host)
            })
            .collect();

        Ok(Self { hosts: selected })
    }
}

/// Host list written by `pfsmon init`
pub const DEFAULT_HOSTS_TOML: &str = r#"# pfsmon host list

[[hosts]]
address = "mgs01"
roles = ["management", "monitor"]

[[hosts]]
address = "mds01"
roles = ["metadata"]

[[hosts]]
address = "oss01"
roles = ["object_storage"]

[[hosts]]
address = "oss02"
roles = ["object_storage"]

[[hosts]]
address = "client01"
roles = ["client"]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn catalog() -> Catalog {
        Catalog::example().unwrap()
    }

    #[test]
    fn test_default_hosts_load() {
        let registry = HostRegistry::from_toml_str(DEFAULT_HOSTS_TOML, &catalog()).unwrap();
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.hosts()[0].address, "mgs01");
        assert!(registry
            .roles_of("mgs01")
            .unwrap()
            .contains(&Role::Monitor));
        assert_eq!(registry.with_role(Role::ObjectStorage).count(), 2);
    }

    #[test]
    fn test_per_host_login_parsed() {
        let toml = r#"
[[hosts]]
address = "oss01"
roles = ["object_storage"]
hostname = "oss01-ib.lab"
user = "admin"
identity_file = "/root/.ssh/oss_key"

[[hosts]]
address = "oss02"
roles = ["object_storage"]
"#;
        let registry = HostRegistry::from_toml_str(toml, &catalog()).unwrap();
        let login = &registry.get("oss01").unwrap().login;
        assert_eq!(login.hostname.as_deref(), Some("oss01-ib.lab"));
        assert_eq!(login.user.as_deref(), Some("admin"));
        assert_eq!(
            login.identity_file.as_deref(),
            Some(Path::new("/root/.ssh/oss_key"))
        );
        assert!(registry.get("oss02").unwrap().login.is_empty());
    }

    #[test]
    fn test_host_without_roles_rejected() {
        let toml = r#"
[[hosts]]
address = "oss01"
roles = []
"#;
        let err = HostRegistry::from_toml_str(toml, &catalog()).unwrap_err();
        assert!(matches!(err, PfsError::Config(_)));
        assert!(err.to_string().contains("no roles"));
    }

    #[test]
    fn test_role_missing_from_catalog_rejected() {
        let catalog = Catalog::from_toml_str(
            r#"
[[roles.management.steps]]
name = "start"
kind = "service_start"
command = "systemctl start mgs"
"#,
        )
        .unwrap();

        let toml = r#"
[[hosts]]
address = "oss01"
roles = ["object_storage"]
"#;
        let err = HostRegistry::from_toml_str(toml, &catalog).unwrap_err();
        assert!(err.to_string().contains("does not define"));
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let toml = r#"
[[hosts]]
address = "oss01"
roles = ["object_storage"]

[[hosts]]
address = "oss01"
roles = ["client"]
"#;
        assert!(matches!(
            HostRegistry::from_toml_str(toml, &catalog()),
            Err(PfsError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_role_name_rejected() {
        let toml = r#"
[[hosts]]
address = "oss01"
roles = ["router"]
"#;
        assert!(matches!(
            HostRegistry::from_toml_str(toml, &catalog()),
            Err(PfsError::Config(_))
        ));
    }

    #[test]
    fn test_roles_of_unknown_host() {
        let registry = HostRegistry::from_toml_str(DEFAULT_HOSTS_TOML, &catalog()).unwrap();
        assert!(registry.roles_of("nope").is_err());
    }

    #[test]
    fn test_select_hosts_and_roles() {
        let registry = HostRegistry::from_toml_str(DEFAULT_HOSTS_TOML, &catalog()).unwrap();

        let only_oss = registry.select(&[], &[Role::ObjectStorage]).unwrap();
        assert_eq!(only_oss.len(), 2);

        let mgs_monitor = registry
            .select(&["mgs01".to_string()], &[Role::Monitor])
            .unwrap();
        assert_eq!(mgs_monitor.len(), 1);
        let roles = mgs_monitor.roles_of("mgs01").unwrap();
        assert_eq!(roles.len(), 1);
        assert!(roles.contains(&Role::Monitor));

        assert!(registry.select(&["ghost".to_string()], &[]).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DEFAULT_HOSTS_TOML.as_bytes()).unwrap();

        let registry = HostRegistry::load(file.path(), &catalog()).unwrap();
        assert_eq!(registry.len(), 5);
    }
}
