//! Core type definitions for pfsmon

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Host identifier (network address or hostname)
pub type HostId = String;

/// Capability a cluster node plays
///
/// Roles select which install steps apply to a host. The enum order is the
/// order roles are expanded within one host when the plan is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Management target (cluster configuration service)
    Management,
    /// Metadata target
    Metadata,
    /// Object-storage target
    ObjectStorage,
    /// Filesystem client
    Client,
    /// Monitoring collector only
    Monitor,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Management,
        Role::Metadata,
        Role::ObjectStorage,
        Role::Client,
        Role::Monitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Management => "management",
            Self::Metadata => "metadata",
            Self::ObjectStorage => "object_storage",
            Self::Client => "client",
            Self::Monitor => "monitor",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "management" | "mgs" | "mgt" => Ok(Self::Management),
            "metadata" | "mds" | "mdt" => Ok(Self::Metadata),
            "object_storage" | "object-storage" | "oss" | "ost" => Ok(Self::ObjectStorage),
            "client" => Ok(Self::Client),
            "monitor" => Ok(Self::Monitor),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Lifecycle state of a host (and of a single install step)
///
/// Transitions move forward only, except InProgress -> Pending when a
/// retryable failure is still within its retry budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

/// Install steps move through the same states as hosts
pub type StepState = HostState;

impl HostState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for HostState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid state: {}", s)),
        }
    }
}

/// A cluster node targeted for install and monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Network address or hostname
    pub address: HostId,
    /// Roles this host plays
    pub roles: BTreeSet<Role>,
    /// Current lifecycle state
    #[serde(default)]
    pub state: HostState,
    /// Last error recorded against this host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// ssh login overrides for this host
    #[serde(default, skip_serializing_if = "SshLogin::is_empty")]
    pub login: SshLogin,
}

/// Per-host ssh settings that take precedence over the transport defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshLogin {
    /// Name to connect to when it differs from the host address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Private key passed with `-i`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

impl SshLogin {
    pub fn is_empty(&self) -> bool {
        self.hostname.is_none() && self.user.is_none() && self.identity_file.is_none()
    }
}

impl Host {
    pub fn new(address: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            address: address.into(),
            roles: roles.into_iter().collect(),
            state: HostState::Pending,
            last_error: None,
            login: SshLogin::default(),
        }
    }

    pub fn with_login(mut self, login: SshLogin) -> Self {
        self.login = login;
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn with_state(mut self, state: HostState) -> Self {
        self.state = state;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_aliases() {
        assert_eq!("mgs".parse::<Role>().unwrap(), Role::Management);
        assert_eq!("OST".parse::<Role>().unwrap(), Role::ObjectStorage);
        assert_eq!("object-storage".parse::<Role>().unwrap(), Role::ObjectStorage);
        assert!("router".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serde_names() {
        let json = serde_json::to_string(&Role::ObjectStorage).unwrap();
        assert_eq!(json, "\"object_storage\"");
        let role: Role = serde_json::from_str("\"metadata\"").unwrap();
        assert_eq!(role, Role::Metadata);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!HostState::Pending.is_terminal());
        assert!(!HostState::InProgress.is_terminal());
        assert!(HostState::Succeeded.is_terminal());
        assert!(HostState::Failed.is_terminal());
        assert!(HostState::Skipped.is_terminal());
    }

    #[test]
    fn test_host_roles() {
        let host = Host::new("oss01", [Role::ObjectStorage, Role::Client]);
        assert!(host.has_role(Role::Client));
        assert!(!host.has_role(Role::Management));
        assert_eq!(host.state, HostState::Pending);
    }
}
