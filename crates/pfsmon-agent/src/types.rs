//! Type definitions for collector agents

use chrono::{DateTime, Utc};
use pfsmon_core::HostId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health of a collector agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    /// Torn down on purpose; never restarted by the supervisor
    Stopped,
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentHealth::Unknown => write!(f, "unknown"),
            AgentHealth::Healthy => write!(f, "healthy"),
            AgentHealth::Unhealthy => write!(f, "unhealthy"),
            AgentHealth::Stopped => write!(f, "stopped"),
        }
    }
}

/// The metric collector running on one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorAgent {
    pub host: HostId,
    /// Sampling interval
    pub interval: Duration,
    pub sink_endpoint: String,
    pub health: AgentHealth,
    pub started_at: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    /// Restarts performed by the supervisor
    pub restarts: u32,
    pub last_error: Option<String>,
}

impl CollectorAgent {
    pub fn new(host: impl Into<String>, interval: Duration, sink_endpoint: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            interval,
            sink_endpoint: sink_endpoint.into(),
            health: AgentHealth::Unknown,
            started_at: None,
            last_checked: None,
            restarts: 0,
            last_error: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health == AgentHealth::Healthy
    }
}
