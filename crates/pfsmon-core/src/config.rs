//! Configuration management for pfsmon
//!
//! This module provides configuration structures for the installer and the
//! collector agents: orchestrator limits, remote transport, agent lifecycle
//! commands and the metric pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{PfsError, Result};

/// Top-level pfsmon configuration
///
/// Loaded from `pfsmon.toml` (or `/etc/pfsmon.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PfsmonConfig {
    /// Install run limits
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,

    /// Remote command transport
    #[serde(default)]
    pub transport: TransportConfig,

    /// Collector agent lifecycle
    #[serde(default)]
    pub agent: AgentConfig,

    /// Metric sampling and delivery
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Install run limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Maximum simultaneous in-flight step executions
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Default timeout for one remote command
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Directory for run status snapshots and the cancel marker
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Start collector agents on hosts that finish installing
    #[serde(default = "default_true")]
    pub start_agents: bool,
}

/// Remote command transport (ssh/scp)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    #[serde(default = "default_scp_program")]
    pub scp_program: String,

    /// Remote login user (ssh default when absent)
    #[serde(default)]
    pub user: Option<String>,

    /// Private key passed with `-i`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Cluster-wide cap on concurrent remote operations
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Consecutive connect failures before a host is fenced off
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// Seconds a fenced host stays fenced before one trial call is let through
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

/// Collector agent lifecycle commands and timings
///
/// Commands may use `{host}`, `{interval}` and `{sink}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_start_command")]
    pub start_command: String,

    #[serde(default = "default_health_command")]
    pub health_command: String,

    #[serde(default = "default_stop_command")]
    pub stop_command: String,

    /// Sampling interval handed to each agent
    #[serde(default = "default_sample_interval_secs")]
    pub interval_secs: u64,

    /// Give up on a starting agent after this long
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_backoff_ms: u64,

    #[serde(default = "default_poll_max_ms")]
    pub poll_max_backoff_ms: u64,

    /// Health check period of the supervisor loop
    #[serde(default = "default_supervise_interval_secs")]
    pub supervise_interval_secs: u64,
}

/// Metric sampling and sink delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Time-series sink write endpoint
    #[serde(default = "default_sink_url")]
    pub sink_url: String,

    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Flush as soon as this many samples are buffered
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Hard bound on buffered samples; the oldest are dropped beyond it
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default = "default_sink_initial_ms")]
    pub sink_initial_backoff_ms: u64,

    #[serde(default = "default_sink_max_ms")]
    pub sink_max_backoff_ms: u64,

    /// Root of the proc filesystem to sample
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Directory holding filesystem `stats` files
    #[serde(default)]
    pub stats_dir: Option<PathBuf>,
}

// Default value providers
fn default_workers() -> usize {
    4
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".pfsmon")
}

fn default_true() -> bool {
    true
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_scp_program() -> String {
    "scp".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_in_flight() -> usize {
    16
}

fn default_breaker_threshold() -> u32 {
    3
}

fn default_breaker_cooldown_secs() -> u64 {
    60
}

fn default_start_command() -> String {
    "nohup pfsmon agent run --host {host} --interval {interval} --sink {sink} \
     >/var/log/pfsmon-agent.log 2>&1 &"
        .to_string()
}

fn default_health_command() -> String {
    "pgrep -f 'pfsmon agent run'".to_string()
}

fn default_stop_command() -> String {
    "pkill -f 'pfsmon agent run' || true".to_string()
}

fn default_sample_interval_secs() -> u64 {
    10
}

fn default_start_timeout_secs() -> u64 {
    60
}

fn default_poll_initial_ms() -> u64 {
    500
}

fn default_poll_max_ms() -> u64 {
    8000
}

fn default_supervise_interval_secs() -> u64 {
    30
}

fn default_sink_url() -> String {
    "http://localhost:8086/write?db=pfsmon".to_string()
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_batch_size() -> usize {
    500
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_sink_initial_ms() -> u64 {
    1000
}

fn default_sink_max_ms() -> u64 {
    60_000
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

impl PfsmonConfig {
    /// Load configuration from `path`, or defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content).map_err(|e| {
                PfsError::Config(format!("Failed to parse config file: {}", e))
            })?)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let config = Self::default();
        let content = toml::to_string_pretty(&config).map_err(|e| {
            PfsError::Other(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl OrchestratorSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl AgentConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_secs(self.supervise_interval_secs)
    }

    /// Substitute the command placeholders
    pub fn render(template: &str, host: &str, interval: Duration, sink: &str) -> String {
        template
            .replace("{host}", host)
            .replace("{interval}", &interval.as_secs().to_string())
            .replace("{sink}", sink)
    }
}

impl PipelineConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            command_timeout_secs: default_command_timeout_secs(),
            state_dir: default_state_dir(),
            start_agents: true,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssh_program: default_ssh_program(),
            scp_program: default_scp_program(),
            user: None,
            identity_file: None,
            port: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            max_in_flight: default_max_in_flight(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            start_command: default_start_command(),
            health_command: default_health_command(),
            stop_command: default_stop_command(),
            interval_secs: default_sample_interval_secs(),
            start_timeout_secs: default_start_timeout_secs(),
            poll_initial_backoff_ms: default_poll_initial_ms(),
            poll_max_backoff_ms: default_poll_max_ms(),
            supervise_interval_secs: default_supervise_interval_secs(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sink_url: default_sink_url(),
            sample_interval_secs: default_sample_interval_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            batch_size: default_batch_size(),
            buffer_capacity: default_buffer_capacity(),
            sink_initial_backoff_ms: default_sink_initial_ms(),
            sink_max_backoff_ms: default_sink_max_ms(),
            proc_root: default_proc_root(),
            stats_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = PfsmonConfig::load_or_default(&dir.path().join("pfsmon.toml")).unwrap();
        assert_eq!(config.orchestrator.workers, 4);
        assert_eq!(config.pipeline.buffer_capacity, 10_000);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pfsmon.toml");
        std::fs::write(
            &path,
            "[orchestrator]\nworkers = 8\n\n[transport]\nuser = \"root\"\n",
        )
        .unwrap();

        let config = PfsmonConfig::load_or_default(&path).unwrap();
        assert_eq!(config.orchestrator.workers, 8);
        assert_eq!(config.orchestrator.command_timeout_secs, 300);
        assert_eq!(config.transport.user.as_deref(), Some("root"));
        assert_eq!(config.transport.ssh_program, "ssh");
    }

    #[test]
    fn test_write_default_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc").join("pfsmon.toml");
        PfsmonConfig::write_default(&path).unwrap();

        let config = PfsmonConfig::load_or_default(&path).unwrap();
        assert_eq!(config.agent.interval_secs, 10);
        assert!(config.orchestrator.start_agents);
    }

    #[test]
    fn test_bad_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pfsmon.toml");
        std::fs::write(&path, "[orchestrator\nworkers = ").unwrap();
        assert!(matches!(
            PfsmonConfig::load_or_default(&path),
            Err(PfsError::Config(_))
        ));
    }

    #[test]
    fn test_render_placeholders() {
        let cmd = AgentConfig::render(
            "agent --host {host} --every {interval} --to {sink}",
            "oss01",
            Duration::from_secs(15),
            "http://tsdb:8086/write",
        );
        assert_eq!(cmd, "agent --host oss01 --every 15 --to http://tsdb:8086/write");
    }
}
