//! Start, verify, supervise and stop collector agents

use chrono::Utc;
use pfsmon_core::fail_open::{fail_open, fail_open_with_retries};
use pfsmon_core::{
    AgentConfig, ExponentialBackoff, Host, HostId, HostState, PfsError, Result,
};
use pfsmon_remote::RemoteExecutor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::{AgentHealth, CollectorAgent};

/// Owns the collector agents of a run
pub struct AgentManager {
    executor: Arc<dyn RemoteExecutor>,
    config: AgentConfig,
    sink_endpoint: String,
    command_timeout: Duration,
    agents: RwLock<HashMap<HostId, CollectorAgent>>,
}

impl AgentManager {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        config: AgentConfig,
        sink_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            config,
            sink_endpoint: sink_endpoint.into(),
            command_timeout: Duration::from_secs(30),
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Timeout for each start/health/stop command
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn render(&self, template: &str, host: &str) -> String {
        AgentConfig::render(template, host, self.config.interval(), &self.sink_endpoint)
    }

    /// Make sure a healthy agent runs on `host`
    ///
    /// The host must have finished installing. An agent already known to
    /// be healthy is returned as is, without touching the host.
    pub async fn ensure_running(&self, host: &Host) -> Result<CollectorAgent> {
        if host.state != HostState::Succeeded {
            return Err(PfsError::AgentStart {
                host: host.address.clone(),
                message: format!("host is {}, not succeeded", host.state),
            });
        }

        if let Some(agent) = self.agent(&host.address).await {
            if agent.is_healthy() {
                debug!("Agent on {} already healthy", host.address);
                return Ok(agent);
            }
        }

        self.start(&host.address).await
    }

    async fn start(&self, address: &str) -> Result<CollectorAgent> {
        info!("Starting collector agent on {}", address);

        let start = self.render(&self.config.start_command, address);
        if let Err(e) = self.executor.run(address, &start, self.command_timeout).await {
            let message = format!("start command failed: {}", e);
            self.record(address, AgentHealth::Unhealthy, Some(message.clone()))
                .await;
            return Err(PfsError::AgentStart {
                host: address.to_string(),
                message,
            });
        }

        let health = self.render(&self.config.health_command, address);
        let deadline = Instant::now() + self.config.start_timeout();
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(self.config.poll_initial_backoff_ms),
            Duration::from_millis(self.config.poll_max_backoff_ms),
        );

        loop {
            match self.executor.run(address, &health, self.command_timeout).await {
                Ok(_) => {
                    let agent = self.record(address, AgentHealth::Healthy, None).await;
                    info!("Collector agent healthy on {}", address);
                    return Ok(agent);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if Instant::now() + delay > deadline {
                        let message = format!(
                            "not healthy after {:?}: {}",
                            self.config.start_timeout(),
                            e
                        );
                        self.record(address, AgentHealth::Unhealthy, Some(message.clone()))
                            .await;
                        return Err(PfsError::AgentStart {
                            host: address.to_string(),
                            message,
                        });
                    }
                    debug!("Agent on {} not up yet, polling again in {:?}", address, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn record(
        &self,
        address: &str,
        health: AgentHealth,
        error: Option<String>,
    ) -> CollectorAgent {
        let mut agents = self.agents.write().await;
        let agent = agents.entry(address.to_string()).or_insert_with(|| {
            CollectorAgent::new(address, self.config.interval(), self.sink_endpoint.as_str())
        });

        let now = Utc::now();
        if health == AgentHealth::Healthy && agent.health != AgentHealth::Healthy {
            agent.started_at = Some(now);
        }
        agent.health = health;
        agent.last_checked = Some(now);
        if error.is_some() || health == AgentHealth::Healthy {
            agent.last_error = error;
        }
        agent.clone()
    }

    /// One health check; updates the recorded health
    ///
    /// Stopped agents are not checked.
    pub async fn check(&self, address: &str) -> Result<AgentHealth> {
        if let Some(agent) = self.agent(address).await {
            if agent.health == AgentHealth::Stopped {
                return Ok(AgentHealth::Stopped);
            }
        }

        let health = self.render(&self.config.health_command, address);
        let (status, error) = match self.executor.run(address, &health, self.command_timeout).await {
            Ok(_) => (AgentHealth::Healthy, None),
            Err(e @ PfsError::Exec { .. }) => (AgentHealth::Unhealthy, Some(e.to_string())),
            Err(e) => return Err(e),
        };
        self.record(address, status, error).await;
        Ok(status)
    }

    /// Stop the agent on `address`; it stays Stopped
    pub async fn stop(&self, address: &str) -> Result<()> {
        let stop = self.render(&self.config.stop_command, address);
        self.executor
            .run(address, &stop, self.command_timeout)
            .await?;
        self.record(address, AgentHealth::Stopped, None).await;
        info!("Collector agent stopped on {}", address);
        Ok(())
    }

    /// Stop every agent that is not already stopped
    ///
    /// Failures are logged; returns how many agents stopped.
    pub async fn stop_all(&self) -> usize {
        let hosts: Vec<HostId> = self
            .agents()
            .await
            .into_iter()
            .filter(|a| a.health != AgentHealth::Stopped)
            .map(|a| a.host)
            .collect();

        let mut stopped = 0;
        for host in hosts {
            let op = format!("stop agent on {}", host);
            let address = host.as_str();
            if fail_open_with_retries(&op, move || self.stop(address), 3)
                .await
                .is_some()
            {
                stopped += 1;
            }
        }
        stopped
    }

    /// Check every managed agent on the supervise interval and restart the
    /// unhealthy ones, until `shutdown` turns true
    pub async fn supervise(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.supervise_interval());

        loop {
            tokio::select! {
                _ = tick.tick() => self.supervise_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Agent supervisor stopped");
    }

    async fn supervise_once(&self) {
        let hosts: Vec<HostId> = self
            .agents()
            .await
            .into_iter()
            .filter(|a| a.health != AgentHealth::Stopped)
            .map(|a| a.host)
            .collect();

        for host in hosts {
            let address = host.as_str();
            let op = format!("check agent on {}", address);
            if fail_open(&op, move || self.check(address)).await != Some(AgentHealth::Unhealthy) {
                continue;
            }

            warn!("Collector agent on {} is unhealthy, restarting", host);
            if let Some(agent) = self.agents.write().await.get_mut(address) {
                agent.restarts += 1;
            }
            let op = format!("restart agent on {}", address);
            fail_open(&op, move || self.start(address)).await;
        }
    }

    pub async fn agent(&self, address: &str) -> Option<CollectorAgent> {
        self.agents.read().await.get(address).cloned()
    }

    /// Snapshot of every managed agent, sorted by host
    pub async fn agents(&self) -> Vec<CollectorAgent> {
        let mut agents: Vec<CollectorAgent> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.host.cmp(&b.host));
        agents
    }

    /// Start tracking an agent started elsewhere so `stop_all` reaches it
    pub async fn adopt(&self, address: &str) {
        self.agents
            .write()
            .await
            .entry(address.to_string())
            .or_insert_with(|| {
                CollectorAgent::new(address, self.config.interval(), self.sink_endpoint.as_str())
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfsmon_core::Role;
    use pfsmon_remote::{MockOutcome, MockRemoteExecutor, MockRule};

    fn config() -> AgentConfig {
        AgentConfig {
            start_timeout_secs: 5,
            poll_initial_backoff_ms: 500,
            poll_max_backoff_ms: 2000,
            supervise_interval_secs: 1,
            ..AgentConfig::default()
        }
    }

    fn host(state: HostState) -> Host {
        Host::new("oss01", [Role::ObjectStorage]).with_state(state)
    }

    fn manager(mock: &Arc<MockRemoteExecutor>) -> AgentManager {
        AgentManager::new(mock.clone(), config(), "http://tsdb:8086/write")
    }

    fn unhealthy() -> MockOutcome {
        MockOutcome::Exit {
            code: 1,
            stderr: String::new(),
        }
    }

    #[tokio::test]
    async fn test_ensure_running_is_idempotent() {
        let mock = Arc::new(MockRemoteExecutor::new());
        let manager = manager(&mock);

        let first = manager.ensure_running(&host(HostState::Succeeded)).await.unwrap();
        assert_eq!(first.health, AgentHealth::Healthy);
        let calls_after_first = mock.calls().len();

        let second = manager.ensure_running(&host(HostState::Succeeded)).await.unwrap();
        assert_eq!(second.health, AgentHealth::Healthy);
        assert_eq!(mock.calls().len(), calls_after_first);
        assert_eq!(mock.count_matching("oss01", "nohup"), 1);
    }

    #[tokio::test]
    async fn test_start_command_is_rendered() {
        let mock = Arc::new(MockRemoteExecutor::new());
        manager(&mock)
            .ensure_running(&host(HostState::Succeeded))
            .await
            .unwrap();

        let start = &mock.calls()[0].command;
        assert!(start.contains("--host oss01"));
        assert!(start.contains("--interval 10"));
        assert!(start.contains("--sink http://tsdb:8086/write"));
    }

    #[tokio::test]
    async fn test_requires_succeeded_host() {
        let mock = Arc::new(MockRemoteExecutor::new());
        let err = manager(&mock)
            .ensure_running(&host(HostState::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, PfsError::AgentStart { .. }));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_healthy() {
        let mock = Arc::new(
            MockRemoteExecutor::new().with_rule(MockRule::new("pgrep", unhealthy()).times(2)),
        );
        let agent = manager(&mock)
            .ensure_running(&host(HostState::Succeeded))
            .await
            .unwrap();

        assert!(agent.is_healthy());
        assert_eq!(mock.count_matching("oss01", "pgrep"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_is_agent_start_error() {
        let mock = Arc::new(MockRemoteExecutor::new().with_rule(MockRule::new("pgrep", unhealthy())));
        let manager = manager(&mock);

        let err = manager
            .ensure_running(&host(HostState::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, PfsError::AgentStart { .. }));
        assert!(mock.count_matching("oss01", "pgrep") > 1);

        let agent = manager.agent("oss01").await.unwrap();
        assert_eq!(agent.health, AgentHealth::Unhealthy);
        assert!(agent.last_error.is_some());
    }

    #[tokio::test]
    async fn test_stop_is_terminal() {
        let mock = Arc::new(MockRemoteExecutor::new());
        let manager = manager(&mock);
        manager.ensure_running(&host(HostState::Succeeded)).await.unwrap();

        manager.stop("oss01").await.unwrap();
        assert_eq!(manager.check("oss01").await.unwrap(), AgentHealth::Stopped);
        assert_eq!(manager.stop_all().await, 0);
        assert_eq!(mock.count_matching("oss01", "pkill"), 1);
    }

    #[tokio::test]
    async fn test_stop_all_reaches_every_agent() {
        let mock = Arc::new(MockRemoteExecutor::new());
        let manager = manager(&mock);
        manager.adopt("oss01").await;
        manager.adopt("oss02").await;

        assert_eq!(manager.stop_all().await, 2);
        for agent in manager.agents().await {
            assert_eq!(agent.health, AgentHealth::Stopped);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_restarts_unhealthy_agent() {
        let mock = Arc::new(MockRemoteExecutor::new());
        let manager = Arc::new(manager(&mock));
        manager.ensure_running(&host(HostState::Succeeded)).await.unwrap();

        mock.add_rule(MockRule::new("pgrep", unhealthy()).times(1));
        let (tx, rx) = watch::channel(false);
        let supervisor = tokio::spawn(manager.clone().supervise(rx));

        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();
        supervisor.await.unwrap();

        let agent = manager.agent("oss01").await.unwrap();
        assert_eq!(agent.health, AgentHealth::Healthy);
        assert_eq!(agent.restarts, 1);
        assert_eq!(mock.count_matching("oss01", "nohup"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_restarts_adopted_agents() {
        // First health check finds the adopted agent down
        let mock = Arc::new(
            MockRemoteExecutor::new().with_rule(MockRule::new("pgrep", unhealthy()).times(1)),
        );
        let manager = Arc::new(manager(&mock));
        manager.adopt("oss01").await;
        manager.adopt("oss02").await;
        manager.stop("oss02").await.unwrap();

        let (tx, rx) = watch::channel(false);
        let supervisor = tokio::spawn(manager.clone().supervise(rx));
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();
        supervisor.await.unwrap();

        let oss01 = manager.agent("oss01").await.unwrap();
        assert_eq!(oss01.health, AgentHealth::Healthy);
        assert_eq!(oss01.restarts, 1);
        assert_eq!(mock.count_matching("oss01", "nohup"), 1);
        // Stopped agents are left alone
        assert_eq!(mock.count_matching("oss02", "pgrep"), 0);
    }
}
