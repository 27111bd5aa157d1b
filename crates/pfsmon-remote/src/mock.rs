//! Scripted executor for tests

use async_trait::async_trait;
use pfsmon_core::{PfsError, Result};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::command::{CommandOutput, RemoteExecutor};

/// What a scripted call does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Exit 0 with this stdout
    Success(String),
    /// Exit non-zero
    Exit { code: i32, stderr: String },
    /// Host unreachable
    ConnectFailure,
    /// Command hangs past its timeout
    Timeout,
}

/// A scripted response: calls whose command contains `pattern` (and whose
/// host matches, if set) get `outcome`
///
/// Push calls are matched as `push <remote_path>`.
#[derive(Debug, Clone)]
pub struct MockRule {
    host: Option<String>,
    pattern: String,
    outcome: MockOutcome,
    remaining: Option<usize>,
    delay: Duration,
}

impl MockRule {
    pub fn new(pattern: impl Into<String>, outcome: MockOutcome) -> Self {
        Self {
            host: None,
            pattern: pattern.into(),
            outcome,
            remaining: None,
            delay: Duration::ZERO,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Only apply to the next `n` matching calls
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn matches(&self, host: &str, command: &str) -> bool {
        self.remaining != Some(0)
            && self.host.as_deref().map_or(true, |h| h == host)
            && command.contains(&self.pattern)
    }
}

/// One recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub host: String,
    pub command: String,
}

/// Mock executor for testing
///
/// Rules are tried in insertion order; unmatched calls succeed with empty
/// output after the default delay.
#[derive(Debug, Default)]
pub struct MockRemoteExecutor {
    rules: Mutex<Vec<MockRule>>,
    calls: Mutex<Vec<MockCall>>,
    default_delay: Duration,
}

impl MockRemoteExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(self, rule: MockRule) -> Self {
        self.add_rule(rule);
        self
    }

    /// Add a rule to an executor that is already shared
    pub fn add_rule(&self, rule: MockRule) {
        self.lock_rules().push(rule);
    }

    /// Delay applied to calls that match no rule
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls_for(&self, host: &str) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.host == host)
            .collect()
    }

    /// Number of calls to `host` whose command contains `pattern`
    pub fn count_matching(&self, host: &str, pattern: &str) -> usize {
        self.calls_for(host)
            .iter()
            .filter(|c| c.command.contains(pattern))
            .count()
    }

    fn lock_rules(&self) -> std::sync::MutexGuard<'_, Vec<MockRule>> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn script(&self, host: &str, command: &str) -> (MockOutcome, Duration) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockCall {
                host: host.to_string(),
                command: command.to_string(),
            });

        let mut rules = self.lock_rules();
        match rules.iter_mut().find(|r| r.matches(host, command)) {
            Some(rule) => {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                (rule.outcome.clone(), rule.delay)
            }
            None => (MockOutcome::Success(String::new()), self.default_delay),
        }
    }

    async fn play(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let (outcome, delay) = self.script(host, command);

        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(PfsError::Timeout {
                host: host.to_string(),
                after: timeout,
            });
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            MockOutcome::Success(stdout) => Ok(CommandOutput {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            }),
            MockOutcome::Exit { code, stderr } => Err(PfsError::Exec {
                host: host.to_string(),
                exit_code: code,
                stderr,
            }),
            MockOutcome::ConnectFailure => Err(PfsError::connect(host, "connection refused")),
            MockOutcome::Timeout => Err(PfsError::Timeout {
                host: host.to_string(),
                after: timeout,
            }),
        }
    }
}

#[async_trait]
impl RemoteExecutor for MockRemoteExecutor {
    async fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.play(host, command, timeout).await
    }

    async fn push_file(&self, host: &str, _local_path: &Path, remote_path: &str) -> Result<()> {
        self.play(host, &format!("push {}", remote_path), Duration::MAX)
            .await
            .map(|_| ())
    }
}
