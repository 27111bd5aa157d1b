//! Blast-radius guard around an executor
//!
//! Every remote operation in a run goes through one `GuardedExecutor`: a
//! semaphore bounds cluster-wide in-flight operations, and a per-host
//! circuit breaker fences off hosts that keep refusing connections.

use async_trait::async_trait;
use pfsmon_core::{PfsError, Result, TransportConfig};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::command::{CommandOutput, RemoteExecutor};

pub struct GuardedExecutor<E> {
    inner: E,
    permits: Arc<Semaphore>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    threshold: u32,
    cooldown: Duration,
}

impl<E: RemoteExecutor> GuardedExecutor<E> {
    pub fn new(inner: E, max_in_flight: usize, threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            breakers: Mutex::new(HashMap::new()),
            threshold,
            cooldown,
        }
    }

    pub fn from_config(inner: E, transport: &TransportConfig) -> Self {
        Self::new(
            inner,
            transport.max_in_flight,
            transport.breaker_threshold,
            Duration::from_secs(transport.breaker_cooldown_secs),
        )
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Circuit state for a host (Closed if never contacted)
    pub fn circuit_state(&self, host: &str) -> CircuitState {
        self.breaker(host).state()
    }

    fn breaker(&self, host: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_cooldown(self.threshold, self.cooldown))
            })
            .clone()
    }

    async fn guarded<T, F>(&self, host: &str, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send,
    {
        let breaker = self.breaker(host);
        if !breaker.can_execute() {
            return Err(PfsError::connect(
                host,
                format!(
                    "host fenced after {} connect failures, next attempt in {}ms",
                    breaker.failure_count(),
                    breaker.time_until_retry()
                ),
            ));
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PfsError::Orchestrator("executor permits closed".to_string()))?;

        let result = op.await;
        match &result {
            Err(PfsError::Connect { .. }) => {
                breaker.record_failure();
                if breaker.state() == CircuitState::Open {
                    warn!("Circuit opened for {}", host);
                }
            }
            Ok(_) => breaker.record_success(),
            // A failed command or transfer neither proves nor disproves reachability
            Err(_) => {}
        }
        result
    }
}

#[async_trait]
impl<E: RemoteExecutor> RemoteExecutor for GuardedExecutor<E> {
    async fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.guarded(host, self.inner.run(host, command, timeout))
            .await
    }

    async fn push_file(&self, host: &str, local_path: &Path, remote_path: &str) -> Result<()> {
        self.guarded(host, self.inner.push_file(host, local_path, remote_path))
            .await
    }
}
