//! Time-series sinks
//!
//! A sink accepts a batch or fails; the pipeline owns retries.

use async_trait::async_trait;
use pfsmon_core::{PfsError, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::sample::MetricSample;

/// Write contract of the central time-series store
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Deliver a batch; any error is `PfsError::SinkWrite`
    async fn write(&self, batch: &[MetricSample]) -> Result<()>;
}

/// Posts batches as line protocol to an HTTP write endpoint
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PfsError::SinkWrite(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request body for a batch, one point per line
    pub fn body(batch: &[MetricSample]) -> String {
        batch
            .iter()
            .map(MetricSample::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl MetricSink for HttpSink {
    async fn write(&self, batch: &[MetricSample]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(&self.url)
            .body(Self::body(batch))
            .send()
            .await
            .map_err(|e| PfsError::SinkWrite(format!("POST {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PfsError::SinkWrite(format!(
                "sink returned {}: {}",
                status,
                text.trim()
            )));
        }

        debug!("Wrote {} samples to {}", batch.len(), self.url);
        Ok(())
    }
}

/// Stores written samples in memory for testing and inspection
#[derive(Default)]
pub struct MemorySink {
    samples: Mutex<Vec<MetricSample>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Copy of every accepted sample, in write order
    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self) -> usize {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Write calls made, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricSink for MemorySink {
    async fn write(&self, batch: &[MetricSample]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PfsError::SinkWrite("memory sink set to fail".to_string()));
        }
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(batch.iter().cloned());
        Ok(())
    }
}
