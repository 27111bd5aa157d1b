//! The per-host sample/flush loop
//!
//! Samples on a fixed interval into a bounded buffer and flushes to the
//! sink on a separate timer or as soon as a full batch is waiting. A failed
//! write leaves the batch in the buffer and backs off; the buffer bound
//! sheds the oldest samples if the sink stays down.

use pfsmon_core::{ExponentialBackoff, PipelineConfig, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::buffer::SampleBuffer;
use crate::sample::MetricSample;
use crate::sampler::{LoadAvgSampler, MemInfoSampler, Sampler, StatsSampler};
use crate::sink::MetricSink;

/// Live pipeline counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    sampled: AtomicU64,
    flushed: AtomicU64,
    failed_writes: AtomicU64,
    sampler_errors: AtomicU64,
}

impl PipelineStats {
    pub fn sampled(&self) -> u64 {
        self.sampled.load(Ordering::Relaxed)
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    pub fn sampler_errors(&self) -> u64 {
        self.sampler_errors.load(Ordering::Relaxed)
    }
}

/// Final counters returned when the pipeline stops
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    pub sampled: u64,
    pub flushed: u64,
    pub dropped: u64,
    pub failed_writes: u64,
    /// Samples still buffered at shutdown
    pub pending: usize,
}

pub struct MetricPipeline {
    host: String,
    samplers: Vec<Arc<dyn Sampler>>,
    sink: Arc<dyn MetricSink>,
    buffer: SampleBuffer,
    config: PipelineConfig,
    backoff: ExponentialBackoff,
    blocked_until: Option<Instant>,
    stats: Arc<PipelineStats>,
}

impl MetricPipeline {
    pub fn new(host: impl Into<String>, sink: Arc<dyn MetricSink>, config: PipelineConfig) -> Self {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(config.sink_initial_backoff_ms),
            Duration::from_millis(config.sink_max_backoff_ms),
        );
        Self {
            host: host.into(),
            samplers: Vec::new(),
            sink,
            buffer: SampleBuffer::new(config.buffer_capacity),
            config,
            backoff,
            blocked_until: None,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.samplers.push(Arc::new(sampler));
        self
    }

    /// Load and memory from the proc root, plus stats files when configured
    pub fn with_default_samplers(self) -> Self {
        let proc_root = self.config.proc_root.clone();
        let stats_dir = self.config.stats_dir.clone();

        let pipeline = self
            .with_sampler(LoadAvgSampler::new(&proc_root))
            .with_sampler(MemInfoSampler::new(&proc_root));
        match stats_dir {
            Some(dir) => pipeline.with_sampler(StatsSampler::new(dir)),
            None => pipeline,
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Run every sampler once and buffer the results
    ///
    /// Samplers read files synchronously, so they run on the blocking pool.
    /// A failing sampler is logged and skipped.
    pub async fn sample_once(&mut self) {
        let samplers = self.samplers.clone();
        let readings = tokio::task::spawn_blocking(move || {
            samplers
                .iter()
                .map(|s| (s.subsystem().to_string(), s.sample()))
                .collect::<Vec<_>>()
        })
        .await;

        let readings = match readings {
            Ok(readings) => readings,
            Err(e) => {
                self.stats.sampler_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Sampling task failed: {}", e);
                return;
            }
        };

        for (subsystem, result) in readings {
            match result {
                Ok(values) => {
                    let count = values.len() as u64;
                    for (key, value) in values {
                        self.buffer.push(MetricSample::new(
                            self.host.as_str(),
                            subsystem.as_str(),
                            key,
                            value,
                        ));
                    }
                    self.stats.sampled.fetch_add(count, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.sampler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Sampler '{}' failed: {}", subsystem, e);
                }
            }
        }
    }

    /// Deliver buffered samples in batches until the buffer is empty or a
    /// write fails
    ///
    /// Does nothing while backing off after a failure. Returns the number of
    /// samples delivered.
    pub async fn flush(&mut self) -> Result<usize> {
        if let Some(until) = self.blocked_until {
            if Instant::now() < until {
                return Ok(0);
            }
            self.blocked_until = None;
        }

        let mut delivered = 0;
        while !self.buffer.is_empty() {
            let batch = self.buffer.peek(self.config.batch_size.max(1));
            match self.sink.write(&batch).await {
                Ok(()) => {
                    self.buffer.consume(batch.len());
                    self.backoff.reset();
                    delivered += batch.len();
                    self.stats
                        .flushed
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    self.blocked_until = Some(Instant::now() + delay);
                    self.stats.failed_writes.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Sink write failed ({} samples kept, retry in {:?}): {}",
                        self.buffer.len(),
                        delay,
                        e
                    );
                    return Err(e);
                }
            }
        }

        if delivered > 0 {
            debug!("Flushed {} samples", delivered);
        }
        Ok(delivered)
    }

    async fn try_flush(&mut self) {
        // Failures are already logged and the batch is kept
        let _ = self.flush().await;
    }

    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            sampled: self.stats.sampled(),
            flushed: self.stats.flushed(),
            dropped: self.buffer.dropped(),
            failed_writes: self.stats.failed_writes(),
            pending: self.buffer.len(),
        }
    }

    /// Sample and flush until `shutdown` turns true (or its sender drops)
    ///
    /// Makes one last flush attempt before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> PipelineSummary {
        info!(
            "Metric pipeline started for {} ({} samplers, every {:?})",
            self.host,
            self.samplers.len(),
            self.config.sample_interval()
        );

        let mut sample_tick = tokio::time::interval(self.config.sample_interval());
        let flush_every = self.config.flush_interval();
        let mut flush_tick = tokio::time::interval_at(Instant::now() + flush_every, flush_every);

        loop {
            tokio::select! {
                _ = sample_tick.tick() => {
                    self.sample_once().await;
                    if self.buffer.len() >= self.config.batch_size {
                        self.try_flush().await;
                    }
                }
                _ = flush_tick.tick() => {
                    self.try_flush().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.blocked_until = None;
        self.try_flush().await;

        let summary = self.summary();
        info!(
            "Metric pipeline stopped for {}: {} sampled, {} flushed, {} dropped, {} pending",
            self.host, summary.sampled, summary.flushed, summary.dropped, summary.pending
        );
        summary
    }
}
