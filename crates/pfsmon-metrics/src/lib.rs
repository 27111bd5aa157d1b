//! # pfsmon-metrics
//!
//! Metric pipeline run by the collector agent on every cluster node.
//!
//! This crate provides:
//! - Samplers for load, memory and filesystem `stats` files
//! - A bounded sample buffer that sheds the oldest samples when full
//! - Sink implementations (HTTP line protocol, in-memory)
//! - The sample/flush loop tying them together

mod buffer;
mod pipeline;
mod sample;
mod sampler;
mod sink;

pub use buffer::SampleBuffer;
pub use pipeline::{MetricPipeline, PipelineStats, PipelineSummary};
pub use sample::MetricSample;
pub use sampler::{
    parse_loadavg, parse_meminfo, parse_stats, LoadAvgSampler, MemInfoSampler, Sampler,
    StatsSampler,
};
pub use sink::{HttpSink, MemorySink, MetricSink};
