//! Bounded FIFO of samples awaiting delivery

use std::collections::VecDeque;

use crate::sample::MetricSample;

/// Bounded sample queue
///
/// Never holds more than `capacity` samples; pushing into a full buffer
/// evicts the oldest sample and counts it as dropped.
#[derive(Debug)]
pub struct SampleBuffer {
    samples: VecDeque<MetricSample>,
    capacity: usize,
    dropped: u64,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            dropped: 0,
        }
    }

    /// Append a sample; returns true if an older sample was evicted
    pub fn push(&mut self, sample: MetricSample) -> bool {
        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front();
            self.dropped += 1;
            true
        } else {
            false
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn extend(&mut self, samples: impl IntoIterator<Item = MetricSample>) {
        for sample in samples {
            self.push(sample);
        }
    }

    /// Copy of the oldest `n` samples, left in place until `consume`
    pub fn peek(&self, n: usize) -> Vec<MetricSample> {
        self.samples.iter().take(n).cloned().collect()
    }

    /// Remove the oldest `n` samples
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.samples.len());
        self.samples.drain(..n);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
