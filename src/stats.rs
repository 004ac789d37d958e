//! Timing diagnostics for synthesis and GPU uploads.

use std::collections::VecDeque;
use std::time::Duration;

/// Running average over the last `window` samples.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    window: usize,
    samples: VecDeque<Duration>,
    sum: Duration,
}

impl RollingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
            sum: Duration::ZERO,
        }
    }

    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == self.window {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum = self.sum.saturating_sub(evicted);
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as u32)
        }
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

/// Per-upload timing: whole-run min/max plus a windowed running average.
#[derive(Debug, Clone)]
pub struct UploadStats {
    pub count: u64,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    average: RollingAverage,
}

impl UploadStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            min: None,
            max: None,
            average: RollingAverage::new(1000),
        }
    }

    pub fn record(&mut self, sample: Duration) {
        self.count += 1;
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
        self.max = Some(self.max.map_or(sample, |m| m.max(sample)));
        self.average.record(sample);
    }

    pub fn average(&self) -> Option<Duration> {
        self.average.average()
    }
}

impl Default for UploadStats {
    fn default() -> Self {
        Self::new()
    }
}
