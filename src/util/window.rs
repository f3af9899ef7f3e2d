//! Fixed-capacity sliding window of samples with O(1) running mean

use std::collections::VecDeque;

/// Rolling window over the most recent `capacity` samples
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    /// Push a sample, evicting the oldest once full
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    /// Mean of the retained samples (0 when empty)
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    /// Largest retained sample
    pub fn max(&self) -> f64 {
        self.samples.iter().copied().fold(0.0, f64::max)
    }

    /// Value at the given percentile (0.0-1.0)
    pub fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = (sorted.len() as f64 * p) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
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

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }

    /// Change the capacity, keeping the newest samples
    pub fn resize(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
        self.sum = self.samples.iter().sum();
        self.capacity = capacity;
    }
}
