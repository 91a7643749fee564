//! Bucketed latency histograms.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Route latency buckets, in seconds.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0,
];

/// A histogram over fixed upper bounds. Counts are cumulative per bucket.
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    /// f64 bits.
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram with [`LATENCY_BUCKETS`].
    pub fn new(name: &'static str) -> Self {
        Self::with_bounds(name, LATENCY_BUCKETS)
    }

    /// Create a histogram with ascending `bounds`.
    pub fn with_bounds(name: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            name,
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Record one value.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if value <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a duration in seconds.
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Point-in-time copy.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            sum: f64::from_bits(self.sum.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// Copy of a [`Histogram`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    pub bounds: Vec<f64>,
    /// Observations `<=` each bound.
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl HistogramSnapshot {
    /// Mean of all observations, zero when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Smallest bound covering at least `p` percent of observations.
    pub fn percentile_bound(&self, p: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let target = (self.count as f64 * p / 100.0).ceil() as u64;
        self.bounds
            .iter()
            .zip(&self.counts)
            .find(|(_, count)| **count >= target)
            .map(|(bound, _)| *bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_snapshot() {
        let histogram = Histogram::with_bounds("latency", &[0.01, 0.1, 1.0]);
        histogram.observe(0.005);
        histogram.observe(0.05);
        histogram.observe(0.5);
        histogram.observe(2.0);

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count, 4);
        assert_eq!(snapshot.counts, vec![1, 2, 3]);
        assert!((snapshot.mean() - 0.63875).abs() < 1e-9);
        assert_eq!(snapshot.percentile_bound(50.0), Some(0.1));
        // The largest value is past every bound.
        assert_eq!(snapshot.percentile_bound(100.0), None);
    }
}
