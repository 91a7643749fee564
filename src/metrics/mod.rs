//! Runtime and cluster metrics.
//!
//! Plain atomic counters, gauges and histograms grouped per component:
//!
//! - [`ExecutorMetrics`]: one per [`AsyncExecutor`](crate::runtime::AsyncExecutor)
//! - [`QueueMetrics`]: one per [`AsyncQueue`](crate::runtime::AsyncQueue)
//! - [`ClusterMetrics`]: shared by a node's router, dispatcher and shard table
//!
//! Every group has a `snapshot()` returning a plain copy for logging or
//! export.
//!
//! # Example
//!
//! ```rust,ignore
//! let executor = AsyncExecutor::thread_per_task("io");
//! // ... run work ...
//! let snapshot = executor.metrics().snapshot();
//! println!("{} tasks, {} panicked", snapshot.tasks_completed, snapshot.tasks_panicked);
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::Counter;
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot, LATENCY_BUCKETS};

use std::time::Duration;

/// Counters for one executor.
#[derive(Debug)]
pub struct ExecutorMetrics {
    /// Coroutines started on the executor.
    pub tasks_spawned: Counter,
    /// Coroutines that ran to completion (including rejections).
    pub tasks_completed: Counter,
    /// Coroutines that panicked.
    pub tasks_panicked: Counter,
    /// Coroutine polls.
    pub polls: Counter,
    /// Wake-ups that led to a new poll being submitted.
    pub wakeups: Counter,
    /// Jobs handed to the host executor.
    pub jobs_submitted: Counter,
}

impl Default for ExecutorMetrics {
    fn default() -> Self {
        Self {
            tasks_spawned: Counter::new("executor_tasks_spawned"),
            tasks_completed: Counter::new("executor_tasks_completed"),
            tasks_panicked: Counter::new("executor_tasks_panicked"),
            polls: Counter::new("executor_polls"),
            wakeups: Counter::new("executor_wakeups"),
            jobs_submitted: Counter::new("executor_jobs_submitted"),
        }
    }
}

impl ExecutorMetrics {
    /// Copy the current values.
    pub fn snapshot(&self) -> ExecutorMetricsSnapshot {
        ExecutorMetricsSnapshot {
            tasks_spawned: self.tasks_spawned.get(),
            tasks_completed: self.tasks_completed.get(),
            tasks_panicked: self.tasks_panicked.get(),
            polls: self.polls.get(),
            wakeups: self.wakeups.get(),
            jobs_submitted: self.jobs_submitted.get(),
        }
    }
}

/// Copy of [`ExecutorMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutorMetricsSnapshot {
    pub tasks_spawned: u64,
    pub tasks_completed: u64,
    pub tasks_panicked: u64,
    pub polls: u64,
    pub wakeups: u64,
    pub jobs_submitted: u64,
}

impl ExecutorMetricsSnapshot {
    /// Coroutines started but not yet finished.
    pub fn in_flight(&self) -> u64 {
        self.tasks_spawned.saturating_sub(self.tasks_completed)
    }
}

/// Counters for one keyed queue.
#[derive(Debug)]
pub struct QueueMetrics {
    pub submitted: Counter,
    pub completed: Counter,
    pub failed: Counter,
    /// Keys with a task in flight.
    pub active_keys: Gauge,
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self {
            submitted: Counter::new("queue_submitted"),
            completed: Counter::new("queue_completed"),
            failed: Counter::new("queue_failed"),
            active_keys: Gauge::new("queue_active_keys"),
        }
    }
}

impl QueueMetrics {
    /// Copy the current values.
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            submitted: self.submitted.get(),
            completed: self.completed.get(),
            failed: self.failed.get(),
            active_keys: self.active_keys.get(),
        }
    }
}

/// Copy of [`QueueMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueMetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub active_keys: i64,
}

/// Cluster routing, dispatch and shard metrics for one node.
#[derive(Debug)]
pub struct ClusterMetrics {
    /// Requests routed from this node.
    pub routes: Counter,
    /// Routed requests that hit their deadline.
    pub route_timeouts: Counter,
    /// Routed requests answered with a remote error.
    pub route_failures: Counter,
    /// Round-trip latency of routed requests.
    pub route_latency: Histogram,
    /// Broadcasts sent.
    pub broadcasts: Counter,
    /// Inbound requests and broadcasts handled.
    pub dispatched: Counter,
    /// Inbound requests answered with an exception.
    pub dispatch_failures: Counter,
    /// Rebalances applied to the shard table.
    pub rebalances: Counter,
    /// Shards owned by this node.
    pub owned_shards: Gauge,
}

impl Default for ClusterMetrics {
    fn default() -> Self {
        Self {
            routes: Counter::new("cluster_routes"),
            route_timeouts: Counter::new("cluster_route_timeouts"),
            route_failures: Counter::new("cluster_route_failures"),
            route_latency: Histogram::new("cluster_route_latency_seconds"),
            broadcasts: Counter::new("cluster_broadcasts"),
            dispatched: Counter::new("cluster_dispatched"),
            dispatch_failures: Counter::new("cluster_dispatch_failures"),
            rebalances: Counter::new("cluster_rebalances"),
            owned_shards: Gauge::new("cluster_owned_shards"),
        }
    }
}

impl ClusterMetrics {
    /// Record the outcome of one routed request.
    pub fn record_route(&self, latency: Duration, timed_out: bool, failed: bool) {
        self.routes.inc();
        if timed_out {
            self.route_timeouts.inc();
        } else if failed {
            self.route_failures.inc();
        }
        self.route_latency.observe_duration(latency);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> ClusterMetricsSnapshot {
        ClusterMetricsSnapshot {
            routes: self.routes.get(),
            route_timeouts: self.route_timeouts.get(),
            route_failures: self.route_failures.get(),
            route_latency: self.route_latency.snapshot(),
            broadcasts: self.broadcasts.get(),
            dispatched: self.dispatched.get(),
            dispatch_failures: self.dispatch_failures.get(),
            rebalances: self.rebalances.get(),
            owned_shards: self.owned_shards.get(),
        }
    }
}

/// Copy of [`ClusterMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMetricsSnapshot {
    pub routes: u64,
    pub route_timeouts: u64,
    pub route_failures: u64,
    pub route_latency: HistogramSnapshot,
    pub broadcasts: u64,
    pub dispatched: u64,
    pub dispatch_failures: u64,
    pub rebalances: u64,
    pub owned_shards: i64,
}

impl ClusterMetricsSnapshot {
    /// Fraction of routed requests that failed or timed out.
    pub fn route_error_rate(&self) -> f64 {
        if self.routes == 0 {
            0.0
        } else {
            (self.route_timeouts + self.route_failures) as f64 / self.routes as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_snapshot() {
        let metrics = ExecutorMetrics::default();
        metrics.tasks_spawned.inc_by(3);
        metrics.tasks_completed.inc();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_spawned, 3);
        assert_eq!(snapshot.in_flight(), 2);
    }

    #[test]
    fn test_cluster_route_recording() {
        let metrics = ClusterMetrics::default();
        metrics.record_route(Duration::from_millis(2), false, false);
        metrics.record_route(Duration::from_millis(30), true, false);
        metrics.record_route(Duration::from_millis(4), false, true);
        metrics.record_route(Duration::from_millis(1), false, false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.routes, 4);
        assert_eq!(snapshot.route_timeouts, 1);
        assert_eq!(snapshot.route_failures, 1);
        assert_eq!(snapshot.route_latency.count, 4);
        assert!((snapshot.route_error_rate() - 0.5).abs() < f64::EPSILON);
    }
}
