//! Configuration types for executors and the cluster layer.

use crate::error::{Error, Result};
use crate::types::NodeId;
use std::time::Duration;

/// Configuration for an [`AsyncExecutor`](crate::runtime::AsyncExecutor) and
/// the thread pool behind it.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Logical name, used in logs and as the thread name prefix.
    pub name: String,

    /// Number of worker threads when the executor owns a [`ThreadPool`](crate::runtime::ThreadPool).
    pub worker_threads: usize,

    /// Whether `Async::join` may block a thread of this executor.
    ///
    /// Disable for pools that must never block.
    pub allow_blocking_join: bool,

    /// Stack size for worker threads, if different from the platform default.
    pub thread_stack_size: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "strand".to_string(),
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            allow_blocking_join: true,
            thread_stack_size: None,
        }
    }
}

impl ExecutorConfig {
    /// Create a new executor config with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the number of worker threads.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Forbid blocking joins on this executor's threads.
    pub fn non_blocking(mut self) -> Self {
        self.allow_blocking_join = false;
        self
    }

    /// Set the worker thread stack size.
    pub fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = Some(size);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("executor name must not be empty".into()));
        }
        if self.worker_threads == 0 {
            return Err(Error::Config(format!(
                "executor {} needs at least one worker thread",
                self.name
            )));
        }
        Ok(())
    }
}

/// Cluster layer configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Total number of shards (fixed at cluster creation).
    pub max_shards: u32,

    /// Default timeout for routed requests.
    pub route_timeout: Duration,

    /// Hash seed for shard key hashing.
    pub hash_seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            max_shards: 72,
            route_timeout: Duration::from_secs(30),
            hash_seed: 0x5AFE_CAFE_DEAD_BEEF,
        }
    }
}

impl ClusterConfig {
    /// Create a new config for the given node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the total shard count.
    pub fn with_max_shards(mut self, max_shards: u32) -> Self {
        self.max_shards = max_shards;
        self
    }

    /// Set the route timeout.
    pub fn with_route_timeout(mut self, timeout: Duration) -> Self {
        self.route_timeout = timeout;
        self
    }

    /// Set the hash seed.
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.hash_seed = seed;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_shards == 0 {
            return Err(Error::Config("max_shards must be positive".into()));
        }
        if self.route_timeout.is_zero() {
            return Err(Error::Config("route_timeout must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_config_builder() {
        let config = ExecutorConfig::new("io")
            .with_worker_threads(2)
            .non_blocking();
        assert_eq!(config.name, "io");
        assert_eq!(config.worker_threads, 2);
        assert!(!config.allow_blocking_join);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_executor_config_rejects_zero_threads() {
        let config = ExecutorConfig::new("io").with_worker_threads(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_cluster_config_validation() {
        assert!(ClusterConfig::new(1).validate().is_ok());
        assert!(ClusterConfig::new(1).with_max_shards(0).validate().is_err());
        assert!(ClusterConfig::new(1)
            .with_route_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
