//! Testing utilities for the runtime and the cluster layer.
//!
//! [`TestCluster`] wires a set of in-process nodes together over a
//! [`LocalNetwork`]: every node gets its own handler registry, dispatcher,
//! shard table and router. Shard ownership is driven by running the
//! [`DefaultShardAllocationStrategy`] across the whole cluster, and failures
//! are injected with partitions.
//!
//! # Example
//!
//! ```rust,ignore
//! use strand::testing::TestCluster;
//! use strand::runtime::{Async, SnapshotCodec};
//!
//! let cluster = TestCluster::new(3, SnapshotCodec::new())?;
//! cluster.settle()?;
//!
//! for node in cluster.nodes() {
//!     node.registry.register_route::<u32, u32, _>("double", |v| Async::result(v * 2))?;
//! }
//!
//! let doubled: u32 = cluster.node(1).unwrap().router.route("double", "key-7", &21).join()?;
//! assert_eq!(doubled, 42);
//!
//! cluster.isolate_node(3);
//! // requests owned by node 3 now time out
//! cluster.heal_partitions();
//! ```


use crate::cluster::{
    ClusterDispatcher, ClusterRouter, DefaultShardAllocationStrategy, HandlerRegistry,
    LocalNetwork, NodeShards, ShardAllocationStrategy, ShardRebalance, ShardTable,
};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::metrics::ClusterMetrics;
use crate::runtime::SnapshotCodec;
use crate::types::NodeId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Rebalance rounds [`TestCluster::settle`] runs before giving up.
const MAX_SETTLE_ROUNDS: usize = 8;

/// Install a tracing subscriber for tests. Safe to call from every test.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// One in-process node of a [`TestCluster`].
#[derive(Debug)]
pub struct TestNode {
    pub node_id: NodeId,
    pub registry: Arc<HandlerRegistry>,
    pub dispatcher: Arc<ClusterDispatcher>,
    pub shards: Arc<ShardTable>,
    pub router: ClusterRouter,
    pub metrics: Arc<ClusterMetrics>,
}

/// A cluster of in-process nodes for integration testing.
#[derive(Debug)]
pub struct TestCluster {
    /// Network connecting the nodes.
    pub network: Arc<LocalNetwork>,
    nodes: BTreeMap<NodeId, TestNode>,
    template: ClusterConfig,
    codec: Arc<SnapshotCodec>,
    strategy: DefaultShardAllocationStrategy,
    started_at: Instant,
}

impl TestCluster {
    /// Nodes `1..=node_count` with default cluster settings.
    pub fn new(node_count: usize, codec: SnapshotCodec) -> Result<Self> {
        Self::with_config(node_count, ClusterConfig::default(), codec)
    }

    /// Nodes `1..=node_count`; `template` supplies everything but the node
    /// id.
    pub fn with_config(node_count: usize, template: ClusterConfig, codec: SnapshotCodec) -> Result<Self> {
        template.validate()?;
        let mut cluster = Self {
            network: LocalNetwork::new(),
            nodes: BTreeMap::new(),
            template,
            codec: Arc::new(codec),
            strategy: DefaultShardAllocationStrategy::new(),
            started_at: Instant::now(),
        };
        for node_id in 1..=node_count as NodeId {
            cluster.add_node(node_id)?;
        }
        if let Some(first) = cluster.nodes.values().next() {
            first.shards.set_leader(true);
        }
        info!(nodes = node_count, max_shards = cluster.template.max_shards, "test cluster started");
        Ok(cluster)
    }

    /// Start a new node. It owns nothing until the next rebalance.
    ///
    /// The new node's shard table learns the current owners from an
    /// existing node.
    pub fn add_node(&mut self, node_id: NodeId) -> Result<&TestNode> {
        if self.nodes.contains_key(&node_id) {
            return Err(Error::Config(format!("node {} already exists", node_id)));
        }
        let config = ClusterConfig {
            node_id,
            ..self.template.clone()
        };
        let metrics = Arc::new(ClusterMetrics::default());
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Arc::new(
            ClusterDispatcher::builder(node_id, registry.clone())
                .codec(self.codec.clone())
                .metrics(metrics.clone())
                .build(),
        );
        let shards = Arc::new(ShardTable::new(node_id, config.max_shards, metrics.clone())?);
        if let Some(peer) = self.nodes.values().next() {
            let known = ShardRebalance {
                to_stop: BTreeMap::new(),
                to_start: self
                    .nodes
                    .keys()
                    .map(|&n| (n, peer.shards.shards_of(n)))
                    .collect(),
            };
            shards.apply_rebalance(&known);
        }
        let router = ClusterRouter::new(
            config,
            shards.clone(),
            Arc::new(self.network.transport(node_id)),
            self.codec.clone(),
            metrics.clone(),
        )?;

        self.network.register(dispatcher.clone());
        debug!(node_id, "test node added");
        Ok(self.nodes.entry(node_id).or_insert(TestNode {
            node_id,
            registry,
            dispatcher,
            shards,
            router,
            metrics,
        }))
    }

    /// Stop a node. Its shards become unassigned on every remaining node.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<TestNode> {
        let node = self.nodes.remove(&node_id)?;
        self.network.deregister(node_id);
        let held = node.shards.shards_of(node_id);
        for other in self.nodes.values() {
            other.shards.release(node_id, &held);
        }
        debug!(node_id, released = held.len(), "test node removed");
        Some(node)
    }

    pub fn node(&self, node_id: NodeId) -> Option<&TestNode> {
        self.nodes.get(&node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TestNode> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// What every node currently reports to the leader.
    pub fn reports(&self) -> BTreeMap<NodeId, NodeShards> {
        self.nodes
            .iter()
            .map(|(&id, node)| (id, node.shards.local_shards()))
            .collect()
    }

    /// Run one rebalance round: compute moves, apply them on every node,
    /// then complete every stop.
    pub fn rebalance(&self) -> Result<ShardRebalance> {
        let rebalance = self
            .strategy
            .rebalance(&self.reports(), self.template.max_shards)?;
        for node in self.nodes.values() {
            node.shards.apply_rebalance(&rebalance);
        }
        for (&stopping_node, node) in &self.nodes {
            let stopping = node.shards.local_shards().stopping;
            if stopping.is_empty() {
                continue;
            }
            for other in self.nodes.values() {
                other.shards.release(stopping_node, &stopping);
            }
        }
        Ok(rebalance)
    }

    /// Rebalance until nothing moves. Returns the number of rounds that
    /// moved shards.
    pub fn settle(&self) -> Result<usize> {
        for round in 0..MAX_SETTLE_ROUNDS {
            if self.rebalance()?.is_empty() {
                debug!(rounds = round, "test cluster settled");
                return Ok(round);
            }
        }
        Err(Error::Internal(format!(
            "shards still moving after {} rebalance rounds",
            MAX_SETTLE_ROUNDS
        )))
    }

    /// Partition a node from every other node.
    pub fn isolate_node(&self, node_id: NodeId) {
        self.network.isolate(node_id);
    }

    /// Heal all partitions.
    pub fn heal_partitions(&self) {
        self.network.heal();
    }

    /// Time since the cluster was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
