//! Shard allocation: computing which shards each node should stop and start.
//!
//! The leader runs a [`ShardAllocationStrategy`] whenever membership
//! changes, then sends each node its part of the resulting
//! [`ShardRebalance`]. Nodes first finish stopping shards (they move from
//! `owned` to `stopping`, then drop out entirely), which returns them to the
//! unassigned pool for the next round.

use super::shard_set::ShardSet;
use crate::error::RebalanceError;
use crate::types::{NodeId, ShardId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use tracing::{debug, info};

/// What one node reports about its shards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeShards {
    /// Shards the node serves and keeps.
    pub owned: ShardSet,
    /// Shards the node still holds but is relinquishing.
    pub stopping: ShardSet,
}

impl NodeShards {
    pub fn new(owned: ShardSet, stopping: ShardSet) -> Self {
        Self { owned, stopping }
    }

    /// A node owning `owned` and stopping nothing.
    pub fn owning(owned: impl IntoIterator<Item = ShardId>) -> Self {
        Self {
            owned: owned.into_iter().collect(),
            stopping: ShardSet::new(),
        }
    }
}

/// Per-node shard moves produced by one rebalance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRebalance {
    /// Owned shards each node must stop.
    pub to_stop: BTreeMap<NodeId, ShardSet>,
    /// Shards each node must start (from the pool or its own stopping set).
    pub to_start: BTreeMap<NodeId, ShardSet>,
}

impl ShardRebalance {
    /// True if nothing moves.
    pub fn is_empty(&self) -> bool {
        self.to_stop.values().all(ShardSet::is_empty) && self.to_start.values().all(ShardSet::is_empty)
    }

    /// Shards `node` must stop.
    pub fn stops_for(&self, node: NodeId) -> ShardSet {
        self.to_stop.get(&node).cloned().unwrap_or_default()
    }

    /// Shards `node` must start.
    pub fn starts_for(&self, node: NodeId) -> ShardSet {
        self.to_start.get(&node).cloned().unwrap_or_default()
    }

    /// Node state right after the moves are issued: stopped shards move to
    /// `stopping`, started shards become `owned`.
    pub fn apply(&self, nodes: &BTreeMap<NodeId, NodeShards>) -> BTreeMap<NodeId, NodeShards> {
        nodes
            .iter()
            .map(|(&node, shards)| {
                let stop = self.stops_for(node);
                let start = self.starts_for(node);
                let owned = shards.owned.difference(&stop).union(&start);
                let stopping = shards.stopping.union(&stop).difference(&start);
                (node, NodeShards { owned, stopping })
            })
            .collect()
    }

    fn stop(&mut self, node: NodeId, shard: ShardId) {
        self.to_stop.entry(node).or_default().insert(shard);
    }

    fn start(&mut self, node: NodeId, shard: ShardId) {
        self.to_start.entry(node).or_default().insert(shard);
    }
}

/// Computes a [`ShardRebalance`] from the nodes' reported state.
pub trait ShardAllocationStrategy: Send + Sync {
    fn rebalance(
        &self,
        nodes: &BTreeMap<NodeId, NodeShards>,
        max_shards: u32,
    ) -> Result<ShardRebalance, RebalanceError>;
}

/// Even distribution with stopping-shard affinity.
///
/// 1. Nodes are ordered by id. The first `n - max % n` get `max / n` shards,
///    the rest one more.
/// 2. A node over its target stops its highest-numbered owned shards. A node
///    under target first takes back shards from its own stopping set,
///    lowest first.
/// 3. Shards neither owned nor stopping anywhere form the pool, handed out
///    lowest first to the node with the largest remaining deficit; ties go
///    to the lowest node id.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultShardAllocationStrategy;

impl DefaultShardAllocationStrategy {
    pub fn new() -> Self {
        Self
    }

    fn validate(
        nodes: &BTreeMap<NodeId, NodeShards>,
        max_shards: u32,
    ) -> Result<(), RebalanceError> {
        let mut holder: HashMap<ShardId, NodeId> = HashMap::new();
        for (&node_id, shards) in nodes {
            if let Some(shard_id) = shards.owned.intersection(&shards.stopping).iter().next() {
                return Err(RebalanceError::OwnedAndStopping { node_id, shard_id });
            }
            for shard_id in shards.owned.iter().chain(shards.stopping.iter()) {
                if shard_id >= max_shards {
                    return Err(RebalanceError::ShardOutOfRange {
                        node_id,
                        shard_id,
                        max_shards,
                    });
                }
                if let Some(first) = holder.insert(shard_id, node_id) {
                    return Err(RebalanceError::DuplicateOwnership {
                        shard_id,
                        first,
                        second: node_id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Target shard count per node, in node id order.
    pub fn targets(nodes: impl IntoIterator<Item = NodeId>, max_shards: u32) -> BTreeMap<NodeId, u32> {
        let ids: Vec<NodeId> = nodes.into_iter().collect();
        let n = ids.len() as u32;
        if n == 0 {
            return BTreeMap::new();
        }
        let base = max_shards / n;
        let with_base = n - max_shards % n;
        let mut sorted = ids;
        sorted.sort_unstable();
        sorted
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, if (i as u32) < with_base { base } else { base + 1 }))
            .collect()
    }
}

impl ShardAllocationStrategy for DefaultShardAllocationStrategy {
    fn rebalance(
        &self,
        nodes: &BTreeMap<NodeId, NodeShards>,
        max_shards: u32,
    ) -> Result<ShardRebalance, RebalanceError> {
        if nodes.is_empty() {
            return Ok(ShardRebalance::default());
        }
        Self::validate(nodes, max_shards)?;

        let targets = Self::targets(nodes.keys().copied(), max_shards);
        let mut rebalance = ShardRebalance::default();
        let mut deficits = BinaryHeap::new();

        for (&node, shards) in nodes {
            let target = targets.get(&node).copied().unwrap_or(0) as usize;
            let owned = shards.owned.len();

            if owned > target {
                for shard in shards.owned.iter().rev().take(owned - target) {
                    rebalance.stop(node, shard);
                }
                debug!(node_id = node, owned, target, "node over target");
                continue;
            }

            let mut missing = target - owned;
            for shard in shards.stopping.iter().take(missing) {
                rebalance.start(node, shard);
                missing -= 1;
            }
            if missing > 0 {
                deficits.push((missing, Reverse(node)));
            }
            debug!(node_id = node, owned, target, missing, "node under target");
        }

        let held = nodes
            .values()
            .fold(ShardSet::new(), |acc, s| acc.union(&s.owned).union(&s.stopping));
        let mut pool = (0..max_shards).filter(|shard| !held.contains(*shard));

        while let Some((missing, Reverse(node))) = deficits.pop() {
            let Some(shard) = pool.next() else {
                break;
            };
            rebalance.start(node, shard);
            if missing > 1 {
                deficits.push((missing - 1, Reverse(node)));
            }
        }

        info!(
            nodes = nodes.len(),
            max_shards,
            stops = rebalance.to_stop.values().map(ShardSet::len).sum::<usize>(),
            starts = rebalance.to_start.values().map(ShardSet::len).sum::<usize>(),
            "computed shard rebalance"
        );
        Ok(rebalance)
    }
}
