//! Shard bookkeeping for one node.
//!
//! The [`ShardTable`] keeps two views:
//!
//! - the cluster-wide owner of every shard, used by the router to pick a
//!   target node;
//! - this node's own [`NodeShards`] (owned and stopping), reported back to
//!   the leader for the next rebalance.
//!
//! Applying a [`ShardRebalance`] updates both and notifies
//! [`ShardListener`]s when the local owned set changes.

use super::allocation::{NodeShards, ShardRebalance};
use super::listener::{LeadershipListener, ShardListener};
use super::shard_set::ShardSet;
use crate::error::{Error, Result};
use crate::metrics::ClusterMetrics;
use crate::types::{NodeId, ShardId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

struct TableState {
    /// Index is the shard id.
    owners: Vec<Option<NodeId>>,
    local: NodeShards,
}

/// Shard ownership as seen by one node.
pub struct ShardTable {
    node_id: NodeId,
    max_shards: u32,
    state: RwLock<TableState>,
    leader: AtomicBool,
    shard_listeners: RwLock<Vec<Arc<dyn ShardListener>>>,
    leadership_listeners: RwLock<Vec<Arc<dyn LeadershipListener>>>,
    metrics: Arc<ClusterMetrics>,
}

impl ShardTable {
    pub fn new(node_id: NodeId, max_shards: u32, metrics: Arc<ClusterMetrics>) -> Result<Self> {
        if max_shards == 0 {
            return Err(Error::Config("max_shards must be positive".into()));
        }
        Ok(Self {
            node_id,
            max_shards,
            state: RwLock::new(TableState {
                owners: vec![None; max_shards as usize],
                local: NodeShards::default(),
            }),
            leader: AtomicBool::new(false),
            shard_listeners: RwLock::new(Vec::new()),
            leadership_listeners: RwLock::new(Vec::new()),
            metrics,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn max_shards(&self) -> u32 {
        self.max_shards
    }

    /// Current owner of `shard`. Stopping shards keep their owner until
    /// released.
    pub fn owner_of(&self, shard: ShardId) -> Option<NodeId> {
        self.state
            .read()
            .owners
            .get(shard as usize)
            .copied()
            .flatten()
    }

    /// Shards owned by `node` in the cluster-wide view.
    pub fn shards_of(&self, node: NodeId) -> ShardSet {
        self.state
            .read()
            .owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == Some(node))
            .map(|(shard, _)| shard as ShardId)
            .collect()
    }

    /// This node's owned and stopping shards.
    pub fn local_shards(&self) -> NodeShards {
        self.state.read().local.clone()
    }

    pub fn owns(&self, shard: ShardId) -> bool {
        self.state.read().local.owned.contains(shard)
    }

    /// Apply one rebalance pass.
    ///
    /// Started shards get their new owner everywhere. Stopped shards keep
    /// their owner until [`release`](Self::release) is called for them.
    pub fn apply_rebalance(&self, rebalance: &ShardRebalance) {
        let (old, new) = {
            let mut state = self.state.write();
            for (&node, shards) in &rebalance.to_start {
                for shard in shards.iter() {
                    if let Some(owner) = state.owners.get_mut(shard as usize) {
                        *owner = Some(node);
                    }
                }
            }

            let stop = rebalance.stops_for(self.node_id);
            let start = rebalance.starts_for(self.node_id);
            let old = state.local.owned.clone();
            let owned = old.difference(&stop).union(&start);
            let stopping = state.local.stopping.union(&stop).difference(&start);
            state.local = NodeShards::new(owned.clone(), stopping);
            (old, owned)
        };

        self.metrics.rebalances.inc();
        self.metrics.owned_shards.set(new.len() as i64);
        debug!(
            node_id = self.node_id,
            owned = new.len(),
            stopping = self.local_shards().stopping.len(),
            "applied rebalance"
        );
        if old != new {
            self.notify_shards(&old, &new);
        }
    }

    /// Mark stopped shards of `node` as released, returning them to the
    /// unassigned pool.
    pub fn release(&self, node: NodeId, shards: &ShardSet) {
        let mut state = self.state.write();
        for shard in shards.iter() {
            if let Some(owner) = state.owners.get_mut(shard as usize) {
                if *owner == Some(node) {
                    *owner = None;
                }
            }
        }
        if node == self.node_id {
            state.local.stopping = state.local.stopping.difference(shards);
        }
        debug!(node_id = node, released = shards.len(), "released stopped shards");
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Record a leadership change. Listeners only hear about actual changes.
    pub fn set_leader(&self, is_leader: bool) {
        if self.leader.swap(is_leader, Ordering::AcqRel) == is_leader {
            return;
        }
        info!(node_id = self.node_id, is_leader, "leadership changed");
        let listeners = self.leadership_listeners.read().clone();
        for listener in listeners {
            listener.on_leadership_changed(is_leader);
        }
    }

    pub fn add_shard_listener(&self, listener: impl ShardListener + 'static) {
        self.shard_listeners.write().push(Arc::new(listener));
    }

    pub fn add_leadership_listener(&self, listener: impl LeadershipListener + 'static) {
        self.leadership_listeners.write().push(Arc::new(listener));
    }

    fn notify_shards(&self, old: &ShardSet, new: &ShardSet) {
        let listeners = self.shard_listeners.read().clone();
        for listener in listeners {
            listener.on_shards_changed(old, new);
        }
    }
}

impl std::fmt::Debug for ShardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ShardTable")
            .field("node_id", &self.node_id)
            .field("max_shards", &self.max_shards)
            .field("local", &state.local)
            .field("leader", &self.is_leader())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::allocation::{DefaultShardAllocationStrategy, ShardAllocationStrategy};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    fn table(node: NodeId) -> ShardTable {
        ShardTable::new(node, 12, Arc::new(ClusterMetrics::default())).unwrap()
    }

    #[test]
    fn test_apply_rebalance_sets_owners() {
        let table = table(1);
        let nodes: BTreeMap<_, _> = [(1, NodeShards::default()), (2, NodeShards::default())].into();
        let rebalance = DefaultShardAllocationStrategy::new().rebalance(&nodes, 12).unwrap();
        table.apply_rebalance(&rebalance);

        // Equal deficits alternate, lowest node id first.
        assert_eq!(table.local_shards().owned, (0..12).step_by(2).collect());
        assert_eq!(table.shards_of(2), (1..12).step_by(2).collect());
        assert_eq!(table.owner_of(4), Some(1));
        assert_eq!(table.owner_of(11), Some(2));
        assert_eq!(table.owner_of(40), None);
        assert_eq!(table.metrics.owned_shards.get(), 6);
    }

    #[test]
    fn test_stop_then_release() {
        let table = table(1);
        let mut rebalance = ShardRebalance::default();
        rebalance.to_start.insert(1, (0..4).collect());
        table.apply_rebalance(&rebalance);

        let mut shrink = ShardRebalance::default();
        shrink.to_stop.insert(1, [2, 3].into_iter().collect());
        table.apply_rebalance(&shrink);
        let local = table.local_shards();
        assert_eq!(local.owned, (0..2).collect());
        assert_eq!(local.stopping, (2..4).collect());
        assert_eq!(table.owner_of(3), Some(1));

        table.release(1, &[2, 3].into_iter().collect());
        assert!(table.local_shards().stopping.is_empty());
        assert_eq!(table.owner_of(3), None);
    }

    #[test]
    fn test_shard_listener_sees_old_and_new() {
        let table = table(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        table.add_shard_listener(move |old: &ShardSet, new: &ShardSet| {
            sink.lock().push((old.len(), new.len()));
        });

        let mut rebalance = ShardRebalance::default();
        rebalance.to_start.insert(1, (0..3).collect());
        table.apply_rebalance(&rebalance);
        // nothing moves for this node
        let mut other = ShardRebalance::default();
        other.to_start.insert(2, (3..6).collect());
        table.apply_rebalance(&other);

        assert_eq!(*seen.lock(), vec![(0, 3)]);
    }

    #[test]
    fn test_leadership_listener_on_change_only() {
        let table = table(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        table.add_leadership_listener(move |is_leader: bool| sink.lock().push(is_leader));

        table.set_leader(true);
        table.set_leader(true);
        table.set_leader(false);
        assert_eq!(*seen.lock(), vec![true, false]);
        assert!(!table.is_leader());
    }

    #[test]
    fn test_zero_shards_rejected() {
        let result = ShardTable::new(1, 0, Arc::new(ClusterMetrics::default()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
