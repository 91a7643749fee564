//! Cluster plumbing: shard allocation, envelopes, handlers and routing.
//!
//! ```text
//!   caller                                         owner of shard(key)
//!   ──────                                         ───────────────────
//!   ClusterRouter ── ClusterRequest ──► transport ──► ClusterDispatcher
//!     shard_for_key                                    restore snapshot
//!     ShardTable::owner_of                             user filters
//!     timeout + relay  ◄── ClusterResponse ─────────── HandlerRegistry
//! ```
//!
//! Shard ownership comes from the leader running a
//! [`ShardAllocationStrategy`] and every node applying the resulting
//! [`ShardRebalance`] to its [`ShardTable`].

pub mod allocation;
pub mod dispatcher;
pub mod envelope;
pub mod handler;
pub mod listener;
pub mod router;
pub mod shard_set;
pub mod shards;
pub mod transport;

pub use allocation::{
    DefaultShardAllocationStrategy, NodeShards, ShardAllocationStrategy, ShardRebalance,
};
pub use dispatcher::{ClusterDispatcher, DispatcherBuilder};
pub use envelope::{ClusterBroadcast, ClusterRequest, ClusterResponse, RemoteException};
pub use handler::HandlerRegistry;
pub use listener::{LeadershipListener, ShardListener};
pub use router::ClusterRouter;
pub use shard_set::ShardSet;
pub use shards::ShardTable;
pub use transport::{ClusterTransport, LocalNetwork, LocalTransport};
