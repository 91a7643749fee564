//! Core identifiers used throughout the crate.

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Shard identifier. Shards are numbered `0..max_shards`.
pub type ShardId = u32;

/// Identifier of a cluster request, unique per sending router.
pub type RequestId = u64;
