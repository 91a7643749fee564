//! Callbacks for shard ownership and leadership changes.

use super::shard_set::ShardSet;

/// Notified when the set of shards this node owns changes.
pub trait ShardListener: Send + Sync {
    fn on_shards_changed(&self, old: &ShardSet, new: &ShardSet);
}

impl<F> ShardListener for F
where
    F: Fn(&ShardSet, &ShardSet) + Send + Sync,
{
    fn on_shards_changed(&self, old: &ShardSet, new: &ShardSet) {
        self(old, new)
    }
}

/// Notified when this node gains or loses cluster leadership.
pub trait LeadershipListener: Send + Sync {
    fn on_leadership_changed(&self, is_leader: bool);
}

impl<F> LeadershipListener for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_leadership_changed(&self, is_leader: bool) {
        self(is_leader)
    }
}
