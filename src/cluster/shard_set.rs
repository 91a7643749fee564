//! Fixed-width shard bitset.

use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A set of shard ids backed by a bitset.
///
/// Iteration is always in ascending shard order.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardSet {
    words: Vec<u64>,
}

impl ShardSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The set `0..max_shards`.
    pub fn full(max_shards: u32) -> Self {
        (0..max_shards).collect()
    }

    fn locate(shard: ShardId) -> (usize, u64) {
        ((shard / 64) as usize, 1u64 << (shard % 64))
    }

    /// Add a shard. Returns false if it was already present.
    pub fn insert(&mut self, shard: ShardId) -> bool {
        let (word, bit) = Self::locate(shard);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let present = self.words[word] & bit != 0;
        self.words[word] |= bit;
        !present
    }

    /// Remove a shard. Returns true if it was present.
    pub fn remove(&mut self, shard: ShardId) -> bool {
        let (word, bit) = Self::locate(shard);
        match self.words.get_mut(word) {
            Some(w) if *w & bit != 0 => {
                *w &= !bit;
                self.trim();
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        let (word, bit) = Self::locate(shard);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Shards in ascending order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = ShardId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            let base = i as u32 * 64;
            (0..64u32)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| base + bit)
        })
    }

    /// Highest shard id, if any.
    pub fn max(&self) -> Option<ShardId> {
        self.iter().next_back()
    }

    pub fn union(&self, other: &ShardSet) -> ShardSet {
        let mut words = vec![0; self.words.len().max(other.words.len())];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.words.get(i).copied().unwrap_or(0) | other.words.get(i).copied().unwrap_or(0);
        }
        let mut set = ShardSet { words };
        set.trim();
        set
    }

    pub fn intersection(&self, other: &ShardSet) -> ShardSet {
        let mut set = ShardSet {
            words: self
                .words
                .iter()
                .zip(&other.words)
                .map(|(a, b)| a & b)
                .collect(),
        };
        set.trim();
        set
    }

    pub fn difference(&self, other: &ShardSet) -> ShardSet {
        let mut set = ShardSet {
            words: self
                .words
                .iter()
                .enumerate()
                .map(|(i, w)| w & !other.words.get(i).copied().unwrap_or(0))
                .collect(),
        };
        set.trim();
        set
    }

    /// True if no shard is in both sets.
    pub fn is_disjoint(&self, other: &ShardSet) -> bool {
        self.words.iter().zip(&other.words).all(|(a, b)| a & b == 0)
    }

    // Keeps equality independent of how the set was built.
    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

impl FromIterator<ShardId> for ShardSet {
    fn from_iter<I: IntoIterator<Item = ShardId>>(iter: I) -> Self {
        let mut set = ShardSet::new();
        for shard in iter {
            set.insert(shard);
        }
        set
    }
}

impl Extend<ShardId> for ShardSet {
    fn extend<I: IntoIterator<Item = ShardId>>(&mut self, iter: I) {
        for shard in iter {
            self.insert(shard);
        }
    }
}

impl fmt::Debug for ShardSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_contains() {
        let mut set = ShardSet::new();
        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.insert(70));
        assert!(set.contains(70));
        assert_eq!(set.len(), 2);
        assert!(set.remove(70));
        assert!(!set.remove(70));
        assert_eq!(set, [3].into_iter().collect());
    }

    #[test]
    fn test_iteration_is_ascending() {
        let set: ShardSet = [65, 2, 127, 0].into_iter().collect();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2, 65, 127]);
        assert_eq!(set.max(), Some(127));
        assert_eq!(set.iter().rev().next(), Some(127));
    }

    #[test]
    fn test_set_algebra() {
        let a: ShardSet = (0..10).collect();
        let b: ShardSet = (5..70).collect();
        assert_eq!(a.union(&b), (0..70).collect());
        assert_eq!(a.intersection(&b), (5..10).collect());
        assert_eq!(a.difference(&b), (0..5).collect());
        assert!(!a.is_disjoint(&b));
        assert!(a.difference(&b).is_disjoint(&b));
        assert_eq!(ShardSet::full(72).len(), 72);
    }
}
