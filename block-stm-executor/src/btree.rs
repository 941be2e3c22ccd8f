//! Copy-on-write ordered map.
//!
//! Readers take a snapshot of the root once and then work on an immutable tree.
//! Writers clone the current root (O(1), the tree is persistent and shares
//! structure), mutate the clone and publish it with a compare-and-swap, retrying
//! if another writer won the race.

use arc_swap::ArcSwap;
use im::OrdMap;
use std::{borrow::Borrow, ops::Bound, sync::Arc};

pub struct BTree<K, V> {
    root: ArcSwap<OrdMap<K, V>>,
}

impl<K: Ord + Clone, V: Clone> BTree<K, V> {
    pub fn new() -> Self {
        Self {
            root: ArcSwap::from_pointee(OrdMap::new()),
        }
    }

    /// Returns an independent handle in O(1). Later mutations through one handle are
    /// not visible through the other.
    pub fn copy(&self) -> Self {
        Self {
            root: ArcSwap::new(self.root.load_full()),
        }
    }

    /// Immutable view of the current state.
    pub fn snapshot(&self) -> Arc<OrdMap<K, V>> {
        self.root.load_full()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.root.load().get(key).cloned()
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn set(&self, key: K, value: V) -> Option<V> {
        let mut prev = None;
        self.root.rcu(|current| {
            let mut next = OrdMap::clone(current);
            prev = next.insert(key.clone(), value.clone());
            next
        });
        prev
    }

    /// Removes `key`, returning the removed value.
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        if !self.root.load().contains_key(key) {
            return None;
        }
        let mut prev = None;
        self.root.rcu(|current| {
            let mut next = OrdMap::clone(current);
            prev = next.remove(key);
            next
        });
        prev
    }

    /// Atomic insert-if-absent. Returns the value stored under `key` afterwards,
    /// whichever writer created it.
    pub fn get_or_default(&self, key: K, fill: impl Fn() -> V) -> V {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let mut stored = None;
        self.root.rcu(|current| {
            let mut next = OrdMap::clone(current);
            match current.get(&key) {
                Some(value) => stored = Some(value.clone()),
                None => {
                    let value = fill();
                    next.insert(key.clone(), value.clone());
                    stored = Some(value);
                }
            }
            next
        });
        stored.expect("rcu runs the update closure at least once")
    }

    /// Visits entries in ascending order until `cb` returns false.
    pub fn scan(&self, mut cb: impl FnMut(&K, &V) -> bool) {
        let snapshot = self.snapshot();
        for (key, value) in snapshot.iter() {
            if !cb(key, value) {
                break;
            }
        }
    }

    /// Largest entry.
    pub fn max(&self) -> Option<(K, V)> {
        self.root.load().get_max().cloned()
    }

    /// Largest entry whose key is `<= pivot`.
    pub fn reverse_seek(&self, pivot: &K) -> Option<(K, V)> {
        self.root
            .load()
            .range((Bound::Unbounded, Bound::Included(pivot.clone())))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Owning iterator over a snapshot, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> {
        OrdMap::clone(&self.snapshot()).into_iter()
    }

    pub fn len(&self) -> usize {
        self.root.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.load().is_empty()
    }
}

impl<K: Ord + Clone, V: Clone> Default for BTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
