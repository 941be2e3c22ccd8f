//! Storage interfaces consumed by the executor, plus in-memory implementations.

use crate::{
    errors::Result,
    types::{Key, StoreKey, StoreValue},
};
use std::{collections::BTreeMap, ops::Bound};

/// Ordered `(key, value)` stream returned by store iterators.
pub type KVIterator<'a, V> = Box<dyn Iterator<Item = (Key, V)> + 'a>;

/// An ordered key-value store.
///
/// `start` is inclusive and `end` exclusive; `None` leaves that side unbounded.
pub trait KVStore<V: StoreValue> {
    fn get(&self, key: &[u8]) -> Option<V>;

    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    fn set(&mut self, key: &[u8], value: V);

    fn delete(&mut self, key: &[u8]);

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> KVIterator<'_, V>;

    fn reverse_iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> KVIterator<'_, V>;
}

/// A set of named KV stores. Used as the base storage of a block.
pub trait MultiStore<V: StoreValue> {
    type Store: KVStore<V>;

    fn get_kv_store(&self, key: &StoreKey) -> Option<&Self::Store>;

    fn get_kv_store_mut(&mut self, key: &StoreKey) -> Option<&mut Self::Store>;
}

/// What a transaction executor sees: one KV handle per declared store.
///
/// Implemented by the speculative per-transaction view and by the sequential
/// reference runner, so transaction logic can be written once against both.
pub trait MultiView<V: StoreValue> {
    type Store<'s>: KVStore<V>
    where
        Self: 's;

    fn store(&self, key: &StoreKey) -> Result<Self::Store<'_>>;
}

/// In-memory ordered store.
#[derive(Debug, Clone, PartialEq)]
pub struct MemDB<V> {
    data: BTreeMap<Key, V>,
}

impl<V> MemDB<V> {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &V)> {
        self.data.iter()
    }

    fn range<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Option<std::collections::btree_map::Range<'a, Key, V>> {
        if let (Some(start), Some(end)) = (start, end) {
            if start >= end {
                return None;
            }
        }
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Excluded);
        Some(self.data.range::<[u8], _>((lower, upper)))
    }
}

impl<V> Default for MemDB<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: StoreValue> KVStore<V> for MemDB<V> {
    fn get(&self, key: &[u8]) -> Option<V> {
        self.data.get(key).cloned()
    }

    fn set(&mut self, key: &[u8], value: V) {
        self.data.insert(key.to_vec(), value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.data.remove(key);
    }

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> KVIterator<'_, V> {
        match self.range(start, end) {
            Some(range) => Box::new(range.map(|(k, v)| (k.clone(), v.clone()))),
            None => Box::new(std::iter::empty()),
        }
    }

    fn reverse_iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> KVIterator<'_, V> {
        match self.range(start, end) {
            Some(range) => Box::new(range.rev().map(|(k, v)| (k.clone(), v.clone()))),
            None => Box::new(std::iter::empty()),
        }
    }
}

/// In-memory multi-store, one [`MemDB`] per store key.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiMemDB<V> {
    stores: BTreeMap<StoreKey, MemDB<V>>,
}

impl<V> MultiMemDB<V> {
    /// Creates an empty store for every key.
    pub fn new(keys: impl IntoIterator<Item = StoreKey>) -> Self {
        Self {
            stores: keys.into_iter().map(|key| (key, MemDB::new())).collect(),
        }
    }

    pub fn store_keys(&self) -> impl Iterator<Item = &StoreKey> {
        self.stores.keys()
    }
}

impl<V: StoreValue> MultiStore<V> for MultiMemDB<V> {
    type Store = MemDB<V>;

    fn get_kv_store(&self, key: &StoreKey) -> Option<&MemDB<V>> {
        self.stores.get(key)
    }

    fn get_kv_store_mut(&mut self, key: &StoreKey) -> Option<&mut MemDB<V>> {
        self.stores.get_mut(key)
    }
}
