//! Multi-version store for a single KV store.
//!
//! Structure: `Key -> (TxnIndex -> SecondaryEntry)`, both levels copy-on-write
//! ordered maps. A read by transaction `t` resolves to the entry with the largest
//! index below `t`.

use crate::{
    btree::BTree,
    iterator::MVIterator,
    types::{IteratorDescriptor, Key, ReadSet, StoreValue, TxnIndex, TxnVersion},
};
use im::OrdMap;
use std::sync::Arc;

/// Entry in the version history of a key.
#[derive(Debug, Clone)]
pub enum SecondaryEntry<V> {
    /// Value written by a specific incarnation. `None` records a deletion.
    Value {
        version: TxnVersion,
        value: Option<V>,
    },
    /// The writer was aborted; its next incarnation will likely write here again.
    Estimate,
}

/// Per-key version history.
pub type Secondary<V> = BTree<TxnIndex, SecondaryEntry<V>>;

/// Immutable snapshot of the outer map.
pub type OuterSnapshot<V> = Arc<OrdMap<Key, Arc<Secondary<V>>>>;

/// Result of reading from the multi-version store.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult<V> {
    /// Latest write below the reader. `None` value means deleted.
    Versioned(TxnVersion, Option<V>),
    /// No lower transaction wrote the key, read base storage.
    Storage,
    /// The latest lower write is an estimate of this transaction.
    Dependency(TxnIndex),
}

/// Resolves the entry a reader at `txn` observes in `secondary`.
pub(crate) fn resolve<V: Clone>(secondary: &Secondary<V>, txn: TxnIndex) -> ReadResult<V> {
    if txn == 0 {
        return ReadResult::Storage;
    }
    match secondary.reverse_seek(&(txn - 1)) {
        None => ReadResult::Storage,
        Some((_, SecondaryEntry::Value { version, value })) => {
            ReadResult::Versioned(version, value)
        }
        Some((blocking, SecondaryEntry::Estimate)) => ReadResult::Dependency(blocking),
    }
}

pub struct MVData<V> {
    data: BTree<Key, Arc<Secondary<V>>>,
}

impl<V: StoreValue> MVData<V> {
    pub fn new() -> Self {
        Self { data: BTree::new() }
    }

    fn secondary(&self, key: &[u8]) -> Arc<Secondary<V>> {
        match self.data.get(key) {
            Some(secondary) => secondary,
            None => self
                .data
                .get_or_default(key.to_vec(), || Arc::new(BTree::new())),
        }
    }

    /// Inserts or overwrites the entry of `version.index` for `key`.
    pub fn write(&self, key: &[u8], value: Option<V>, version: TxnVersion) {
        self.secondary(key)
            .set(version.index, SecondaryEntry::Value { version, value });
    }

    /// Marks the entry of `txn` for `key` as an estimate.
    pub fn write_estimate(&self, key: &[u8], txn: TxnIndex) {
        self.secondary(key).set(txn, SecondaryEntry::Estimate);
    }

    /// Drops the entry of `txn` for `key`. Used when a new incarnation no longer
    /// writes a key, never for semantic deletion.
    pub fn delete(&self, key: &[u8], txn: TxnIndex) {
        if let Some(secondary) = self.data.get(key) {
            secondary.delete(&txn);
        }
    }

    pub fn read(&self, key: &[u8], txn: TxnIndex) -> ReadResult<V> {
        match self.data.get(key) {
            Some(secondary) => resolve(&secondary, txn),
            None => ReadResult::Storage,
        }
    }

    pub fn snapshot(&self) -> OuterSnapshot<V> {
        self.data.snapshot()
    }

    /// Re-reads every descriptor of `read_set` as transaction `txn`. Fails on the first
    /// changed version or estimate.
    pub fn validate_read_set(&self, txn: TxnIndex, read_set: &ReadSet) -> bool {
        let reads_valid = read_set.reads.iter().all(|read| match self.read(&read.key, txn) {
            ReadResult::Dependency(_) => false,
            ReadResult::Storage => read.version.is_none(),
            ReadResult::Versioned(version, _) => read.version == Some(version),
        });
        reads_valid
            && read_set
                .iterators
                .iter()
                .all(|descriptor| self.validate_iterator(txn, descriptor))
    }

    /// Replays a recorded iteration up to its stop key and compares the produced
    /// `(key, version)` sequence with the recorded one.
    fn validate_iterator(&self, txn: TxnIndex, descriptor: &IteratorDescriptor) -> bool {
        let mut replay = MVIterator::new(self.snapshot(), descriptor.options.clone(), txn, None)
            .with_stop(descriptor.stop.clone());

        let mut expected = descriptor.reads.iter();
        while let Some((key, version, _)) = replay.next_entry() {
            match expected.next() {
                Some(read) if read.key == key && read.version == Some(version) => {}
                _ => return false,
            }
        }
        !replay.read_estimate() && expected.next().is_none()
    }

    /// Latest entry of every key, in key order. Keys whose history was emptied by
    /// re-executions are skipped.
    pub fn latest_entries(&self) -> impl Iterator<Item = (Key, SecondaryEntry<V>)> {
        self.data
            .iter()
            .filter_map(|(key, secondary)| secondary.max().map(|(_, entry)| (key, entry)))
    }
}

impl<V: StoreValue> Default for MVData<V> {
    fn default() -> Self {
        Self::new()
    }
}
