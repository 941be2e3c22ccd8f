//! Per-transaction view over the multi-version memory.
//!
//! A view belongs to one incarnation and one worker. Reads fall through the local
//! write buffer, then the multi-version store at the transaction's index, then base
//! storage, and every read that leaves the buffer is recorded. Writes stay in the
//! buffer until [`MVMemory::record`] publishes them.

use crate::{
    errors::{BlockStmError, Result},
    iterator::{MVIterator, MergeIterator, WaitFn},
    mvdata::ReadResult,
    mvmemory::MVMemory,
    scheduler::Scheduler,
    store::{KVIterator, KVStore, MultiStore, MultiView},
    types::{
        key_beyond, IteratorDescriptor, IteratorOptions, Key, MultiLocations, MultiReadSet,
        ReadDescriptor, ReadSet, StoreKey, StoreValue, TxnIndex, TxnVersion,
    },
};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    ops::Bound,
    rc::Rc,
};
use tokio_util::sync::CancellationToken;

struct ViewState<V> {
    /// Buffered writes per slot. `None` is a deletion.
    writes: Vec<BTreeMap<Key, Option<V>>>,
    reads: Vec<ReadSet>,
}

pub struct MVView<'a, V: StoreValue, S: MultiStore<V>> {
    txn_idx: TxnIndex,
    mvm: &'a MVMemory<V>,
    scheduler: &'a Scheduler,
    storage: &'a S,
    cancel: &'a CancellationToken,
    state: RefCell<ViewState<V>>,
    /// Set once a dependency wait was abandoned. The incarnation's reads are
    /// meaningless from then on and it must not be recorded.
    cancelled: Cell<bool>,
}

impl<'a, V: StoreValue, S: MultiStore<V>> MVView<'a, V, S> {
    pub(crate) fn new(
        txn_idx: TxnIndex,
        mvm: &'a MVMemory<V>,
        scheduler: &'a Scheduler,
        storage: &'a S,
        cancel: &'a CancellationToken,
    ) -> Self {
        let num_stores = mvm.stores().len();
        Self {
            txn_idx,
            mvm,
            scheduler,
            storage,
            cancel,
            state: RefCell::new(ViewState {
                writes: (0..num_stores).map(|_| BTreeMap::new()).collect(),
                reads: vec![ReadSet::default(); num_stores],
            }),
            cancelled: Cell::new(false),
        }
    }

    pub fn txn_index(&self) -> TxnIndex {
        self.txn_idx
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Parks the transaction until `blocking_txn_idx` finishes executing. Returns
    /// `false` if the block was cancelled instead; no new suspension starts after
    /// cancellation was observed.
    fn wait_for(&self, blocking_txn_idx: TxnIndex) -> bool {
        if self.cancel.is_cancelled() {
            self.cancelled.set(true);
            return false;
        }
        match self.scheduler.wait_for_dependency(self.txn_idx, blocking_txn_idx) {
            None => true,
            Some(cond) if cond.wait(self.cancel) => true,
            Some(_) => {
                self.cancelled.set(true);
                false
            }
        }
    }

    fn record_read(&self, slot: usize, key: &[u8], version: Option<TxnVersion>) {
        self.state.borrow_mut().reads[slot].reads.push(ReadDescriptor {
            key: key.to_vec(),
            version,
        });
    }

    fn get(&self, slot: usize, base: &S::Store, key: &[u8]) -> Option<V> {
        if let Some(value) = self.state.borrow().writes[slot].get(key) {
            return value.clone();
        }
        if self.cancelled.get() {
            return None;
        }

        loop {
            match self.mvm.data(slot).read(key, self.txn_idx) {
                ReadResult::Dependency(blocking_txn_idx) => {
                    if !self.wait_for(blocking_txn_idx) {
                        return None;
                    }
                }
                ReadResult::Storage => {
                    self.record_read(slot, key, None);
                    return base.get(key);
                }
                ReadResult::Versioned(version, value) => {
                    self.record_read(slot, key, Some(version));
                    return value;
                }
            }
        }
    }

    fn write(&self, slot: usize, key: &[u8], value: Option<V>) {
        self.state.borrow_mut().writes[slot].insert(key.to_vec(), value);
    }

    /// Merged iteration over base storage, the multi-version store and the write
    /// buffer. The buffer is captured when the iterator is created.
    fn iterator<'v>(
        &'v self,
        slot: usize,
        base: &'a S::Store,
        options: IteratorOptions,
    ) -> KVIterator<'v, V> {
        let ascending = options.ascending;
        let (start, end) = (options.start.as_deref(), options.end.as_deref());

        let base_iter = if ascending {
            base.iterator(start, end)
        } else {
            base.reverse_iterator(start, end)
        }
        .map(|(key, value)| (key, Some(value)));

        let recorded = Rc::new(RefCell::new(Vec::new()));
        let wait: WaitFn<'v> = Box::new(move |blocking_txn_idx| self.wait_for(blocking_txn_idx));
        let mv_iter = MVIterator::new(
            self.mvm.data(slot).snapshot(),
            options.clone(),
            self.txn_idx,
            Some(wait),
        )
        .map({
            let recorded = recorded.clone();
            move |(key, version, value)| {
                recorded.borrow_mut().push(ReadDescriptor {
                    key: key.clone(),
                    version: Some(version),
                });
                (key, value)
            }
        });

        let writes = self.buffered_range(slot, &options);
        let merged = MergeIterator::new(
            MergeIterator::new(base_iter, mv_iter, ascending),
            writes.into_iter(),
            ascending,
        );

        Box::new(ViewIterator {
            inner: Box::new(merged),
            view: self,
            slot,
            options,
            recorded,
            last_key: None,
            exhausted: false,
        })
    }

    fn buffered_range(&self, slot: usize, options: &IteratorOptions) -> Vec<(Key, Option<V>)> {
        if let (Some(start), Some(end)) = (&options.start, &options.end) {
            if start >= end {
                return Vec::new();
            }
        }
        let lower = options.start.as_deref().map_or(Bound::Unbounded, Bound::Included);
        let upper = options.end.as_deref().map_or(Bound::Unbounded, Bound::Excluded);

        let state = self.state.borrow();
        let range = state.writes[slot].range::<[u8], _>((lower, upper));
        let entries = range.map(|(key, value)| (key.clone(), value.clone()));
        if options.ascending {
            entries.collect()
        } else {
            entries.rev().collect()
        }
    }

    /// Writes the buffered writes into the multi-version memory at `version`. Returns
    /// the sorted written keys per store.
    pub(crate) fn apply_write_set(&self, version: TxnVersion) -> MultiLocations {
        let state = self.state.borrow();
        let mut locations = MultiLocations::new();
        for (slot, writes) in state.writes.iter().enumerate() {
            if writes.is_empty() {
                continue;
            }
            let data = self.mvm.data(slot);
            for (key, value) in writes {
                data.write(key, value.clone(), version);
            }
            locations.insert(slot, writes.keys().cloned().collect());
        }
        locations
    }

    /// Takes the recorded reads of every store that saw any.
    pub(crate) fn take_read_set(&self) -> MultiReadSet {
        let reads = std::mem::take(&mut self.state.borrow_mut().reads);
        reads
            .into_iter()
            .enumerate()
            .filter(|(_, read_set)| !read_set.is_empty())
            .collect()
    }
}

impl<'a, V: StoreValue, S: MultiStore<V>> MultiView<V> for MVView<'a, V, S> {
    type Store<'s> = StoreView<'s, 'a, V, S> where Self: 's;

    fn store(&self, key: &StoreKey) -> Result<StoreView<'_, 'a, V, S>> {
        let slot = self
            .mvm
            .stores()
            .slot(key)
            .ok_or_else(|| BlockStmError::UnknownStore(key.clone()))?;
        let base = self
            .storage
            .get_kv_store(key)
            .ok_or_else(|| BlockStmError::UnknownStore(key.clone()))?;
        Ok(StoreView {
            view: self,
            slot,
            base,
        })
    }
}

/// KV facade of one store inside a transaction view.
pub struct StoreView<'v, 'a, V: StoreValue, S: MultiStore<V>> {
    view: &'v MVView<'a, V, S>,
    slot: usize,
    base: &'a S::Store,
}

impl<V: StoreValue, S: MultiStore<V>> KVStore<V> for StoreView<'_, '_, V, S> {
    fn get(&self, key: &[u8]) -> Option<V> {
        self.view.get(self.slot, self.base, key)
    }

    fn set(&mut self, key: &[u8], value: V) {
        self.view.write(self.slot, key, Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.view.write(self.slot, key, None);
    }

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> KVIterator<'_, V> {
        self.view
            .iterator(self.slot, self.base, IteratorOptions::new(start, end, true))
    }

    fn reverse_iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> KVIterator<'_, V> {
        self.view
            .iterator(self.slot, self.base, IteratorOptions::new(start, end, false))
    }
}

/// Iterator handed to the transaction. Records an [`IteratorDescriptor`] when dropped.
struct ViewIterator<'v, 'a, V: StoreValue, S: MultiStore<V>> {
    inner: Box<dyn Iterator<Item = (Key, Option<V>)> + 'v>,
    view: &'v MVView<'a, V, S>,
    slot: usize,
    options: IteratorOptions,
    /// Multi-version entries pulled by the merge, possibly ahead of the caller.
    recorded: Rc<RefCell<Vec<ReadDescriptor>>>,
    /// Last key returned to the caller.
    last_key: Option<Key>,
    exhausted: bool,
}

impl<V: StoreValue, S: MultiStore<V>> Iterator for ViewIterator<'_, '_, V, S> {
    type Item = (Key, V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        for (key, value) in self.inner.by_ref() {
            if let Some(value) = value {
                self.last_key = Some(key.clone());
                return Some((key, value));
            }
        }
        self.exhausted = true;
        None
    }
}

impl<V: StoreValue, S: MultiStore<V>> Drop for ViewIterator<'_, '_, V, S> {
    fn drop(&mut self) {
        if self.view.is_cancelled() {
            return;
        }

        let mut reads = self.recorded.take();
        let stop = if self.exhausted {
            None
        } else {
            // Nothing observed, nothing to validate.
            let Some(stop) = self.last_key.take() else {
                return;
            };
            // The merge may have pulled entries past the last key the caller saw.
            reads.retain(|read| !key_beyond(&read.key, &stop, self.options.ascending));
            Some(stop)
        };

        self.view.state.borrow_mut().reads[self.slot]
            .iterators
            .push(IteratorDescriptor {
                options: self.options.clone(),
                stop,
                reads,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MultiMemDB, types::StoreSlots};

    struct Fixture {
        storage: MultiMemDB<Vec<u8>>,
        scheduler: Scheduler,
        mvm: MVMemory<Vec<u8>>,
        cancel: CancellationToken,
        key: StoreKey,
    }

    impl Fixture {
        fn new(block_size: usize, base: &[(&str, &str)]) -> Self {
            let key = StoreKey::new("main");
            let mut storage = MultiMemDB::new([key.clone()]);
            let store = storage.get_kv_store_mut(&key).unwrap();
            for (k, v) in base {
                store.set(k.as_bytes(), v.as_bytes().to_vec());
            }
            Self {
                storage,
                scheduler: Scheduler::new(block_size),
                mvm: MVMemory::new(block_size, StoreSlots::new([key.clone()]), None).unwrap(),
                cancel: CancellationToken::new(),
                key,
            }
        }

        fn view(&self, txn_idx: TxnIndex) -> MVView<'_, Vec<u8>, MultiMemDB<Vec<u8>>> {
            self.mvm.view(txn_idx, &self.scheduler, &self.storage, &self.cancel)
        }

        fn write(&self, txn_idx: TxnIndex, entries: &[(&str, Option<&str>)]) {
            let view = self.view(txn_idx);
            {
                let mut store = view.store(&self.key).unwrap();
                for (k, v) in entries {
                    match v {
                        Some(v) => store.set(k.as_bytes(), v.as_bytes().to_vec()),
                        None => store.delete(k.as_bytes()),
                    }
                }
            }
            self.mvm.record(TxnVersion::new(txn_idx, 0), &view);
        }
    }

    fn collect(iter: KVIterator<'_, Vec<u8>>) -> Vec<(String, String)> {
        iter.map(|(k, v)| (String::from_utf8(k).unwrap(), String::from_utf8(v).unwrap()))
            .collect()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_unknown_store() {
        let fixture = Fixture::new(1, &[]);
        let view = fixture.view(0);
        assert!(matches!(
            view.store(&StoreKey::new("other")),
            Err(BlockStmError::UnknownStore(_))
        ));
    }

    #[test]
    fn test_reads_layer_buffer_mv_and_base() {
        let fixture = Fixture::new(3, &[("a", "base"), ("b", "base")]);
        fixture.write(0, &[("b", Some("mv"))]);

        let view = fixture.view(2);
        let mut store = view.store(&fixture.key).unwrap();
        assert_eq!(store.get(b"a"), Some(b"base".to_vec()));
        assert_eq!(store.get(b"b"), Some(b"mv".to_vec()));

        store.set(b"a", b"own".to_vec());
        store.delete(b"b");
        assert_eq!(store.get(b"a"), Some(b"own".to_vec()));
        assert!(!store.has(b"b"));

        // Only the reads that left the buffer are recorded.
        let read_set = view.take_read_set();
        let reads = &read_set[&0].reads;
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].version, None);
        assert_eq!(reads[1].version, Some(TxnVersion::new(0, 0)));
    }

    #[test]
    fn test_iterator_merges_three_layers() {
        let fixture = Fixture::new(3, &[("a", "base"), ("c", "base"), ("e", "base")]);
        fixture.write(0, &[("b", Some("mv")), ("c", None), ("d", Some("mv"))]);

        let view = fixture.view(1);
        let mut store = view.store(&fixture.key).unwrap();
        store.set(b"d", b"own".to_vec());
        store.delete(b"e");

        assert_eq!(
            collect(store.iterator(None, None)),
            pairs(&[("a", "base"), ("b", "mv"), ("d", "own")])
        );
        assert_eq!(
            collect(store.reverse_iterator(None, Some(b"d".as_slice()))),
            pairs(&[("b", "mv"), ("a", "base")])
        );
    }

    #[test]
    fn test_iterator_descriptor_stop_key() {
        let fixture = Fixture::new(3, &[]);
        fixture.write(0, &[("a", Some("1")), ("b", Some("1")), ("c", Some("1"))]);

        let view = fixture.view(2);
        {
            let store = view.store(&fixture.key).unwrap();
            let mut iter = store.iterator(None, None);
            assert_eq!(iter.next().map(|(k, _)| k), Some(b"a".to_vec()));
        }
        {
            let store = view.store(&fixture.key).unwrap();
            assert_eq!(store.iterator(Some(b"b".as_slice()), None).count(), 2);
        }
        {
            // Never advanced: no descriptor.
            let store = view.store(&fixture.key).unwrap();
            let _iter = store.iterator(None, None);
        }

        let read_set = view.take_read_set();
        let iterators = &read_set[&0].iterators;
        assert_eq!(iterators.len(), 2);

        // Stopped after `a`.
        assert_eq!(iterators[0].stop, Some(b"a".to_vec()));
        assert_eq!(iterators[0].reads.len(), 1);

        assert_eq!(iterators[1].stop, None);
        assert_eq!(iterators[1].reads.len(), 2);
    }

    #[test]
    fn test_lookahead_reads_are_not_recorded() {
        let fixture = Fixture::new(2, &[("a", "base")]);
        fixture.write(0, &[("b", Some("mv"))]);

        let view = fixture.view(1);
        {
            let store = view.store(&fixture.key).unwrap();
            let mut iter = store.iterator(None, None);
            assert_eq!(iter.next().map(|(k, _)| k), Some(b"a".to_vec()));
        }

        let read_set = view.take_read_set();
        let descriptor = &read_set[&0].iterators[0];
        assert_eq!(descriptor.stop, Some(b"a".to_vec()));
        assert!(descriptor.reads.is_empty());
    }

    #[test]
    fn test_partial_iteration_ignores_writes_past_stop() {
        let fixture = Fixture::new(3, &[]);
        fixture.write(0, &[("a", Some("1")), ("c", Some("1"))]);

        let view = fixture.view(2);
        {
            let store = view.store(&fixture.key).unwrap();
            let mut iter = store.iterator(None, None);
            iter.next();
        }
        fixture.mvm.record(TxnVersion::new(2, 0), &view);
        assert!(fixture.mvm.validate_read_set(2));

        fixture.write(1, &[("b", Some("2"))]);
        assert!(fixture.mvm.validate_read_set(2));

        fixture.write(1, &[("a", Some("2"))]);
        assert!(!fixture.mvm.validate_read_set(2));
    }

    #[test]
    fn test_cancelled_view_does_not_wait() {
        let fixture = Fixture::new(2, &[("k", "base")]);
        fixture.mvm.data(0).write_estimate(b"k", 0);
        fixture.cancel.cancel();

        let view = fixture.view(1);
        let store = view.store(&fixture.key).unwrap();
        assert_eq!(store.get(b"k"), None);
        assert!(view.is_cancelled());
        store.iterator(None, None).for_each(drop);
        assert!(view.take_read_set().is_empty());
    }
}
