//! Sequential reference execution: every transaction runs directly against the
//! base storage, in index order.

use crate::{
    errors::{BlockStmError, Result},
    store::{KVIterator, KVStore, MultiStore, MultiView},
    types::{StoreKey, StoreValue, TxnIndex},
};
use std::{cell::RefCell, marker::PhantomData};
use tracing::debug;

/// Multi-store view handed to transactions by [`execute_block_sequential`].
pub struct SequentialView<'s, V, S> {
    storage: RefCell<&'s mut S>,
    _value: PhantomData<V>,
}

impl<'s, V: StoreValue, S: MultiStore<V>> SequentialView<'s, V, S> {
    pub fn new(storage: &'s mut S) -> Self {
        Self {
            storage: RefCell::new(storage),
            _value: PhantomData,
        }
    }
}

impl<'s, V: StoreValue, S: MultiStore<V>> MultiView<V> for SequentialView<'s, V, S> {
    type Store<'v> = SequentialStore<'v, 's, V, S> where Self: 'v;

    fn store(&self, key: &StoreKey) -> Result<SequentialStore<'_, 's, V, S>> {
        if self.storage.borrow().get_kv_store(key).is_none() {
            return Err(BlockStmError::UnknownStore(key.clone()));
        }
        Ok(SequentialStore {
            storage: &self.storage,
            key: key.clone(),
            _value: PhantomData,
        })
    }
}

/// One store of a [`SequentialView`]. Writes go straight to the base store.
pub struct SequentialStore<'v, 's, V, S> {
    storage: &'v RefCell<&'s mut S>,
    key: StoreKey,
    _value: PhantomData<V>,
}

impl<V: StoreValue, S: MultiStore<V>> KVStore<V> for SequentialStore<'_, '_, V, S> {
    fn get(&self, key: &[u8]) -> Option<V> {
        let storage = self.storage.borrow();
        storage.get_kv_store(&self.key)?.get(key)
    }

    fn set(&mut self, key: &[u8], value: V) {
        if let Some(store) = self.storage.borrow_mut().get_kv_store_mut(&self.key) {
            store.set(key, value);
        }
    }

    fn delete(&mut self, key: &[u8]) {
        if let Some(store) = self.storage.borrow_mut().get_kv_store_mut(&self.key) {
            store.delete(key);
        }
    }

    // The base store is borrowed per call, so iteration works on a copy of the range.
    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> KVIterator<'_, V> {
        let storage = self.storage.borrow();
        let items: Vec<_> = match storage.get_kv_store(&self.key) {
            Some(store) => store.iterator(start, end).collect(),
            None => Vec::new(),
        };
        Box::new(items.into_iter())
    }

    fn reverse_iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> KVIterator<'_, V> {
        let storage = self.storage.borrow();
        let items: Vec<_> = match storage.get_kv_store(&self.key) {
            Some(store) => store.reverse_iterator(start, end).collect(),
            None => Vec::new(),
        };
        Box::new(items.into_iter())
    }
}

/// Runs `block_size` transactions one after another against `storage`.
pub fn execute_block_sequential<V, S, F>(block_size: usize, storage: &mut S, mut tx_executor: F)
where
    V: StoreValue,
    S: MultiStore<V>,
    F: FnMut(TxnIndex, &SequentialView<'_, V, S>),
{
    let view = SequentialView::new(storage);
    for txn_idx in 0..block_size {
        tx_executor(txn_idx as TxnIndex, &view);
    }
    debug!(block_size, "executed block sequentially");
}
