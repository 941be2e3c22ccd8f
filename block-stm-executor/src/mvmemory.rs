//! Multi-version memory: one [`MVData`] per declared store plus the latest
//! written-locations and read-set of every transaction.

use crate::{
    errors::{BlockStmError, Result},
    mvdata::{MVData, SecondaryEntry},
    mvview::MVView,
    scheduler::Scheduler,
    store::{KVStore, MultiStore},
    types::{MultiLocations, MultiReadSet, StoreSlots, StoreValue, TxnIndex, TxnVersion},
    utils::diff_ordered_list,
};
use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct MVMemory<V> {
    block_size: usize,
    stores: StoreSlots,
    data: Vec<MVData<V>>,
    /// Keys written by the latest recorded incarnation of each transaction.
    last_written_locations: Vec<CachePadded<ArcSwap<MultiLocations>>>,
    /// Reads of the latest recorded incarnation of each transaction.
    last_read_set: Vec<CachePadded<ArcSwap<MultiReadSet>>>,
}

impl<V: StoreValue> MVMemory<V> {
    /// Creates the memory for a block.
    ///
    /// `estimates`, indexed by transaction, seeds the written-locations of each
    /// transaction and immediately turns them into estimates, so that readers wait on
    /// the likely writer from the start.
    pub fn new(
        block_size: usize,
        stores: StoreSlots,
        estimates: Option<Vec<MultiLocations>>,
    ) -> Result<Self> {
        let mvm = Self {
            block_size,
            data: (0..stores.len()).map(|_| MVData::new()).collect(),
            stores,
            last_written_locations: (0..block_size)
                .map(|_| CachePadded::new(ArcSwap::from_pointee(MultiLocations::new())))
                .collect(),
            last_read_set: (0..block_size)
                .map(|_| CachePadded::new(ArcSwap::from_pointee(MultiReadSet::new())))
                .collect(),
        };

        if let Some(estimates) = estimates {
            if estimates.len() != block_size {
                return Err(BlockStmError::InvalidArgument(format!(
                    "{} estimates for a block of {} transactions",
                    estimates.len(),
                    block_size
                )));
            }
            for (txn_idx, mut locations) in estimates.into_iter().enumerate() {
                if let Some(slot) = locations.keys().find(|slot| **slot >= mvm.stores.len()) {
                    return Err(BlockStmError::InvalidArgument(format!(
                        "estimate of txn {txn_idx} names unknown store slot {slot}"
                    )));
                }
                locations.retain(|_, keys| {
                    keys.sort();
                    keys.dedup();
                    !keys.is_empty()
                });
                mvm.last_written_locations[txn_idx].store(Arc::new(locations));
                mvm.convert_writes_to_estimates(txn_idx as TxnIndex);
            }
        }
        Ok(mvm)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn stores(&self) -> &StoreSlots {
        &self.stores
    }

    pub fn data(&self, slot: usize) -> &MVData<V> {
        &self.data[slot]
    }

    /// Fresh view for one incarnation of `txn_idx`.
    pub fn view<'a, S: MultiStore<V>>(
        &'a self,
        txn_idx: TxnIndex,
        scheduler: &'a Scheduler,
        storage: &'a S,
        cancel: &'a CancellationToken,
    ) -> MVView<'a, V, S> {
        MVView::new(txn_idx, self, scheduler, storage, cancel)
    }

    /// Publishes the writes and reads of a finished incarnation.
    ///
    /// Keys the previous incarnation wrote but this one did not are removed. Returns
    /// whether this incarnation wrote a key the previous one did not.
    pub fn record<S: MultiStore<V>>(&self, version: TxnVersion, view: &MVView<'_, V, S>) -> bool {
        let txn_idx = version.index as usize;
        let new_locations = view.apply_write_set(version);
        let prev_locations = self.last_written_locations[txn_idx].load_full();

        let mut wrote_new_location = false;
        let slots = prev_locations.keys().chain(new_locations.keys());
        let mut visited = Vec::new();
        for &slot in slots {
            if visited.contains(&slot) {
                continue;
            }
            visited.push(slot);

            let prev = prev_locations.get(&slot).map_or(&[][..], Vec::as_slice);
            let new = new_locations.get(&slot).map_or(&[][..], Vec::as_slice);
            let (added, removed) = diff_ordered_list(prev, new);
            for key in removed {
                self.data[slot].delete(key, version.index);
            }
            wrote_new_location |= !added.is_empty();
        }

        self.last_written_locations[txn_idx].store(Arc::new(new_locations));
        self.last_read_set[txn_idx].store(Arc::new(view.take_read_set()));
        wrote_new_location
    }

    /// Turns every entry written by the latest incarnation of `txn_idx` into an
    /// estimate.
    pub fn convert_writes_to_estimates(&self, txn_idx: TxnIndex) {
        let locations = self.last_written_locations[txn_idx as usize].load();
        for (&slot, keys) in locations.iter() {
            for key in keys {
                self.data[slot].write_estimate(key, txn_idx);
            }
        }
    }

    /// Re-checks the latest recorded read-set of `txn_idx` against the current state.
    pub fn validate_read_set(&self, txn_idx: TxnIndex) -> bool {
        let read_set = self.last_read_set[txn_idx as usize].load();
        read_set
            .iter()
            .all(|(&slot, reads)| self.data[slot].validate_read_set(txn_idx, reads))
    }

    /// Writes the latest value of every key to `storage`.
    ///
    /// Refuses to write anything if an estimate is left in any store. Returns the
    /// [`value_len`](StoreValue::value_len) total of the values set.
    pub fn write_snapshot<S: MultiStore<V>>(&self, storage: &mut S) -> Result<usize> {
        for (slot, data) in self.data.iter().enumerate() {
            if let Some((key, _)) = data
                .latest_entries()
                .find(|(_, entry)| matches!(entry, SecondaryEntry::Estimate))
            {
                return Err(BlockStmError::ResidualEstimate { slot, key });
            }
        }

        let mut written_bytes = 0;
        for (slot, store_key) in self.stores.iter() {
            let store = storage
                .get_kv_store_mut(store_key)
                .ok_or_else(|| BlockStmError::UnknownStore(store_key.clone()))?;
            let (mut sets, mut deletes, mut bytes) = (0usize, 0usize, 0usize);
            for (key, entry) in self.data[slot].latest_entries() {
                match entry {
                    SecondaryEntry::Value { value: Some(value), .. } => {
                        bytes += value.value_len();
                        store.set(&key, value);
                        sets += 1;
                    }
                    SecondaryEntry::Value { value: None, .. } => {
                        store.delete(&key);
                        deletes += 1;
                    }
                    SecondaryEntry::Estimate => {}
                }
            }
            debug!(store = %store_key, sets, deletes, bytes, "wrote store snapshot");
            written_bytes += bytes;
        }
        Ok(written_bytes)
    }
}
