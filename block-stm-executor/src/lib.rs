//! Block-STM parallel executor for ordered blocks of transactions.
//!
//! Transactions are executed optimistically in parallel against a multi-version
//! memory layered over the base storage. Every incarnation records what it read;
//! validation re-reads those locations and aborts incarnations that observed a state
//! a lower transaction has since changed. Transactions commit in block order, and the
//! final state is identical to executing the block sequentially.
//!
//! # Core Components
//!
//! - **MVMemory**: one multi-version store per declared KV store, plus the latest
//!   read-set and written locations of every transaction
//! - **MVView**: the per-incarnation view a transaction executes against
//! - **Scheduler**: hands out execution and validation tasks, tracks validation waves
//!   and advances the committed prefix
//! - **ParallelExecutor**: spawns the workers and writes the final snapshot back to
//!   base storage
//!
//! # Example
//!
//! ```rust
//! use block_stm_executor::{
//!     ExecutorConfig, KVStore, MVView, MultiMemDB, MultiStore, MultiView, ParallelExecutor,
//!     StoreKey, StoreSlots,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let bank = StoreKey::new("bank");
//! let stores = StoreSlots::new([bank.clone()]);
//! let mut storage = MultiMemDB::<Vec<u8>>::new([bank.clone()]);
//!
//! let executor = ParallelExecutor::new(ExecutorConfig::with_threads(4));
//! executor
//!     .execute_block(
//!         &CancellationToken::new(),
//!         10,
//!         &stores,
//!         &mut storage,
//!         None,
//!         |txn_idx, view: &MVView<'_, Vec<u8>, _>| {
//!             let mut store = view.store(&bank).unwrap();
//!             let total = store.get(b"total").map_or(0, |v| v[0]);
//!             store.set(b"total", vec![total + txn_idx as u8]);
//!         },
//!     )
//!     .unwrap();
//!
//! let total = storage.get_kv_store(&bank).unwrap().get(b"total");
//! assert_eq!(total, Some(vec![45]));
//! ```

mod armed_lock;
mod btree;
mod condvar;
pub mod counters;
pub mod errors;
pub mod estimate;
pub mod executor;
pub mod iterator;
pub mod mvdata;
pub mod mvmemory;
pub mod mvview;
pub mod scheduler;
pub mod sequential;
pub mod status;
pub mod store;
pub mod types;
mod utils;

#[cfg(test)]
mod tests;

pub use errors::{BlockStmError, Result};
pub use estimate::estimate_block;
pub use executor::{BlockSummary, ExecutorConfig, ParallelExecutor};
pub use mvmemory::MVMemory;
pub use mvview::{MVView, StoreView};
pub use scheduler::{Scheduler, Task};
pub use sequential::{execute_block_sequential, SequentialStore, SequentialView};
pub use store::{KVIterator, KVStore, MemDB, MultiMemDB, MultiStore, MultiView};
pub use types::{
    Incarnation, Key, MultiLocations, ObjectValue, StoreKey, StoreSlots, StoreValue, TxnIndex,
    TxnVersion, Value, Wave,
};
