//! Errors surfaced by the block executor.

use crate::types::{Key, StoreKey};

/// Result alias used across the crate.
pub type Result<T, E = BlockStmError> = std::result::Result<T, E>;

/// Engine-level failures. Transaction-level failures are not errors here: they are
/// recorded by the transaction executor as the outcome of the transaction.
#[derive(Debug, thiserror::Error)]
pub enum BlockStmError {
    /// Rejected before any parallel work started.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The cancellation token fired before every transaction committed.
    #[error("block execution cancelled")]
    Cancelled,

    /// Workers exited without committing the whole block and nobody cancelled.
    #[error("scheduler did not complete the block")]
    BlockIncomplete,

    /// A worker thread panicked, the block was aborted.
    #[error("block-stm worker panicked")]
    WorkerPanicked,

    /// An estimate survived until the final snapshot.
    #[error("residual estimate in store slot {slot} for key {}", hex::encode(.key))]
    ResidualEstimate { slot: usize, key: Key },

    /// The transaction executor asked for a store that was not declared for the block.
    #[error("unknown store: {0}")]
    UnknownStore(StoreKey),
}
